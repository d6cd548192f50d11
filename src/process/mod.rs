//! Kernel threads.
//!
//! The process-wide [`Scheduler`] sits behind an interrupt-masking lock and
//! is only ever switched from inside the yield/block syscalls and the exit
//! vector, where a trap frame is at hand to rewrite.

pub mod queue;
pub mod scheduler;

use core::sync::atomic::{AtomicBool, Ordering};

pub use scheduler::{Pid, ProcessError, Running, Scheduler, ThreadEntry, WaitQueue};

use crate::arch::{self, TrapFrame};
use crate::config::{BLOCK_SYSCALL, PROC_EXIT_VECTOR, YIELD_SYSCALL};
use crate::memory::KernelStacks;
use crate::sync::IrqMutex;
use crate::syscalls::{self, SyscallError};
use crate::{fatal, serial_println};

static SCHEDULER: IrqMutex<Scheduler> = IrqMutex::new(Scheduler::new());
static READY: AtomicBool = AtomicBool::new(false);

// Status words the scheduler syscalls leave in `rax`.
const STATUS_INVALID_QUEUE: u64 = 1;
const STATUS_NOT_A_THREAD: u64 = 2;
const STATUS_FAILED: u64 = 3;

/// Hooks the scheduler into the syscall gate and the exit vector.
pub fn init() -> Result<(), &'static str> {
    let (code, data) = crate::interrupts::kernel_selectors();
    SCHEDULER.lock().set_selectors(code, data);

    syscalls::register_syscall(YIELD_SYSCALL, yield_syscall, 0).map_err(|_| "yield syscall rejected")?;
    syscalls::register_syscall(BLOCK_SYSCALL, block_syscall, 0).map_err(|_| "block syscall rejected")?;
    crate::interrupts::set_handler(usize::from(PROC_EXIT_VECTOR), exit_isr, 0)
        .map_err(|_| "exit vector rejected")?;

    READY.store(true, Ordering::Release);
    serial_println!("[sched] ready");
    Ok(())
}

fn ensure_ready() -> Result<(), ProcessError> {
    if READY.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(ProcessError::NotInitialized)
    }
}

/// Queues a new kernel thread running `entry(arg)`. Returning from `entry`
/// exits the thread.
pub fn create_kthread(entry: ThreadEntry, arg: usize) -> Result<Pid, ProcessError> {
    ensure_ready()?;
    SCHEDULER
        .lock()
        .create_kthread(&mut KernelStacks, entry, arg, arch::trap::thread_return_address())
        .inspect_err(|err| serial_println!("[sched] create_kthread failed: {}", err))
}

/// Runs the queued threads from the calling (main) context. Comes back once
/// nothing is ready any more.
pub fn run() -> Result<(), ProcessError> {
    yield_now()
}

/// Hands the CPU to the next ready thread. Comes back when the round-robin
/// reaches the caller again.
pub fn yield_now() -> Result<(), ProcessError> {
    ensure_ready()?;
    syscalls::generic_syscall(YIELD_SYSCALL, [0; 3]).map_err(ProcessError::Syscall)
}

/// Parks the calling thread on `queue` until someone unblocks it. An unknown
/// queue, or a call from the main process, fails without switching.
pub fn block_on(queue: WaitQueue) -> Result<(), ProcessError> {
    ensure_ready()?;
    syscalls::generic_syscall(BLOCK_SYSCALL, [queue.0, 0, 0]).map_err(|err| match err {
        SyscallError::Failed(STATUS_INVALID_QUEUE) => ProcessError::InvalidQueue(queue.0),
        SyscallError::Failed(STATUS_NOT_A_THREAD) => ProcessError::NotAThread,
        other => ProcessError::Syscall(other),
    })
}

pub fn unblock_head(queue: WaitQueue) -> Result<Option<Pid>, ProcessError> {
    SCHEDULER.lock().unblock_head(queue)
}

pub fn unblock_all(queue: WaitQueue) -> Result<usize, ProcessError> {
    SCHEDULER.lock().unblock_all(queue)
}

pub fn new_wait_queue() -> WaitQueue {
    SCHEDULER.lock().new_wait_queue()
}

pub fn current_pid() -> Option<Pid> {
    SCHEDULER.lock().current_pid()
}

pub fn process_count() -> usize {
    SCHEDULER.lock().process_count()
}

/// Terminates the calling thread.
pub fn exit() -> ! {
    arch::raise_exit();
    fatal!("exit returned to a dead thread")
}

fn yield_syscall(frame: &mut TrapFrame, _args: [usize; 3], _context: usize) {
    SCHEDULER.lock().yield_current(frame);
}

// A refused block leaves the caller's frame untouched apart from the status.
fn block_syscall(frame: &mut TrapFrame, args: [usize; 3], _context: usize) {
    if let Err(err) = SCHEDULER.lock().block_current(frame, WaitQueue(args[0])) {
        serial_println!("[sched] block_on: {}", err);
        frame.rax = match err {
            ProcessError::InvalidQueue(_) => STATUS_INVALID_QUEUE,
            ProcessError::NotAThread => STATUS_NOT_A_THREAD,
            _ => STATUS_FAILED,
        };
    }
}

fn exit_isr(_vector: u8, _error_code: u64, frame: &mut TrapFrame, _context: usize) {
    let result = SCHEDULER.lock().exit_current(frame, &mut KernelStacks);
    if let Err(err) = result {
        fatal!("exit: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::{self, PhysArena};
    use std::sync::MutexGuard;

    extern "C" fn body(_arg: usize) {}

    /// Global VMM, syscall gate and an empty scheduler, as after boot.
    fn boot() -> (MutexGuard<'static, ()>, &'static PhysArena) {
        let installed = test_support::install(64);
        *SCHEDULER.lock() = Scheduler::new();
        syscalls::init().unwrap();
        init().unwrap();
        installed
    }

    #[test]
    fn test_kthread_before_init_is_refused() {
        let _guard = test_support::lock_globals();
        if READY.load(Ordering::Acquire) {
            return;
        }
        assert_eq!(create_kthread(body, 0), Err(ProcessError::NotInitialized));
        assert_eq!(run(), Err(ProcessError::NotInitialized));
        assert_eq!(block_on(WaitQueue(0)), Err(ProcessError::NotInitialized));
    }

    #[test]
    fn test_yield_now_switches_through_the_gate() {
        let (_guard, _arena) = boot();
        let a = create_kthread(body, 1).unwrap();
        let b = create_kthread(body, 2).unwrap();
        assert_eq!(current_pid(), None);

        yield_now().unwrap();
        assert_eq!(current_pid(), Some(a));
        yield_now().unwrap();
        assert_eq!(current_pid(), Some(b));
        yield_now().unwrap();
        assert_eq!(current_pid(), Some(a));

        // The exit vector hands the committed stack back to the frame pool.
        let free = crate::memory::FRAMES.lock().free_frames();
        let mut frame = TrapFrame::new(PROC_EXIT_VECTOR, 0);
        exit_isr(PROC_EXIT_VECTOR, 0, &mut frame, 0);
        assert_eq!((current_pid(), process_count()), (Some(b), 1));
        assert_eq!(
            crate::memory::FRAMES.lock().free_frames() - free,
            crate::config::KSTACK_SIZE / crate::config::PAGE_SIZE
        );
        test_support::teardown();
    }

    #[test]
    fn test_block_on_parks_until_unblocked() {
        let (_guard, _arena) = boot();
        let queue = new_wait_queue();
        let a = create_kthread(body, 1).unwrap();
        let b = create_kthread(body, 2).unwrap();
        assert_eq!(block_on(queue), Err(ProcessError::NotAThread));

        yield_now().unwrap();
        assert_eq!(current_pid(), Some(a));
        block_on(queue).unwrap();
        assert_eq!(current_pid(), Some(b));

        // Only b is ready: yielding keeps it running.
        yield_now().unwrap();
        assert_eq!(current_pid(), Some(b));

        assert_eq!(unblock_head(queue), Ok(Some(a)));
        assert_eq!(unblock_head(queue), Ok(None));
        yield_now().unwrap();
        assert_eq!(current_pid(), Some(a));
        test_support::teardown();
    }

    #[test]
    fn test_block_on_unknown_queue_fails_without_switching() {
        let (_guard, _arena) = boot();
        let a = create_kthread(body, 1).unwrap();
        assert_eq!(block_on(WaitQueue(7)), Err(ProcessError::InvalidQueue(7)));

        yield_now().unwrap();
        assert_eq!(block_on(WaitQueue(7)), Err(ProcessError::InvalidQueue(7)));
        assert_eq!(current_pid(), Some(a));
        assert_eq!(unblock_all(WaitQueue(7)), Err(ProcessError::InvalidQueue(7)));
        test_support::teardown();
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn test_exit_from_main_halts() {
        let _guard = test_support::lock_globals();
        *SCHEDULER.lock() = Scheduler::new();
        let mut frame = TrapFrame::new(PROC_EXIT_VECTOR, 0);
        exit_isr(PROC_EXIT_VECTOR, 0, &mut frame, 0);
    }
}
