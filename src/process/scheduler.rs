//! Cooperative round-robin scheduler.
//!
//! # Thread lifecycle
//! 1. `create_kthread` allocates a committed kernel stack, seeds it with the exit
//!    trampoline and queues the thread on the all and ready lists
//! 2. `yield_current` saves the trapped frame and loads the next ready thread
//! 3. `block_current` moves the running thread to a wait queue,
//!    `unblock_*` puts it back at the end of the ready list
//! 4. `exit_current` unlinks the thread, loads the next one and frees its stack
//!
//! Every switch happens inside an interrupt handler by rewriting the
//! `TrapFrame` that `iretq` will resume. When nothing is ready the synthetic
//! main process (the boot thread that called `run`) gets the CPU back.

use alloc::vec::Vec;
use core::fmt;

use x86_64::VirtAddr;

use super::queue::{AllProcesses, Blocked, Link, LinkStore, ProcessQueue, Ready, QUEUE_KINDS};
use crate::arch::TrapFrame;
use crate::config::RFLAGS_IF;
use crate::memory::{StackSource, VmError};
use crate::serial_println;
use crate::syscalls::SyscallError;

pub type Pid = u64;

/// Kernel thread body. Receives the argument given to `create_kthread`.
pub type ThreadEntry = extern "C" fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NotInitialized,
    Stack(VmError),
    NoRunnableProcess,
    InvalidQueue(usize),
    NotAThread,
    Syscall(SyscallError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::NotInitialized => write!(f, "scheduler not initialized"),
            ProcessError::Stack(err) => write!(f, "kernel stack: {}", err),
            ProcessError::NoRunnableProcess => write!(f, "no runnable process"),
            ProcessError::InvalidQueue(q) => write!(f, "no wait queue {}", q),
            ProcessError::NotAThread => write!(f, "main process cannot do that"),
            ProcessError::Syscall(err) => write!(f, "{}", err),
        }
    }
}

/// Handle returned by `new_wait_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueue(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Running {
    Main,
    Thread(usize),
}

pub struct Process {
    pub pid: Pid,
    pub context: TrapFrame,
    pub kstack_top: VirtAddr,
    pub blocked_on: Option<WaitQueue>,
    links: [Link; QUEUE_KINDS],
}

#[derive(Default)]
struct ProcessTable {
    slots: Vec<Option<Process>>,
    free: Vec<usize>,
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, process: Process) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(process);
                index
            }
            None => {
                self.slots.push(Some(process));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize) -> Option<Process> {
        let process = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        Some(process)
    }

    fn get(&self, index: usize) -> &Process {
        self.slots[index].as_ref().unwrap_or_else(|| panic!("empty process slot {}", index))
    }

    fn get_mut(&mut self, index: usize) -> &mut Process {
        self.slots[index].as_mut().unwrap_or_else(|| panic!("empty process slot {}", index))
    }
}

impl LinkStore for ProcessTable {
    fn link(&self, index: usize, kind: usize) -> Link {
        self.get(index).links[kind]
    }

    fn link_mut(&mut self, index: usize, kind: usize) -> &mut Link {
        &mut self.get_mut(index).links[kind]
    }
}

pub struct Scheduler {
    table: ProcessTable,
    all: ProcessQueue<AllProcesses>,
    ready: ProcessQueue<Ready>,
    wait_queues: Vec<ProcessQueue<Blocked>>,
    current: Running,
    main: TrapFrame,
    next_pid: Pid,
    code_selector: u16,
    data_selector: u16,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            table: ProcessTable::new(),
            all: ProcessQueue::new(),
            ready: ProcessQueue::new(),
            wait_queues: Vec::new(),
            current: Running::Main,
            main: TrapFrame::new(0, 0),
            next_pid: 1,
            code_selector: 0,
            data_selector: 0,
        }
    }

    pub fn set_selectors(&mut self, code: u16, data: u16) {
        self.code_selector = code;
        self.data_selector = data;
    }

    /// Pid of the running thread, `None` while main runs.
    pub fn current_pid(&self) -> Option<Pid> {
        match self.current {
            Running::Main => None,
            Running::Thread(index) => Some(self.table.get(index).pid),
        }
    }

    pub fn process_count(&self) -> usize {
        self.all.len()
    }

    /// Queues a thread that enters `entry(arg)` with `exit_trampoline` as
    /// its return address. Stack tops are 16-byte aligned, so the entry sees
    /// the stack a `call` would have left it.
    pub fn create_kthread<S: StackSource>(
        &mut self,
        stacks: &mut S,
        entry: ThreadEntry,
        arg: usize,
        exit_trampoline: u64,
    ) -> Result<Pid, ProcessError> {
        let top = stacks.alloc_stack().map_err(ProcessError::Stack)?;
        let return_slot = top - 8u64;
        if let Err(err) = stacks.write_u64(return_slot, exit_trampoline) {
            let _ = stacks.free_stack(top);
            return Err(ProcessError::Stack(err));
        }

        let context = TrapFrame {
            rip: entry as usize as u64,
            rdi: arg as u64,
            rsp: return_slot.as_u64(),
            rflags: RFLAGS_IF,
            cs: u64::from(self.code_selector),
            ss: u64::from(self.data_selector),
            ..TrapFrame::default()
        };

        let pid = self.next_pid;
        self.next_pid += 1;
        let index = self.table.insert(Process {
            pid,
            context,
            kstack_top: top,
            blocked_on: None,
            links: [Link::default(); QUEUE_KINDS],
        });
        self.all.push_back(&mut self.table, index);
        self.ready.push_back(&mut self.table, index);
        serial_println!("[sched] created pid {} (stack top {:#x})", pid, top.as_u64());
        Ok(pid)
    }

    /// Ready thread that follows `index`, wrapping to the head but never
    /// returning `index` itself.
    fn successor(&self, index: usize) -> Option<usize> {
        self.ready
            .next_of(&self.table, index)
            .or_else(|| self.ready.head().filter(|&head| head != index))
    }

    fn save(&mut self, frame: &TrapFrame) {
        match self.current {
            Running::Main => self.main = *frame,
            Running::Thread(index) => self.table.get_mut(index).context = *frame,
        }
    }

    fn load(&mut self, next: Running, frame: &mut TrapFrame) {
        *frame = match next {
            Running::Main => self.main,
            Running::Thread(index) => self.table.get(index).context,
        };
        self.current = next;
    }

    /// Round-robin step: the running thread stays on the ready list.
    pub fn yield_current(&mut self, frame: &mut TrapFrame) {
        let next = match self.current {
            Running::Main => self.ready.head(),
            Running::Thread(index) => self.ready.next_of(&self.table, index).or(self.ready.head()),
        }
        .map_or(Running::Main, Running::Thread);

        if next == self.current {
            return;
        }
        self.save(frame);
        self.load(next, frame);
    }

    /// Ends the running thread. The frame is loaded with the next runnable
    /// context before the dead thread's stack is released.
    pub fn exit_current<S: StackSource>(&mut self, frame: &mut TrapFrame, stacks: &mut S) -> Result<Pid, ProcessError> {
        let Running::Thread(index) = self.current else {
            return Err(ProcessError::NotAThread);
        };
        let next = self.successor(index).map_or(Running::Main, Running::Thread);

        self.ready.unlink(&mut self.table, index);
        self.all.unlink(&mut self.table, index);
        self.load(next, frame);

        let process = self.table.remove(index).ok_or(ProcessError::NoRunnableProcess)?;
        if let Err(err) = stacks.free_stack(process.kstack_top) {
            serial_println!("[sched] pid {}: stack release failed: {}", process.pid, err);
        }
        serial_println!("[sched] pid {} exited", process.pid);
        Ok(process.pid)
    }

    pub fn new_wait_queue(&mut self) -> WaitQueue {
        self.wait_queues.push(ProcessQueue::new());
        WaitQueue(self.wait_queues.len() - 1)
    }

    fn check_queue(&self, queue: WaitQueue) -> Result<(), ProcessError> {
        if queue.0 < self.wait_queues.len() {
            Ok(())
        } else {
            Err(ProcessError::InvalidQueue(queue.0))
        }
    }

    /// Parks the running thread on `queue` and switches away from it.
    pub fn block_current(&mut self, frame: &mut TrapFrame, queue: WaitQueue) -> Result<(), ProcessError> {
        self.check_queue(queue)?;
        let Running::Thread(index) = self.current else {
            return Err(ProcessError::NotAThread);
        };
        let next = self.successor(index).map_or(Running::Main, Running::Thread);

        self.save(frame);
        self.ready.unlink(&mut self.table, index);
        self.wait_queues[queue.0].push_back(&mut self.table, index);
        self.table.get_mut(index).blocked_on = Some(queue);
        self.load(next, frame);
        Ok(())
    }

    /// Moves the oldest waiter on `queue` to the back of the ready list.
    pub fn unblock_head(&mut self, queue: WaitQueue) -> Result<Option<Pid>, ProcessError> {
        self.check_queue(queue)?;
        let Some(index) = self.wait_queues[queue.0].pop_front(&mut self.table) else {
            return Ok(None);
        };
        self.ready.push_back(&mut self.table, index);
        let process = self.table.get_mut(index);
        process.blocked_on = None;
        Ok(Some(process.pid))
    }

    pub fn unblock_all(&mut self, queue: WaitQueue) -> Result<usize, ProcessError> {
        let mut woken = 0;
        while self.unblock_head(queue)?.is_some() {
            woken += 1;
        }
        Ok(woken)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
