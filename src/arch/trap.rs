//! Trap entry: per-vector stubs, the common register save path and the
//! frame layout handed to the Rust dispatcher.
//!
//! ```text
//!  high  ┌──────────────┐
//!        │ ss           │  pushed by the CPU
//!        │ rsp          │
//!        │ rflags       │
//!        │ cs           │
//!        │ rip          │
//!        │ error code   │  CPU, or 0 from the stub
//!        │ vector       │  stub
//!        │ r15 .. rax   │  common path
//!  low   └──────────────┘  <- &mut TrapFrame
//! ```
//!
//! Whatever the dispatcher leaves in the frame is what `iretq` resumes, which
//! is how the scheduler switches threads.

/// Byte distance between two consecutive entry stubs.
pub const STUB_STRIDE: u64 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() == 22 * 8);

impl TrapFrame {
    pub const fn new(vector: u8, error_code: u64) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            vector: vector as u64,
            error_code,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }
}

#[cfg(not(test))]
core::arch::global_asm!(
    r#"
    .pushsection .text.nucleus_isr, "ax"

    .macro nucleus_stub vector, has_error=0
    .p2align 4
    .if \has_error == 0
    pushq $0
    .endif
    pushq $\vector
    jmp nucleus_isr_common
    .endm

    .p2align 4
    .globl nucleus_isr_stubs
nucleus_isr_stubs:
    .irp vector, 0,1,2,3,4,5,6,7
    nucleus_stub \vector
    .endr
    nucleus_stub 8, 1
    nucleus_stub 9
    .irp vector, 10,11,12,13,14
    nucleus_stub \vector, 1
    .endr
    .irp vector, 15,16
    nucleus_stub \vector
    .endr
    nucleus_stub 17, 1
    .irp vector, 18,19,20
    nucleus_stub \vector
    .endr
    nucleus_stub 21, 1
    .irp vector, 22,23,24,25,26,27,28
    nucleus_stub \vector
    .endr
    .irp vector, 29,30
    nucleus_stub \vector, 1
    .endr
    .irp vector, 31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46
    nucleus_stub \vector
    .endr
    .irp vector, 47,48,49,50,51,52,53,54,55,56,57,58,59,60,61,62
    nucleus_stub \vector
    .endr
    .irp vector, 63,64,65,66,67,68,69,70,71,72,73,74,75,76,77,78
    nucleus_stub \vector
    .endr
    .irp vector, 79,80,81,82,83,84,85,86,87,88,89,90,91,92,93,94
    nucleus_stub \vector
    .endr
    .irp vector, 95,96,97,98,99,100,101,102,103,104,105,106,107,108,109,110
    nucleus_stub \vector
    .endr
    .irp vector, 111,112,113,114,115,116,117,118,119,120,121,122,123,124,125,126
    nucleus_stub \vector
    .endr
    .irp vector, 127,128,129,130,131,132,133,134,135,136,137,138,139,140,141,142
    nucleus_stub \vector
    .endr
    .irp vector, 143,144,145,146,147,148,149,150,151,152,153,154,155,156,157,158
    nucleus_stub \vector
    .endr
    .irp vector, 159,160,161,162,163,164,165,166,167,168,169,170,171,172,173,174
    nucleus_stub \vector
    .endr
    .irp vector, 175,176,177,178,179,180,181,182,183,184,185,186,187,188,189,190
    nucleus_stub \vector
    .endr
    .irp vector, 191,192,193,194,195,196,197,198,199,200,201,202,203,204,205,206
    nucleus_stub \vector
    .endr
    .irp vector, 207,208,209,210,211,212,213,214,215,216,217,218,219,220,221,222
    nucleus_stub \vector
    .endr
    .irp vector, 223,224,225,226,227,228,229,230,231,232,233,234,235,236,237,238
    nucleus_stub \vector
    .endr
    .irp vector, 239,240,241,242,243,244,245,246,247,248,249,250,251,252,253,254
    nucleus_stub \vector
    .endr
    .irp vector, 255
    nucleus_stub \vector
    .endr
    .p2align 4
nucleus_isr_common:
    pushq %r15
    pushq %r14
    pushq %r13
    pushq %r12
    pushq %r11
    pushq %r10
    pushq %r9
    pushq %r8
    pushq %rbp
    pushq %rdi
    pushq %rsi
    pushq %rdx
    pushq %rcx
    pushq %rbx
    pushq %rax
    movq %rsp, %rdi
    cld
    call nucleus_trap_entry
    popq %rax
    popq %rbx
    popq %rcx
    popq %rdx
    popq %rsi
    popq %rdi
    popq %rbp
    popq %r8
    popq %r9
    popq %r10
    popq %r11
    popq %r12
    popq %r13
    popq %r14
    popq %r15
    addq $16, %rsp
    iretq

    // Return address of every kernel thread body. `ret` leaves rsp 16-byte
    // aligned here, one word off what a call site expects, so realign and
    // call instead of jumping.
    .p2align 4
    .globl nucleus_thread_return
nucleus_thread_return:
    andq $-16, %rsp
    call nucleus_thread_exit
    ud2
    .popsection
    "#,
    options(att_syntax)
);

#[cfg(not(test))]
extern "C" {
    static nucleus_isr_stubs: [u8; 0];
    fn nucleus_thread_return() -> !;
}

#[cfg(not(test))]
#[no_mangle]
extern "C" fn nucleus_trap_entry(frame: &mut TrapFrame) {
    crate::interrupts::dispatch(frame);
}

#[cfg(not(test))]
#[no_mangle]
extern "C" fn nucleus_thread_exit() -> ! {
    crate::process::exit()
}

/// Where a kernel thread lands when its body returns.
#[cfg(not(test))]
pub fn thread_return_address() -> u64 {
    nucleus_thread_return as usize as u64
}

#[cfg(test)]
pub fn thread_return_address() -> u64 {
    0xFFFF_8000_0030_0000
}

/// Address of the stub for vector 0; vector `n` lives at `base + n * STUB_STRIDE`.
#[cfg(not(test))]
pub fn stub_base() -> u64 {
    unsafe { core::ptr::addr_of!(nucleus_isr_stubs) as u64 }
}

#[cfg(test)]
pub fn stub_base() -> u64 {
    0xFFFF_8000_0020_0000
}
