//! Central kernel configuration constants.
//!
//! ## Virtual address bands
//!
//! | Band               | Base               | Owner                  |
//! |--------------------|--------------------|------------------------|
//! | Identity map       | `0x0`              | physical memory        |
//! | Kernel stacks      | `0x100_0000_0000`  | `alloc_kstack`         |
//! | Reserved growth    | `0x200_0000_0000`  | unused                 |
//! | Kernel heap        | `0xF00_0000_0000`  | `alloc_page` / `kbrk`  |
//! | User space         | `0x1000_0000_0000` | unused (no isolation)  |
//!
//! Every band ends where the next one begins. The bootloader is told to keep
//! its own mappings in the higher half, so the lower half is ours.

/// Architecture page size in bytes.
pub const PAGE_SIZE: usize = 4096;

pub const IDENTITY_MAP_BASE: u64 = 0x0;
pub const KERNEL_STACKS_BASE: u64 = 0x100_0000_0000;
pub const RESERVED_GROWTH_BASE: u64 = 0x200_0000_0000;
pub const KERNEL_HEAP_BASE: u64 = 0xF00_0000_0000;
pub const USER_SPACE_BASE: u64 = 0x1000_0000_0000;

/// Bytes of usable stack per kernel thread.
pub const KSTACK_SIZE: usize = 4 * PAGE_SIZE;
/// Unmapped page left below every kernel stack.
pub const KSTACK_GUARD: usize = PAGE_SIZE;
/// Distance between the returned stack pointer and the end of the range.
pub const KSTACK_TOP_SLACK: usize = 16;

/// Heap payload alignment.
pub const HEAP_ALIGNMENT: usize = 16;
/// Granularity of every region the heap requests through `kbrk`.
pub const HEAP_BLOCK_SIZE: usize = 16 * PAGE_SIZE;

// Exception vectors with dedicated stacks.
pub const DOUBLE_FAULT_VECTOR: u8 = 0x08;
pub const GENERAL_PROTECTION_VECTOR: u8 = 0x0D;
pub const PAGE_FAULT_VECTOR: u8 = 0x0E;

/// Software interrupt used by the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;
/// Software interrupt raised by a kernel thread that is done.
pub const PROC_EXIT_VECTOR: u8 = 0x83;

/// Syscall number of `yield`.
pub const YIELD_SYSCALL: usize = 0x7B;
/// Syscall number of `block_on`.
pub const BLOCK_SYSCALL: usize = 0x7C;
pub const NUM_SYSCALLS: usize = 256;

/// Remapped vector base of the master PIC (IRQ 0-7).
pub const PIC_MASTER_OFFSET: u8 = 0x20;
/// Remapped vector base of the slave PIC (IRQ 8-15).
pub const PIC_SLAVE_OFFSET: u8 = 0x28;

// Hardware IST slots (1-based, 0 means "stay on the current stack").
pub const IST_DOUBLE_FAULT: u8 = 1;
pub const IST_GENERAL_PROTECTION: u8 = 2;
pub const IST_PAGE_FAULT: u8 = 3;
pub const IST_PROC_EXIT: u8 = 4;
pub const IST_STACK_COUNT: usize = 4;
pub const IST_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// RFLAGS interrupt-enable bit.
pub const RFLAGS_IF: u64 = 1 << 9;

/// COM1 base port used for diagnostics.
pub const SERIAL_PORT: u16 = 0x3F8;
