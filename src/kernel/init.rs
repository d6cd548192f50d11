/// Kernel initialization phases
use crate::arch;
use crate::boot::MemoryInfo;
use crate::kernel::status::{register_component, update_component_status, InitStatus};
use crate::{interrupts, memory, process, serial_println, syscalls};

const PHASES: [&str; 5] = ["Frames", "Interrupts", "Virtual Memory", "Syscalls", "Scheduler"];

/// Initialize kernel in proper order with error handling.
///
/// Interrupts stay masked until every phase has completed.
pub fn init_kernel(info: &MemoryInfo, phys_offset: u64) -> Result<(), &'static str> {
    for name in PHASES {
        if !register_component(name) {
            return Err("component table full");
        }
    }
    serial_println!("[init] bringing up the kernel core");

    init_phase(1, "Frames", || {
        memory::init_frames(info, phys_offset);
        if memory::FRAMES.lock().free_frames() == 0 {
            return Err("no free physical frames");
        }
        Ok(())
    })?;
    // The handler table is reset here, so this comes before any set_handler.
    init_phase(2, "Interrupts", interrupts::init)?;
    init_phase(3, "Virtual Memory", || memory::init_paging(info))?;
    init_phase(4, "Syscalls", syscalls::init)?;
    init_phase(5, "Scheduler", process::init)?;

    arch::enable_interrupts();
    serial_println!("[init] kernel initialization complete");
    Ok(())
}

pub(crate) fn init_phase(
    step: usize,
    name: &'static str,
    init_fn: impl FnOnce() -> Result<(), &'static str>,
) -> Result<(), &'static str> {
    update_component_status(name, InitStatus::InProgress);
    serial_println!("[{}/{}] Initializing {}...", step, PHASES.len(), name);

    match init_fn() {
        Ok(()) => {
            update_component_status(name, InitStatus::Completed);
            serial_println!("    {} initialized", name);
            Ok(())
        }
        Err(e) => {
            update_component_status(name, InitStatus::Failed(e));
            serial_println!("    {} failed: {}", name, e);
            Err(e)
        }
    }
}
