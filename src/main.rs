#![no_std]
#![no_main]

extern crate alloc;
extern crate rlibc;

use bootloader_api::config::Mapping;
use bootloader_api::info::MemoryRegionKind;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use core::panic::PanicInfo;

use nucleus::boot::MemoryInfo;
use nucleus::kernel::init_kernel;
use nucleus::memory::PhysRegion;
use nucleus::{arch, serial, serial_println};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    // Keep the bootloader's own mappings out of the lower half.
    config.mappings.dynamic_range_start = Some(0xFFFF_8000_0000_0000);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

pub fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    serial_println!("nucleus booting");

    let Some(phys_offset) = boot_info.physical_memory_offset.into_option() else {
        serial_println!("bootloader did not map physical memory");
        arch::halt_loop();
    };

    let kernel = PhysRegion::new(boot_info.kernel_addr, boot_info.kernel_len);
    let spans = boot_info
        .memory_regions
        .iter()
        .map(|r| (r.start, r.end, r.kind == MemoryRegionKind::Usable));
    let Some(info) = MemoryInfo::from_spans(spans, kernel) else {
        serial_println!("no usable memory above 1 MiB");
        arch::halt_loop();
    };

    if let Err(e) = init_kernel(&info, phys_offset) {
        serial_println!("Kernel initialization failed: {}", e);
        arch::halt_loop();
    }

    #[cfg(feature = "boot-selftest")]
    {
        let summary = nucleus::test_env::run_all();
        serial_println!("{}", summary);
    }

    serial_println!("nothing left to run, halting");
    arch::halt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("PANIC : {} | {:?}", info.message(), info.location());
    arch::halt_loop()
}
