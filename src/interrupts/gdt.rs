// gdt.rs
use core::ptr::addr_of;

use spin::Lazy;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::config::{
    IST_DOUBLE_FAULT, IST_GENERAL_PROTECTION, IST_PAGE_FAULT, IST_PROC_EXIT, IST_STACK_COUNT, IST_STACK_SIZE,
};

#[repr(align(16))]
struct IstStacks([[u8; IST_STACK_SIZE]; IST_STACK_COUNT]);

static mut IST_STACKS: IstStacks = IstStacks([[0; IST_STACK_SIZE]; IST_STACK_COUNT]);

fn ist_top(slot: u8) -> VirtAddr {
    // The TSS table is 0-based, IDT IST fields are 1-based.
    let index = usize::from(slot - 1);
    let start = unsafe { addr_of!(IST_STACKS.0[index]) as u64 };
    VirtAddr::new(start + IST_STACK_SIZE as u64)
}

static TSS: Lazy<TaskStateSegment> = Lazy::new(|| {
    let mut tss = TaskStateSegment::new();
    for slot in [IST_DOUBLE_FAULT, IST_GENERAL_PROTECTION, IST_PAGE_FAULT, IST_PROC_EXIT] {
        tss.interrupt_stack_table[usize::from(slot - 1)] = ist_top(slot);
    }
    tss
});

#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

static GDT: Lazy<(GlobalDescriptorTable, Selectors)> = Lazy::new(|| {
    let mut gdt = GlobalDescriptorTable::new();

    let code_selector = gdt.append(Descriptor::kernel_code_segment());
    let data_selector = gdt.append(Descriptor::kernel_data_segment());
    let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));

    (
        gdt,
        Selectors {
            code_selector,
            data_selector,
            tss_selector,
        },
    )
});

pub fn selectors() -> Selectors {
    GDT.1
}

pub fn init() {
    let (ref gdt, ref selectors) = *GDT;
    gdt.load();

    unsafe {
        use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};

        CS::set_reg(selectors.code_selector);
        DS::set_reg(selectors.data_selector);
        ES::set_reg(selectors.data_selector);
        SS::set_reg(selectors.data_selector);

        x86_64::instructions::tables::load_tss(selectors.tss_selector);
    }
}
