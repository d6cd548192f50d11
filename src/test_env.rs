//! # Boot self-test
//!
//! Runs once after initialization on the real machine and exercises the
//! paths unit tests can only simulate: a demand-paged page, the heap behind
//! `alloc`, and a round of kernel threads yielding to each other.
//!
//! Each test prints diagnostics over serial and returns a one-line summary.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::PAGE_SIZE;
use crate::{memory, process, serial_println};

static TEST_EXECUTION_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn test_demand_paging() -> String {
    TEST_EXECUTION_COUNT.fetch_add(1, Ordering::Relaxed);
    let faults_before = memory::page_faults();

    let page = match memory::alloc_page() {
        Ok(page) => page,
        Err(err) => return format!("demand paging: FAIL ({:?})", err),
    };
    if memory::translate(page).is_some() {
        return String::from("demand paging: FAIL (page committed before first touch)");
    }

    let ptr = page.as_mut_ptr::<u64>();
    unsafe {
        ptr.write_volatile(0xC0FF_EE00);
        ptr.add(PAGE_SIZE / 8 - 1).write_volatile(0x1234);
    }
    let value = unsafe { ptr.read_volatile() };
    let faults = memory::page_faults() - faults_before;
    serial_println!("TEST_PAGING: {:#x} -> {:?}, {} fault(s)", page.as_u64(), memory::translate(page), faults);

    let result = if value == 0xC0FF_EE00 && faults == 1 {
        String::from("demand paging: PASS")
    } else {
        format!("demand paging: FAIL (read {:#x}, {} faults)", value, faults)
    };
    if let Err(err) = memory::free_page(page) {
        serial_println!("TEST_PAGING: free_page failed: {:?}", err);
    }
    result
}

pub fn test_heap() -> String {
    TEST_EXECUTION_COUNT.fetch_add(1, Ordering::Relaxed);

    let boxed = Box::new([7u8; 100]);
    let mut numbers: Vec<u64> = Vec::new();
    for i in 0..4096 {
        numbers.push(i);
    }
    let sum: u64 = numbers.iter().sum();
    drop(numbers);

    let stats = memory::allocators::HEAP.lock().stats();
    serial_println!(
        "TEST_HEAP: {} blocks, {} used, {} free",
        stats.blocks,
        stats.used_bytes,
        stats.free_bytes
    );

    if sum == 4095 * 4096 / 2 && boxed.iter().all(|&b| b == 7) {
        String::from("heap: PASS")
    } else {
        String::from("heap: FAIL")
    }
}

const THREADS: usize = 3;
const ROUNDS: usize = 3;

static TRACE: [AtomicUsize; THREADS * ROUNDS] = [const { AtomicUsize::new(usize::MAX) }; THREADS * ROUNDS];
static TRACE_LEN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn round_robin_worker(id: usize) {
    for _ in 0..ROUNDS {
        let slot = TRACE_LEN.fetch_add(1, Ordering::SeqCst);
        if let Some(entry) = TRACE.get(slot) {
            entry.store(id, Ordering::SeqCst);
        }
        if let Err(err) = process::yield_now() {
            serial_println!("TEST_SCHED: worker {} could not yield: {}", id, err);
        }
    }
}

pub fn test_round_robin() -> String {
    TEST_EXECUTION_COUNT.fetch_add(1, Ordering::Relaxed);

    for id in 0..THREADS {
        if let Err(err) = process::create_kthread(round_robin_worker, id) {
            return format!("round robin: FAIL ({})", err);
        }
    }
    if let Err(err) = process::run() {
        return format!("round robin: FAIL ({})", err);
    }

    let trace: Vec<usize> = TRACE.iter().map(|e| e.load(Ordering::SeqCst)).collect();
    serial_println!("TEST_SCHED: order {:?}, {} left", trace, process::process_count());

    let interleaved = trace.iter().enumerate().all(|(i, &id)| id == i % THREADS);
    if interleaved && process::process_count() == 0 {
        String::from("round robin: PASS")
    } else {
        String::from("round robin: FAIL")
    }
}

/// Runs every boot test and returns the summaries, one per line.
pub fn run_all() -> String {
    let results = [test_demand_paging(), test_heap(), test_round_robin()];
    let mut summary = String::new();
    for line in results {
        serial_println!("[selftest] {}", line);
        summary.push_str(&line);
        summary.push('\n');
    }
    serial_println!("[selftest] {} tests run", TEST_EXECUTION_COUNT.load(Ordering::Relaxed));
    summary
}
