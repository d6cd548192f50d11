//! # kmalloc
//!
//! First-fit heap over memory obtained through a program break.
//!
//! ```text
//!  region from kbrk
//! ┌────────┬──────────────┬────────┬──────────────────────────┐
//! │ header │ payload      │ header │ payload (free remainder) │
//! └────────┴──────────────┴────────┴──────────────────────────┘
//! ```
//!
//! Headers form an address-ordered singly linked list. A header is
//! `HEADER_SIZE` bytes, its payload `size` bytes, and when two headers are
//! adjacent in the list *and* in memory the distance between them is
//! `HEADER_SIZE + size`. Regions from separate `kbrk` calls are normally
//! contiguous too, but coalescing checks adjacency rather than assuming it.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use super::common::{align_down, align_up, checked_align_up};
use crate::config::{HEAP_ALIGNMENT, HEAP_BLOCK_SIZE, PAGE_SIZE};
use crate::serial_println;

#[repr(C)]
struct BlockHeader {
    size: usize,
    next: Option<NonNull<BlockHeader>>,
    free: bool,
}

pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>(), HEAP_ALIGNMENT);

/// Where the heap gets its memory from.
pub trait ProgramBreak {
    /// Grows the break by `increment` bytes (rounded up to pages by the
    /// implementation) and returns the old break, `kbrk(0)` reads it.
    fn kbrk(&mut self, increment: isize) -> Option<usize>;

    /// Backing for `[start, start + len)` is no longer needed. The range
    /// stays reserved and reads back as zero once touched again.
    fn release(&mut self, start: usize, len: usize);
}

/// Snapshot of one block, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub header: usize,
    pub size: usize,
    pub free: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

pub struct Heap<B> {
    head: Option<NonNull<BlockHeader>>,
    brk: B,
}

// The block list is only reachable through `&mut Heap`.
unsafe impl<B: Send> Send for Heap<B> {}

fn payload(header: NonNull<BlockHeader>) -> *mut u8 {
    unsafe { (header.as_ptr() as *mut u8).add(HEADER_SIZE) }
}

fn end_of(header: NonNull<BlockHeader>) -> usize {
    header.as_ptr() as usize + HEADER_SIZE + unsafe { header.as_ref().size }
}

/// Writes a header at `at` and returns it.
///
/// # Safety
/// `at` must be aligned and own `HEADER_SIZE` writable bytes.
unsafe fn install(at: usize, size: usize, next: Option<NonNull<BlockHeader>>, free: bool) -> NonNull<BlockHeader> {
    let header = at as *mut BlockHeader;
    header.write(BlockHeader { size, next, free });
    NonNull::new_unchecked(header)
}

impl<B: ProgramBreak> Heap<B> {
    pub const fn new(brk: B) -> Self {
        Self { head: None, brk }
    }

    pub fn program_break(&mut self) -> &mut B {
        &mut self.brk
    }

    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            cursor: self.head,
            _heap: core::marker::PhantomData,
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(HeapStats::default(), |mut stats, block| {
            stats.blocks += 1;
            if block.free {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
            } else {
                stats.used_bytes += block.size;
            }
            stats
        })
    }

    /// Allocates `size` bytes aligned to 16. Zero or unsatisfiable sizes give null.
    pub fn kmalloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(size) = checked_align_up(size, HEAP_ALIGNMENT) else {
            return ptr::null_mut();
        };
        if size > isize::MAX as usize / 2 {
            return ptr::null_mut();
        }

        let mut cursor = self.head;
        let mut tail = None;
        while let Some(header) = cursor {
            let block = unsafe { &mut *header.as_ptr() };
            if block.free && block.size > size + HEADER_SIZE {
                unsafe { self.split(header, size) };
                block.free = false;
                return payload(header);
            }
            if block.free && block.size == size {
                block.free = false;
                return payload(header);
            }
            tail = Some(header);
            cursor = block.next;
        }

        self.grow(size, tail)
    }

    /// Carves `size` bytes off the front of `header`; the rest becomes a free block.
    ///
    /// # Safety
    /// `header.size >= size + HEADER_SIZE`.
    unsafe fn split(&mut self, header: NonNull<BlockHeader>, size: usize) {
        let block = &mut *header.as_ptr();
        let rest = install(
            header.as_ptr() as usize + HEADER_SIZE + size,
            block.size - size - HEADER_SIZE,
            block.next,
            true,
        );
        block.size = size;
        block.next = Some(rest);
    }

    fn grow(&mut self, size: usize, tail: Option<NonNull<BlockHeader>>) -> *mut u8 {
        let needed = size + 2 * HEADER_SIZE;
        let region = align_up(needed, HEAP_BLOCK_SIZE);
        let Some(start) = self.brk.kbrk(region as isize) else {
            serial_println!("[heap] program break refused {:#x} bytes", region);
            return ptr::null_mut();
        };

        let used = unsafe {
            let rest = install(start + HEADER_SIZE + size, region - needed, None, true);
            install(start, size, Some(rest), false)
        };
        match tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(used) },
            None => self.head = Some(used),
        }
        payload(used)
    }

    /// Block that contains `ptr`, and its predecessor.
    fn find(&self, ptr: *mut u8) -> Option<(NonNull<BlockHeader>, Option<NonNull<BlockHeader>>)> {
        let addr = ptr as usize;
        let mut header = self.head?;
        let mut prev = None;
        while let Some(next) = unsafe { header.as_ref().next } {
            if next.as_ptr() as usize > addr {
                break;
            }
            prev = Some(header);
            header = next;
        }
        let start = payload(header) as usize;
        if addr < start || addr >= end_of(header).max(start + 1) {
            return None;
        }
        Some((header, prev))
    }

    /// Absorbs the following block into `header` if it is free and adjacent.
    fn absorb_next(&mut self, header: NonNull<BlockHeader>) {
        let block = unsafe { &mut *header.as_ptr() };
        if let Some(next) = block.next {
            let following = unsafe { next.as_ref() };
            if following.free && end_of(header) == next.as_ptr() as usize {
                block.size += HEADER_SIZE + following.size;
                block.next = following.next;
            }
        }
    }

    /// Releases a block. Null is ignored; pointers the heap does not own and
    /// blocks that are already free are reported and ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some((header, prev)) = self.find(ptr) else {
            serial_println!("[heap] free of foreign pointer {:p}", ptr);
            return;
        };
        if unsafe { header.as_ref().free } {
            serial_println!("[heap] double free of {:p}", ptr);
            return;
        }

        unsafe { (*header.as_ptr()).free = true };
        self.absorb_next(header);

        let mut merged = header;
        if let Some(prev) = prev {
            if unsafe { prev.as_ref().free } && end_of(prev) == header.as_ptr() as usize {
                self.absorb_next(prev);
                merged = prev;
            }
        }

        if unsafe { merged.as_ref().next.is_none() } && Some(merged) != self.head {
            self.release_tail(merged);
        }
    }

    /// Hands the whole pages inside the trailing free block back to the
    /// program break. The block keeps its size and stays in the list.
    fn release_tail(&mut self, header: NonNull<BlockHeader>) {
        let start = align_up(payload(header) as usize, PAGE_SIZE);
        let end = align_down(end_of(header), PAGE_SIZE);
        if end > start {
            self.brk.release(start, end - start);
        }
    }

    /// `n * size` zeroed bytes; overflow or a zero total gives null.
    pub fn calloc(&mut self, n: usize, size: usize) -> *mut u8 {
        let Some(total) = n.checked_mul(size) else {
            return ptr::null_mut();
        };
        let ptr = self.kmalloc(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.kmalloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        let Some((header, _)) = self.find(ptr) else {
            serial_println!("[heap] realloc of foreign pointer {:p}", ptr);
            return ptr::null_mut();
        };
        if payload(header) != ptr {
            serial_println!("[heap] realloc of interior pointer {:p}", ptr);
            return ptr::null_mut();
        }
        let Some(size) = checked_align_up(size, HEAP_ALIGNMENT) else {
            return ptr::null_mut();
        };

        let block = unsafe { &mut *header.as_ptr() };
        let current = block.size;

        if size <= current {
            if size + HEADER_SIZE <= current {
                unsafe { self.split(header, size) };
                if let Some(rest) = block.next {
                    self.absorb_next(rest);
                }
            }
            return ptr;
        }

        if let Some(next) = block.next {
            let following = unsafe { next.as_ref() };
            if following.free && end_of(header) == next.as_ptr() as usize {
                let available = current + HEADER_SIZE + following.size;
                let after = following.next;
                if available == size {
                    block.size = size;
                    block.next = after;
                    return ptr;
                }
                if available >= size + HEADER_SIZE {
                    let rest = unsafe {
                        install(ptr as usize + size, available - size - HEADER_SIZE, after, true)
                    };
                    block.size = size;
                    block.next = Some(rest);
                    return ptr;
                }
            }
        }

        let moved = self.kmalloc(size);
        if moved.is_null() {
            return moved;
        }
        unsafe { ptr::copy_nonoverlapping(ptr, moved, current) };
        self.free(ptr);
        moved
    }
}

pub struct Blocks<'a> {
    cursor: Option<NonNull<BlockHeader>>,
    _heap: core::marker::PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let header = self.cursor?;
        let block = unsafe { header.as_ref() };
        self.cursor = block.next;
        Some(BlockInfo {
            header: header.as_ptr() as usize,
            size: block.size,
            free: block.free,
        })
    }
}
