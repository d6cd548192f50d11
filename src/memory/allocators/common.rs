//! Alignment helpers shared by the frame allocator, the VMM and the heap.

#[inline]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// `align_up` that reports overflow instead of wrapping.
#[inline]
pub const fn checked_align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

#[inline]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(0x2000, 4096));
        assert!(!is_aligned(0x2008, 4096));
        assert_eq!(checked_align_up(usize::MAX - 3, 16), None);
        assert_eq!(checked_align_up(17, 16), Some(32));
    }
}
