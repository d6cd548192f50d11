//! Physical memory description handed over by the boot layer.
//!
//! The frame allocator and the VMM consume exactly three regions: a low
//! region below 1 MiB, the main high region, and the kernel image. The
//! description is trusted as-is.

use crate::memory::frame::PhysRegion;

/// First byte above conventional memory.
pub const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub low: PhysRegion,
    pub high: PhysRegion,
    pub kernel: PhysRegion,
}

impl MemoryInfo {
    /// Builds the description from `(start, end, usable)` spans.
    ///
    /// `low` is the first usable span that starts below 1 MiB (clipped to
    /// it), `high` the largest usable span at or above 1 MiB.
    pub fn from_spans<I>(spans: I, kernel: PhysRegion) -> Option<Self>
    where
        I: IntoIterator<Item = (u64, u64, bool)>,
    {
        let mut low = PhysRegion::default();
        let mut high = PhysRegion::default();

        for (start, end, usable) in spans {
            if !usable || end <= start {
                continue;
            }
            if start < LOW_MEMORY_LIMIT {
                if low.size == 0 {
                    low = PhysRegion::new(start, end.min(LOW_MEMORY_LIMIT) - start);
                }
                if end <= LOW_MEMORY_LIMIT {
                    continue;
                }
            }
            let start = start.max(LOW_MEMORY_LIMIT);
            if end - start > high.size {
                high = PhysRegion::new(start, end - start);
            }
        }

        if high.size == 0 {
            return None;
        }
        Some(Self { low, high, kernel })
    }

    /// One past the highest physical address the identity map has to cover.
    pub fn physical_end(&self) -> u64 {
        self.low.end().max(self.high.end()).max(self.kernel.end())
    }
}
