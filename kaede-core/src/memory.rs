//! Physical memory regions and the span allocator behind them.
//!
//! At kernel bring-up main memory is partitioned into three independent
//! arenas — Program, System and Base — whose sizes come from the memory
//! layout mode in the guest image header. Each region tracks its free space
//! as a set of disjoint, non-adjacent spans; `used + Σ free == size` holds
//! after every operation.
//!
//! Freeing bytes that are not currently allocated is an emulator or
//! guest-data bug, not a recoverable condition: it panics rather than
//! silently corrupting the region (the run loop halts).

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use strum::FromRepr;
use tracing::debug;

use crate::types::PAddr;

/// Physical address where main memory starts.
pub const FCRAM_PADDR: PAddr = 0x2000_0000;

/// Total main memory size: 128 MiB, split across the three regions.
pub const FCRAM_SIZE: u32 = 0x0800_0000;

/// Memory layout profile, selected once per session by the guest image.
///
/// Values match the header encoding; anything else in the header is a
/// typed bring-up error, never a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum MemoryMode {
    Prod = 0,
    Dev1 = 2,
    Dev2 = 3,
    Dev3 = 4,
    Dev4 = 5,
}

impl MemoryMode {
    /// Sizes of the Program, System and Base regions, in that order.
    /// Every mode sums to [`FCRAM_SIZE`].
    pub fn region_sizes(self) -> [u32; 3] {
        match self {
            MemoryMode::Prod => [0x0400_0000, 0x02C0_0000, 0x0140_0000],
            MemoryMode::Dev1 => [0x0600_0000, 0x00C0_0000, 0x0140_0000],
            MemoryMode::Dev2 => [0x0500_0000, 0x01C0_0000, 0x0140_0000],
            MemoryMode::Dev3 => [0x0480_0000, 0x0240_0000, 0x0140_0000],
            MemoryMode::Dev4 => [0x0200_0000, 0x04C0_0000, 0x0140_0000],
        }
    }
}

/// One of the three fixed arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RegionKind {
    Program,
    System,
    Base,
}

/// A contiguous allocated span of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpan {
    pub start: PAddr,
    pub size: u32,
}

impl MemorySpan {
    #[inline]
    pub fn end(self) -> PAddr {
        self.start + self.size
    }
}

/// A fixed-capacity arena tracking free space as disjoint spans.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    base: PAddr,
    size: u32,
    used: u32,
    /// Free spans keyed by start address. Invariants: disjoint, never
    /// adjacent (coalesced on free), all inside `[base, base + size)`.
    free_spans: BTreeMap<PAddr, u32>,
}

impl MemoryRegion {
    pub fn new(base: PAddr, size: u32) -> Self {
        let mut region = Self {
            base,
            size,
            used: 0,
            free_spans: BTreeMap::new(),
        };
        region.reset(base, size);
        region
    }

    /// Reconfigure the region as one fully-free interval.
    pub fn reset(&mut self, base: PAddr, size: u32) {
        self.base = base;
        self.size = size;
        self.used = 0;
        self.free_spans.clear();
        if size > 0 {
            self.free_spans.insert(base, size);
        }
    }

    #[inline]
    pub fn base(&self) -> PAddr {
        self.base
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Total free bytes across all spans.
    pub fn free_total(&self) -> u32 {
        self.free_spans.values().sum()
    }

    /// Allocate `size` bytes from the highest available addresses downward.
    ///
    /// The result may be several disjoint spans if the top of the region is
    /// fragmented, ordered highest-first as consumed. Returns an empty list
    /// and leaves the region untouched if total free space is insufficient.
    pub fn heap_allocate(&mut self, size: u32) -> SmallVec<[MemorySpan; 2]> {
        let mut spans = SmallVec::new();
        if size == 0 || self.free_total() < size {
            return spans;
        }

        let mut remaining = size;
        while remaining > 0 {
            let (&start, &len) = self
                .free_spans
                .iter()
                .next_back()
                .expect("free total covers the request");
            if len >= remaining {
                let alloc_start = start + len - remaining;
                if len == remaining {
                    self.free_spans.remove(&start);
                } else {
                    self.free_spans.insert(start, len - remaining);
                }
                spans.push(MemorySpan {
                    start: alloc_start,
                    size: remaining,
                });
                remaining = 0;
            } else {
                self.free_spans.remove(&start);
                spans.push(MemorySpan { start, size: len });
                remaining -= len;
            }
        }

        self.used += size;
        self.check_conservation();
        spans
    }

    /// First-fit scan from the lowest address upward for one contiguous
    /// block. Returns the start address, or `None` if no span fits.
    pub fn linear_allocate(&mut self, size: u32) -> Option<PAddr> {
        if size == 0 {
            return None;
        }
        let start = self
            .free_spans
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&start, _)| start)?;
        let len = self.free_spans.remove(&start).expect("span just found");
        if len > size {
            self.free_spans.insert(start + size, len - size);
        }
        self.used += size;
        self.check_conservation();
        Some(start)
    }

    /// Allocate exactly `[start, start + size)`. Fails iff any byte of the
    /// range is not currently free.
    pub fn linear_allocate_at(&mut self, start: PAddr, size: u32) -> bool {
        if size == 0 {
            return false;
        }
        let end = start + size;
        let Some((&span_start, &span_len)) = self.free_spans.range(..=start).next_back() else {
            return false;
        };
        if span_start + span_len < end {
            return false;
        }

        self.free_spans.remove(&span_start);
        if span_start < start {
            self.free_spans.insert(span_start, start - span_start);
        }
        if end < span_start + span_len {
            self.free_spans.insert(end, span_start + span_len - end);
        }
        self.used += size;
        self.check_conservation();
        true
    }

    /// Return `[start, start + size)` to the free set, coalescing with
    /// neighbours.
    ///
    /// # Panics
    ///
    /// Panics if any byte of the range is outside the region or already
    /// free — a double free corrupts the arena and halts the emulator.
    pub fn free(&mut self, start: PAddr, size: u32) {
        if size == 0 {
            return;
        }
        let end = start + size;
        assert!(
            start >= self.base && end <= self.base + self.size,
            "freeing [{start:#010X}..{end:#010X}) outside region [{:#010X}..{:#010X})",
            self.base,
            self.base + self.size
        );
        if let Some((&prev_start, &prev_len)) = self.free_spans.range(..end).next_back() {
            assert!(
                prev_start + prev_len <= start,
                "freeing [{start:#010X}..{end:#010X}) which is not fully allocated"
            );
        }

        // Coalesce with the predecessor and successor spans if adjacent.
        let mut merged_start = start;
        let mut merged_len = size;
        let prev = self
            .free_spans
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                self.free_spans.remove(&prev_start);
                merged_start = prev_start;
                merged_len += prev_len;
            }
        }
        if let Some(next_len) = self.free_spans.remove(&end) {
            merged_len += next_len;
        }
        self.free_spans.insert(merged_start, merged_len);

        self.used -= size;
        self.check_conservation();
    }

    #[inline]
    fn check_conservation(&self) {
        debug_assert_eq!(
            self.used + self.free_total(),
            self.size,
            "region accounting out of balance"
        );
    }
}

/// Main memory: the byte backing plus the three region arenas laid out
/// consecutively from [`FCRAM_PADDR`].
pub struct MemorySystem {
    mode: MemoryMode,
    fcram: Vec<u8>,
    pub program: MemoryRegion,
    pub system: MemoryRegion,
    pub base: MemoryRegion,
}

impl MemorySystem {
    pub fn new(mode: MemoryMode) -> Self {
        let [program_size, system_size, base_size] = mode.region_sizes();
        let program_base = FCRAM_PADDR;
        let system_base = program_base + program_size;
        let base_base = system_base + system_size;
        debug!(
            ?mode,
            program = %format!("{program_size:#X}"),
            system = %format!("{system_size:#X}"),
            base = %format!("{base_size:#X}"),
            "configuring memory regions"
        );
        Self {
            mode,
            fcram: vec![0; FCRAM_SIZE as usize],
            program: MemoryRegion::new(program_base, program_size),
            system: MemoryRegion::new(system_base, system_size),
            base: MemoryRegion::new(base_base, base_size),
        }
    }

    #[inline]
    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn region(&self, kind: RegionKind) -> &MemoryRegion {
        match kind {
            RegionKind::Program => &self.program,
            RegionKind::System => &self.system,
            RegionKind::Base => &self.base,
        }
    }

    pub fn region_mut(&mut self, kind: RegionKind) -> &mut MemoryRegion {
        match kind {
            RegionKind::Program => &mut self.program,
            RegionKind::System => &mut self.system,
            RegionKind::Base => &mut self.base,
        }
    }

    #[inline]
    fn offset(&self, paddr: PAddr, len: usize) -> usize {
        let off = paddr.checked_sub(FCRAM_PADDR).unwrap_or_else(|| {
            panic!("guest access below main memory: {paddr:#010X}")
        }) as usize;
        assert!(
            off + len <= self.fcram.len(),
            "guest access past main memory: {paddr:#010X}+{len:#X}"
        );
        off
    }

    /// Read one guest-endian (little-endian) 32-bit word.
    #[inline]
    pub fn read_u32(&self, paddr: PAddr) -> u32 {
        let off = self.offset(paddr, 4);
        LittleEndian::read_u32(&self.fcram[off..off + 4])
    }

    /// Write one guest-endian (little-endian) 32-bit word.
    #[inline]
    pub fn write_u32(&mut self, paddr: PAddr, value: u32) {
        let off = self.offset(paddr, 4);
        LittleEndian::write_u32(&mut self.fcram[off..off + 4], value);
    }

    pub fn read_bytes(&self, paddr: PAddr, len: usize) -> &[u8] {
        let off = self.offset(paddr, len);
        &self.fcram[off..off + len]
    }

    pub fn write_bytes(&mut self, paddr: PAddr, data: &[u8]) {
        let off = self.offset(paddr, data.len());
        self.fcram[off..off + data.len()].copy_from_slice(data);
    }
}
