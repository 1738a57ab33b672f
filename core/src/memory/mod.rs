//! Memory Manager
//!
//! Owns the physical memory map from platform init until hand-off. The map
//! is a sorted list of disjoint typed regions whose union is exactly what
//! the firmware reported. Everything the loader places in physical memory
//! (kernel segments, page tables, boot info, modules, the kernel stack)
//! is carved out of a free region here first.
//!
//! ```text
//!   firmware map ──► from_firmware() ──► [ Region | Region | ... ]
//!                                              │
//!              allocate / allocate_at / reserve / free
//!                                              │
//!                                         snapshot() ──► boot info
//! ```

pub mod phys;

pub use phys::{IdentityMapped, PhysicalMemory};

use alloc::vec::Vec;
use core::ops::BitOr;

use crate::{align_down, checked_align_up, Error, Result, PAGE_SIZE};

/// Nothing is handed out below this address unless asked for explicitly.
pub const ALLOC_FLOOR: u64 = 0x10_0000;

/// Owner tag of regions that came from (or went back to) the firmware map.
pub const FIRMWARE_OWNER: &str = "firmware";

const FOUR_GIB: u64 = 0x1_0000_0000;

// ═══════════════════════════════════════════════════════════════════════════
// REGION KINDS
// ═══════════════════════════════════════════════════════════════════════════

/// What a physical range is used for. The discriminant is the code written
/// into the boot-info memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RegionKind {
    /// Usable RAM nobody owns
    Free = 0,
    /// Generic loader allocation
    Allocated = 1,
    /// Firmware owned, never touched
    Reserved = 2,
    /// In use now, usable by the kernel once it no longer needs the data
    Reclaimable = 3,
    /// Kernel image segments
    Kernel = 4,
    /// The boot-info block
    BootInfo = 5,
    /// Page tables and the hand-off trampoline
    PageTables = 6,
    /// Boot modules
    Modules = 7,
}

impl RegionKind {
    /// Translate an E820 address range type.
    pub fn from_e820(kind: u32) -> Self {
        match kind {
            1 => RegionKind::Free,
            _ => RegionKind::Reserved,
        }
    }

    /// Translate an `EFI_MEMORY_TYPE`.
    ///
    /// Boot-services and loader memory is in use until ExitBootServices,
    /// so it is only reclaimable, never free for our own allocations.
    pub fn from_uefi(kind: u32) -> Self {
        match kind {
            7 => RegionKind::Free,
            1..=4 => RegionKind::Reclaimable,
            _ => RegionKind::Reserved,
        }
    }

    /// Numeric code used in the boot-info block.
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            RegionKind::Free => "free",
            RegionKind::Allocated => "allocated",
            RegionKind::Reserved => "reserved",
            RegionKind::Reclaimable => "reclaimable",
            RegionKind::Kernel => "kernel",
            RegionKind::BootInfo => "boot-info",
            RegionKind::PageTables => "page-tables",
            RegionKind::Modules => "modules",
        }
    }
}

/// One entry of the firmware-reported map, already translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRange {
    pub base: u64,
    pub size: u64,
    pub kind: RegionKind,
}

impl FirmwareRange {
    pub const fn new(base: u64, size: u64, kind: RegionKind) -> Self {
        Self { base, size, kind }
    }
}

/// A tracked physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub size: u64,
    pub kind: RegionKind,
    pub owner: &'static str,
}

impl Region {
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    fn is_firmware(&self) -> bool {
        self.owner == FIRMWARE_OWNER
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ALLOCATION REQUESTS
// ═══════════════════════════════════════════════════════════════════════════

/// Placement constraints for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Whole region must be addressable with 32 bits.
    pub const BELOW_4G: AllocFlags = AllocFlags(1 << 0);
    /// Take the highest fitting address instead of the lowest.
    pub const HIGH: AllocFlags = AllocFlags(1 << 1);

    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

/// Full description of an allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    pub size: u64,
    pub align: u64,
    pub kind: RegionKind,
    pub flags: AllocFlags,
    pub owner: &'static str,
}

impl AllocRequest {
    pub const fn new(size: u64, kind: RegionKind) -> Self {
        Self {
            size,
            align: PAGE_SIZE,
            kind,
            flags: AllocFlags::NONE,
            owner: "loader",
        }
    }

    pub const fn align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    pub fn flags(mut self, flags: AllocFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub const fn owner(mut self, owner: &'static str) -> Self {
        self.owner = owner;
        self
    }
}

/// Saved copy of the region list, for rolling back a failed boot attempt.
#[derive(Debug, Clone)]
pub struct Checkpoint(Vec<Region>);

// ═══════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════

pub struct MemoryManager {
    regions: Vec<Region>,
    ceiling: u64,
}

impl MemoryManager {
    /// Build the map from firmware ranges.
    ///
    /// Free ranges shrink inwards to page boundaries, everything else grows
    /// outwards. Where ranges overlap the non-free one wins.
    pub fn from_firmware(ranges: &[FirmwareRange]) -> Self {
        let mut mm = Self {
            regions: Vec::new(),
            ceiling: u64::MAX,
        };

        for range in ranges.iter().filter(|r| r.kind != RegionKind::Free) {
            let (base, end) = outer_span(range);
            if end > base {
                mm.recolour(base, end, range.kind, FIRMWARE_OWNER, |_| true);
                mm.fill_gaps(base, end, range.kind);
            }
        }
        for range in ranges.iter().filter(|r| r.kind == RegionKind::Free) {
            let base = checked_align_up(range.base, PAGE_SIZE).unwrap_or(u64::MAX);
            let end = align_down(range.base.saturating_add(range.size), PAGE_SIZE);
            if end > base {
                mm.fill_gaps(base, end, RegionKind::Free);
            }
        }

        log::debug!(
            "memory: {} regions, {} KiB free",
            mm.regions.len(),
            mm.total_free() / 1024
        );
        mm
    }

    /// Highest address (exclusive) the loader itself can touch.
    pub fn set_ceiling(&mut self, ceiling: u64) {
        self.ceiling = ceiling;
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Ordered copy of the map, as handed to the kernel.
    pub fn snapshot(&self) -> Vec<Region> {
        self.regions.clone()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.regions.clone())
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.regions = checkpoint.0;
    }

    pub fn total_free(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::Free)
            .map(|r| r.size)
            .sum()
    }

    /// Region containing `phys`, if any.
    pub fn region_at(&self, phys: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.base <= phys && phys < r.end())
    }

    /// First-fit, lowest-address allocation.
    pub fn allocate(&mut self, size: u64, align: u64, kind: RegionKind) -> Result<u64> {
        self.allocate_with(AllocRequest::new(size, kind).align(align))
    }

    pub fn allocate_with(&mut self, req: AllocRequest) -> Result<u64> {
        if req.size == 0 || !req.align.is_power_of_two() || req.align < PAGE_SIZE {
            return Err(Error::Invalid);
        }
        if req.kind == RegionKind::Free {
            return Err(Error::Invalid);
        }
        let size = checked_align_up(req.size, PAGE_SIZE).ok_or(Error::NoMemory)?;

        let mut limit = self.ceiling;
        if req.flags.contains(AllocFlags::BELOW_4G) {
            limit = limit.min(FOUR_GIB);
        }

        let fits = |r: &Region| -> Option<u64> {
            let low = r.base.max(ALLOC_FLOOR);
            let high = r.end().min(limit);
            if high <= low || high - low < size {
                return None;
            }
            if req.flags.contains(AllocFlags::HIGH) {
                let start = align_down(high - size, req.align);
                (start >= low).then_some(start)
            } else {
                let start = checked_align_up(low, req.align)?;
                (start.checked_add(size)? <= high).then_some(start)
            }
        };

        let mut free = self.regions.iter().filter(|r| r.kind == RegionKind::Free);
        let found = if req.flags.contains(AllocFlags::HIGH) {
            free.rev().find_map(fits)
        } else {
            free.find_map(fits)
        };

        let Some(base) = found else {
            log::debug!(
                "memory: no room for {:#x} bytes ({}, align {:#x})",
                size,
                req.kind.name(),
                req.align
            );
            return Err(Error::NoMemory);
        };

        self.recolour(base, base + size, req.kind, req.owner, |r| {
            r.kind == RegionKind::Free
        });
        Ok(base)
    }

    /// Place a region at exactly `phys`. Every byte must currently be free.
    pub fn allocate_at(
        &mut self,
        phys: u64,
        size: u64,
        kind: RegionKind,
        owner: &'static str,
    ) -> Result<u64> {
        if phys % PAGE_SIZE != 0 || size == 0 || kind == RegionKind::Free {
            return Err(Error::Invalid);
        }
        let end = phys
            .checked_add(checked_align_up(size, PAGE_SIZE).ok_or(Error::Invalid)?)
            .ok_or(Error::Invalid)?;
        if end > self.ceiling {
            return Err(Error::NoMemory);
        }

        match self.region_at(phys) {
            Some(r) if r.kind == RegionKind::Free && end <= r.end() => {}
            _ => return Err(Error::NoMemory),
        }

        self.recolour(phys, end, kind, owner, |r| r.kind == RegionKind::Free);
        Ok(phys)
    }

    /// Mark a free or partially free range with `kind`.
    ///
    /// Bytes already carrying `kind` are accepted; any other owner is a
    /// conflict. The whole range must be described by the map.
    pub fn reserve(
        &mut self,
        phys: u64,
        size: u64,
        kind: RegionKind,
        owner: &'static str,
    ) -> Result<()> {
        if size == 0 || kind == RegionKind::Free {
            return Err(Error::Invalid);
        }
        let base = align_down(phys, PAGE_SIZE);
        let end = phys
            .checked_add(size)
            .and_then(|end| checked_align_up(end, PAGE_SIZE))
            .ok_or(Error::Invalid)?;

        let mut covered = 0;
        for r in self.overlapping(base, end) {
            if r.kind != RegionKind::Free && r.kind != kind {
                return Err(Error::Exists);
            }
            covered += r.end().min(end) - r.base.max(base);
        }
        if covered != end - base {
            return Err(Error::Invalid);
        }

        self.recolour(base, end, kind, owner, |r| r.kind == RegionKind::Free);
        Ok(())
    }

    /// Return an allocation to the free pool.
    pub fn free(&mut self, phys: u64) -> Result<()> {
        let region = self
            .regions
            .iter()
            .find(|r| r.base == phys)
            .copied()
            .ok_or(Error::NotFound)?;
        if !matches!(region.kind, RegionKind::Allocated | RegionKind::Reclaimable) {
            return Err(Error::Invalid);
        }
        self.recolour(
            region.base,
            region.end(),
            RegionKind::Free,
            FIRMWARE_OWNER,
            |r| r.base == region.base,
        );
        Ok(())
    }

    /// Fold in a freshly fetched firmware map.
    ///
    /// Ranges the firmware now uses but we still consider free (pool
    /// allocations made behind our back) stop being free.
    pub fn merge_firmware_changes(&mut self, ranges: &[FirmwareRange]) {
        for range in ranges.iter().filter(|r| r.kind != RegionKind::Free) {
            let (base, end) = outer_span(range);
            if end > base {
                self.recolour(base, end, range.kind, FIRMWARE_OWNER, |r| {
                    r.kind == RegionKind::Free
                });
            }
        }
    }

    fn overlapping(&self, base: u64, end: u64) -> impl Iterator<Item = &Region> {
        self.regions
            .iter()
            .filter(move |r| r.base < end && r.end() > base)
    }

    /// Recolour `[base, end)` inside every region matching `pred`, splitting
    /// regions at the range edges.
    fn recolour(
        &mut self,
        base: u64,
        end: u64,
        kind: RegionKind,
        owner: &'static str,
        pred: impl Fn(&Region) -> bool,
    ) {
        let old = core::mem::take(&mut self.regions);
        let mut out = Vec::with_capacity(old.len() + 2);

        for r in old {
            if r.end() <= base || r.base >= end || !pred(&r) {
                out.push(r);
                continue;
            }
            let lo = r.base.max(base);
            let hi = r.end().min(end);
            if r.base < lo {
                out.push(Region {
                    size: lo - r.base,
                    ..r
                });
            }
            out.push(Region {
                base: lo,
                size: hi - lo,
                kind,
                owner,
            });
            if hi < r.end() {
                out.push(Region {
                    base: hi,
                    size: r.end() - hi,
                    ..r
                });
            }
        }

        self.regions = out;
        self.coalesce();
    }

    /// Add firmware regions for the parts of `[base, end)` nothing covers.
    fn fill_gaps(&mut self, base: u64, end: u64, kind: RegionKind) {
        let mut gaps = Vec::new();
        let mut cursor = base;
        for r in &self.regions {
            if r.end() <= cursor {
                continue;
            }
            if r.base >= end {
                break;
            }
            if r.base > cursor {
                gaps.push((cursor, r.base));
            }
            cursor = r.end();
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        for (lo, hi) in gaps {
            self.regions.push(Region {
                base: lo,
                size: hi - lo,
                kind,
                owner: FIRMWARE_OWNER,
            });
        }
        self.regions.sort_unstable_by_key(|r| r.base);
        self.coalesce();
    }

    /// Merge touching firmware regions of the same kind.
    fn coalesce(&mut self) {
        let mut merged: Vec<Region> = Vec::with_capacity(self.regions.len());
        for r in self.regions.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.end() == r.base
                    && last.kind == r.kind
                    && last.is_firmware()
                    && r.is_firmware()
                {
                    last.size += r.size;
                    continue;
                }
            }
            merged.push(r);
        }
        self.regions = merged;
    }
}

/// End of the last whole page in the address space.
const LAST_PAGE_END: u64 = align_down(u64::MAX, PAGE_SIZE);

/// Page-rounded span covering `range`, grown outwards and clipped at the
/// top of the address space.
fn outer_span(range: &FirmwareRange) -> (u64, u64) {
    let end = range.base.saturating_add(range.size);
    (
        align_down(range.base, PAGE_SIZE),
        checked_align_up(end, PAGE_SIZE).unwrap_or(LAST_PAGE_END),
    )
}
