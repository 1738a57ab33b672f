//! Page-table builder for the kernel's address space
//!
//! The loader runs in whatever mode the firmware left it in and builds
//! the kernel's tables without ever switching to them. Every table page
//! comes from the memory manager tagged [`RegionKind::PageTables`], and
//! every write goes through [`PhysicalMemory`]. A sorted list of the
//! committed mappings sits next to the tables; overlap checks and the
//! `memcpy_to`/`memcpy_from`/`memset` helpers work off that list.

mod table;

use alloc::vec::Vec;
use core::ops::BitOr;

pub use table::Level;

use crate::memory::{AllocFlags, AllocRequest, MemoryManager, PhysicalMemory, RegionKind};
use crate::{Error, Result, PAGE_SIZE};

const FOUR_GIB: u64 = 1 << 32;

/// Paging mode the kernel is entered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagingMode {
    /// 32-bit two-level paging
    Ia32,
    /// 32-bit with physical address extension
    Pae,
    /// IA-32e four-level paging
    Long,
}

impl PagingMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ia32" => Some(PagingMode::Ia32),
            "pae" => Some(PagingMode::Pae),
            "long" => Some(PagingMode::Long),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            PagingMode::Ia32 => "ia32",
            PagingMode::Pae => "pae",
            PagingMode::Long => "long",
        }
    }

    /// Value the trampoline switches on.
    pub const fn code(self) -> u32 {
        match self {
            PagingMode::Ia32 => 0,
            PagingMode::Pae => 1,
            PagingMode::Long => 2,
        }
    }

    pub const fn is_64bit(self) -> bool {
        matches!(self, PagingMode::Long)
    }

    /// Is `[virt, virt + size)` addressable in this mode?
    fn virt_range_ok(self, virt: u64, size: u64) -> bool {
        let Some(end) = virt.checked_add(size) else {
            // Only the very top of the canonical upper half may end at 2^64.
            return self == PagingMode::Long && virt.wrapping_add(size) == 0 && is_canonical(virt);
        };
        match self {
            PagingMode::Ia32 | PagingMode::Pae => end <= FOUR_GIB,
            PagingMode::Long => is_canonical(virt) && is_canonical(end - 1) && (virt >> 47) == ((end - 1) >> 47),
        }
    }

    fn phys_range_ok(self, phys: u64, size: u64) -> bool {
        let Some(end) = phys.checked_add(size) else {
            return false;
        };
        match self {
            PagingMode::Ia32 => end <= FOUR_GIB,
            PagingMode::Pae | PagingMode::Long => end <= 1 << 52,
        }
    }
}

/// Sign extension of bit 47 fills the upper 16 bits.
pub const fn is_canonical(virt: u64) -> bool {
    let top = virt >> 47;
    top == 0 || top == 0x1_FFFF
}

/// Access rights of a mapping. Present and readable is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapFlags(u32);

impl MapFlags {
    pub const NONE: MapFlags = MapFlags(0);
    pub const WRITE: MapFlags = MapFlags(1 << 0);
    pub const EXEC: MapFlags = MapFlags(1 << 1);

    pub const fn contains(self, other: MapFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MapFlags {
    type Output = MapFlags;

    fn bitor(self, rhs: MapFlags) -> MapFlags {
        MapFlags(self.0 | rhs.0)
    }
}

/// A committed `virt -> phys` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
    pub flags: MapFlags,
}

impl Mapping {
    pub fn end(&self) -> u64 {
        self.virt.wrapping_add(self.size)
    }

    fn contains(&self, virt: u64) -> bool {
        virt >= self.virt && virt - self.virt < self.size
    }
}

/// Address-space under construction.
pub struct MmuContext {
    mode: PagingMode,
    root: u64,
    mappings: Vec<Mapping>,
    tables: usize,
    allow_huge: bool,
    no_execute: bool,
}

impl MmuContext {
    /// Allocate and clear the root table.
    pub fn new<M: PhysicalMemory + ?Sized>(
        mode: PagingMode,
        mem: &mut MemoryManager,
        phys: &mut M,
    ) -> Result<Self> {
        let mut ctx = Self {
            mode,
            root: 0,
            mappings: Vec::new(),
            tables: 0,
            allow_huge: false,
            no_execute: true,
        };
        ctx.root = ctx.alloc_table(mem, phys)?;
        log::debug!("mmu: {} root table at {:#x}", mode.name(), ctx.root);
        Ok(ctx)
    }

    /// Permit 1 GiB pages in long mode.
    pub fn set_allow_huge_pages(&mut self, allow: bool) {
        self.allow_huge = allow;
    }

    /// Whether non-executable mappings get the NX bit. Leave off when the
    /// CPU cannot enable EFER.NXE.
    pub fn set_no_execute(&mut self, enable: bool) {
        self.no_execute = enable;
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Physical address of the top-level table, the value for CR3.
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Committed mappings ordered by virtual address.
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Number of table pages allocated so far, root included.
    pub fn table_count(&self) -> usize {
        self.tables
    }

    pub fn translate(&self, virt: u64) -> Option<u64> {
        self.find(virt).map(|m| m.phys + (virt - m.virt))
    }

    /// Map `size` bytes at `virt` to `phys`.
    ///
    /// Repeating an existing mapping exactly (same range, translation and
    /// flags) is a no-op. Any other overlap is `Exists`.
    pub fn map<M: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &mut MemoryManager,
        phys: &mut M,
        virt: u64,
        pa: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<()> {
        if size == 0 || (virt | pa | size) % PAGE_SIZE != 0 {
            return Err(Error::Invalid);
        }
        if !self.mode.virt_range_ok(virt, size) || !self.mode.phys_range_ok(pa, size) {
            log::warn!(
                "mmu: {:#x}+{:#x} not addressable in {} mode",
                virt,
                size,
                self.mode.name()
            );
            return Err(Error::Invalid);
        }

        let last = virt + (size - 1);
        let requested = Mapping { virt, phys: pa, size, flags };
        if let Some(m) = self.mappings.iter().find(|m| m.virt <= last && virt <= m.virt + (m.size - 1)) {
            if *m == requested {
                return Ok(());
            }
            log::warn!(
                "mmu: {:#x}+{:#x} overlaps {:#x}+{:#x}",
                virt,
                size,
                m.virt,
                m.size
            );
            return Err(Error::Exists);
        }

        self.map_range(mem, phys, virt, pa, size, flags)?;
        let at = self.mappings.partition_point(|m| m.virt < virt);
        self.mappings.insert(at, requested);
        Ok(())
    }

    /// Copy `data` into the memory backing `virt`.
    pub fn memcpy_to<M: PhysicalMemory + ?Sized>(&self, phys: &mut M, virt: u64, data: &[u8]) -> Result<()> {
        self.walk(virt, data.len() as u64, |pa, off, n| phys.write(pa, &data[off..off + n]))
    }

    /// Copy from the memory backing `virt` into `buf`.
    pub fn memcpy_from<M: PhysicalMemory + ?Sized>(&self, phys: &mut M, virt: u64, buf: &mut [u8]) -> Result<()> {
        self.walk(virt, buf.len() as u64, |pa, off, n| phys.read(pa, &mut buf[off..off + n]))
    }

    /// Fill `size` bytes of the memory backing `virt` with `byte`.
    pub fn memset<M: PhysicalMemory + ?Sized>(&self, phys: &mut M, virt: u64, byte: u8, size: u64) -> Result<()> {
        self.walk(virt, size, |pa, _, n| phys.fill(pa, byte, n as u64))
    }

    /// Drop the mapping list. The table pages stay with the memory manager
    /// until the caller restores or hands over the map.
    pub fn destroy(self) {
        log::debug!(
            "mmu: discarding {} mappings, {} tables",
            self.mappings.len(),
            self.tables
        );
    }

    fn find(&self, virt: u64) -> Option<&Mapping> {
        let at = self.mappings.partition_point(|m| m.virt <= virt);
        at.checked_sub(1)
            .map(|i| &self.mappings[i])
            .filter(|m| m.contains(virt))
    }

    /// Visit the physical runs behind `[virt, virt + len)`.
    fn walk<F>(&self, virt: u64, len: u64, mut f: F) -> Result<()>
    where
        F: FnMut(u64, usize, usize) -> Result<()>,
    {
        let mut done = 0u64;
        while done < len {
            let at = virt.wrapping_add(done);
            let m = self.find(at).ok_or(Error::Invalid)?;
            let offset = at - m.virt;
            let n = (m.size - offset).min(len - done);
            f(m.phys + offset, done as usize, n as usize)?;
            done += n;
        }
        Ok(())
    }

    fn alloc_table<M: PhysicalMemory + ?Sized>(&mut self, mem: &mut MemoryManager, phys: &mut M) -> Result<u64> {
        let table = mem.allocate_with(
            AllocRequest::new(PAGE_SIZE, RegionKind::PageTables)
                .flags(AllocFlags::BELOW_4G | AllocFlags::HIGH)
                .owner("mmu"),
        )?;
        phys.fill(table, 0, PAGE_SIZE)?;
        self.tables += 1;
        Ok(table)
    }

    fn read_entry<M: PhysicalMemory + ?Sized>(&self, phys: &mut M, slot: u64) -> Result<u64> {
        match self.mode.entry_size() {
            4 => phys.read_u32(slot).map(u64::from),
            _ => phys.read_u64(slot),
        }
    }

    fn write_entry<M: PhysicalMemory + ?Sized>(&self, phys: &mut M, slot: u64, entry: u64) -> Result<()> {
        match self.mode.entry_size() {
            4 => phys.write_u32(slot, entry as u32),
            _ => phys.write_u64(slot, entry),
        }
    }

    fn map_range<M: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &mut MemoryManager,
        phys: &mut M,
        virt: u64,
        pa: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<()> {
        let mut done = 0;
        while done < size {
            done += self.map_one(mem, phys, virt + done, pa + done, size - done, flags)?;
        }
        Ok(())
    }

    /// Write one leaf entry, as large as alignment and `remaining` allow.
    /// Returns the number of bytes it maps.
    fn map_one<M: PhysicalMemory + ?Sized>(
        &mut self,
        mem: &mut MemoryManager,
        phys: &mut M,
        virt: u64,
        pa: u64,
        remaining: u64,
        flags: MapFlags,
    ) -> Result<u64> {
        let levels = self.mode.levels();
        let mut table = self.root;

        for (depth, level) in levels.iter().enumerate() {
            let slot = table + level.index(virt) * self.mode.entry_size();
            let entry = self.read_entry(phys, slot)?;
            let page = level.page_size();
            let leaf = depth + 1 == levels.len();

            let huge = page > 0x40_0000;
            let large = !leaf
                && level.large
                && (!huge || self.allow_huge)
                && virt % page == 0
                && pa % page == 0
                && remaining >= page;

            if leaf || (large && entry & table::PRESENT == 0) {
                if entry & table::PRESENT != 0 {
                    return Err(Error::Exists);
                }
                self.write_entry(phys, slot, self.mode.leaf_entry(pa, flags, !leaf, self.no_execute))?;
                return Ok(page);
            }

            if entry & table::PRESENT == 0 {
                let next = self.alloc_table(mem, phys)?;
                self.write_entry(phys, slot, self.mode.table_entry(depth, next))?;
                table = next;
            } else if entry & table::LARGE != 0 && !(self.mode == PagingMode::Pae && depth == 0) {
                return Err(Error::Exists);
            } else {
                table = entry & self.mode.address_mask();
            }
        }
        Err(Error::Invalid)
    }
}
