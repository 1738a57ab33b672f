//! Page-table entry formats for the three x86 paging modes

use super::{MapFlags, PagingMode};

pub const PRESENT: u64 = 1;
pub const WRITABLE: u64 = 1 << 1;
pub const LARGE: u64 = 1 << 7;
pub const NO_EXECUTE: u64 = 1 << 63;

const ADDR_MASK_32: u64 = 0xFFFF_F000;
const ADDR_MASK_64: u64 = 0x000F_FFFF_FFFF_F000;

/// One level of the hierarchy, root first.
#[derive(Debug, Clone, Copy)]
pub struct Level {
    /// Bit position of the lowest virtual-address bit this level indexes
    pub shift: u32,
    /// Number of index bits
    pub bits: u32,
    /// Whether an entry here may map a large page directly
    pub large: bool,
}

impl Level {
    pub const fn page_size(&self) -> u64 {
        1 << self.shift
    }

    pub const fn index(&self, virt: u64) -> u64 {
        (virt >> self.shift) & ((1 << self.bits) - 1)
    }
}

const IA32: [Level; 2] = [
    Level { shift: 22, bits: 10, large: true },
    Level { shift: 12, bits: 10, large: false },
];

const PAE: [Level; 3] = [
    Level { shift: 30, bits: 2, large: false },
    Level { shift: 21, bits: 9, large: true },
    Level { shift: 12, bits: 9, large: false },
];

const LONG: [Level; 4] = [
    Level { shift: 39, bits: 9, large: false },
    Level { shift: 30, bits: 9, large: true },
    Level { shift: 21, bits: 9, large: true },
    Level { shift: 12, bits: 9, large: false },
];

impl PagingMode {
    pub fn levels(self) -> &'static [Level] {
        match self {
            PagingMode::Ia32 => &IA32,
            PagingMode::Pae => &PAE,
            PagingMode::Long => &LONG,
        }
    }

    /// Bytes per table entry.
    pub const fn entry_size(self) -> u64 {
        match self {
            PagingMode::Ia32 => 4,
            PagingMode::Pae | PagingMode::Long => 8,
        }
    }

    pub const fn address_mask(self) -> u64 {
        match self {
            PagingMode::Ia32 => ADDR_MASK_32,
            PagingMode::Pae | PagingMode::Long => ADDR_MASK_64,
        }
    }

    /// Entry pointing at a next-level table.
    pub const fn table_entry(self, depth: usize, table: u64) -> u64 {
        match (self, depth) {
            // PDPTEs have no access bits in PAE mode.
            (PagingMode::Pae, 0) => table | PRESENT,
            _ => table | PRESENT | WRITABLE,
        }
    }

    /// Entry mapping a page (or a large page when `large`). `nx` says
    /// whether the CPU will have EFER.NXE set.
    pub fn leaf_entry(self, phys: u64, flags: MapFlags, large: bool, nx: bool) -> u64 {
        let mut entry = phys | PRESENT;
        if flags.contains(MapFlags::WRITE) {
            entry |= WRITABLE;
        }
        if large {
            entry |= LARGE;
        }
        if nx && self != PagingMode::Ia32 && !flags.contains(MapFlags::EXEC) {
            entry |= NO_EXECUTE;
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_the_address() {
        let virt = 0xFFFF_FFFF_8010_0000u64;
        let long = PagingMode::Long.levels();
        assert_eq!(long[0].index(virt), 511);
        assert_eq!(long[1].index(virt), 510);
        assert_eq!(long[2].index(virt), 0);
        assert_eq!(long[3].index(virt), 0x100);

        let ia32 = PagingMode::Ia32.levels();
        assert_eq!(ia32[0].index(0xC010_0000), 0x300);
        assert_eq!(ia32[1].index(0xC010_0000), 0x100);
    }

    #[test]
    fn leaf_permissions() {
        let rx = PagingMode::Long.leaf_entry(0x20_0000, MapFlags::EXEC, true, true);
        assert_eq!(rx, 0x20_0000 | PRESENT | LARGE);

        let rw = PagingMode::Pae.leaf_entry(0x1000, MapFlags::WRITE, false, true);
        assert_eq!(rw, 0x1000 | PRESENT | WRITABLE | NO_EXECUTE);

        // Without NXE bit 63 is reserved.
        let plain = PagingMode::Long.leaf_entry(0x1000, MapFlags::WRITE, false, false);
        assert_eq!(plain, 0x1000 | PRESENT | WRITABLE);

        // No NX bit without PAE.
        let ro = PagingMode::Ia32.leaf_entry(0x1000, MapFlags::NONE, false, true);
        assert_eq!(ro, 0x1000 | PRESENT);
    }
}
