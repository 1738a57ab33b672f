//! Software page walks over the simulated physical memory, to check the
//! tables the loader wrote without trusting its own bookkeeping.

use laos_core::memory::PhysicalMemory;

use super::SparseMemory;

const PRESENT: u64 = 1;
const LARGE: u64 = 1 << 7;

/// Translate `virt` through four-level tables rooted at `cr3`.
pub fn walk_long(mem: &mut SparseMemory, cr3: u64, virt: u64) -> Option<u64> {
    let mask = 0x000F_FFFF_FFFF_F000;
    let mut table = cr3 & mask;
    for (depth, shift) in [39u32, 30, 21, 12].into_iter().enumerate() {
        let index = (virt >> shift) & 0x1FF;
        let entry = mem.read_u64(table + index * 8).ok()?;
        if entry & PRESENT == 0 {
            return None;
        }
        if depth > 0 && depth < 3 && entry & LARGE != 0 {
            let size = 1u64 << shift;
            return Some((entry & mask & !(size - 1)) + (virt & (size - 1)));
        }
        table = entry & mask;
    }
    Some(table + (virt & 0xFFF))
}

/// Raw leaf entry for `virt` in four-level tables (4 KiB or 2 MiB leaves).
pub fn leaf_long(mem: &mut SparseMemory, cr3: u64, virt: u64) -> Option<u64> {
    let mask = 0x000F_FFFF_FFFF_F000;
    let mut table = cr3 & mask;
    for (depth, shift) in [39u32, 30, 21, 12].into_iter().enumerate() {
        let entry = mem.read_u64(table + ((virt >> shift) & 0x1FF) * 8).ok()?;
        if entry & PRESENT == 0 {
            return None;
        }
        if depth == 3 || (depth > 0 && entry & LARGE != 0) {
            return Some(entry);
        }
        table = entry & mask;
    }
    None
}

/// Translate `virt` through classic two-level 32-bit tables.
pub fn walk_ia32(mem: &mut SparseMemory, cr3: u64, virt: u64) -> Option<u64> {
    let pde = mem.read_u32(cr3 + ((virt >> 22) & 0x3FF) * 4).ok()? as u64;
    if pde & PRESENT == 0 {
        return None;
    }
    if pde & LARGE != 0 {
        return Some((pde & 0xFFC0_0000) + (virt & 0x3F_FFFF));
    }
    let pte = mem.read_u32((pde & 0xFFFF_F000) + ((virt >> 12) & 0x3FF) * 4).ok()? as u64;
    if pte & PRESENT == 0 {
        return None;
    }
    Some((pte & 0xFFFF_F000) + (virt & 0xFFF))
}

/// Translate `virt` through PAE tables (4-entry PDPT, 2 MiB or 4 KiB leaves).
pub fn walk_pae(mem: &mut SparseMemory, cr3: u64, virt: u64) -> Option<u64> {
    let mask = 0x000F_FFFF_FFFF_F000;
    let pdpte = mem.read_u64(cr3 + ((virt >> 30) & 0x3) * 8).ok()?;
    if pdpte & PRESENT == 0 {
        return None;
    }
    let pde = mem.read_u64((pdpte & mask) + ((virt >> 21) & 0x1FF) * 8).ok()?;
    if pde & PRESENT == 0 {
        return None;
    }
    if pde & LARGE != 0 {
        return Some((pde & mask & !0x1F_FFFF) + (virt & 0x1F_FFFF));
    }
    let pte = mem.read_u64((pde & mask) + ((virt >> 12) & 0x1FF) * 8).ok()?;
    if pte & PRESENT == 0 {
        return None;
    }
    Some((pte & mask) + (virt & 0xFFF))
}
