//! Hand-off trampoline page
//!
//! One page, allocated when memory comes up and identity mapped in the
//! kernel's tables, carries everything the final jump needs:
//!
//! ```text
//! 0x000  GDT: null, code32, data32, code16, data16, code64, data64
//! 0x040  GDTR (limit u16, base u64)
//! 0x050  parameters: cr3 u64, entry u64, boot_info u64, stack u64, mode u32
//! 0x100  trampoline code, supplied by the firmware back end
//! ```
//!
//! The code switches to the target paging mode, loads CR3 and the flat
//! selectors, and jumps to the kernel with the boot-info address in the
//! first argument register.

use crate::memory::PhysicalMemory;
use crate::mmu::PagingMode;
use crate::{Error, Result, PAGE_SIZE};

pub const GDT_OFFSET: u64 = 0x000;
pub const GDTR_OFFSET: u64 = 0x040;
pub const PARAMS_OFFSET: u64 = 0x050;
pub const CODE_OFFSET: u64 = 0x100;
pub const MAX_CODE_SIZE: usize = (PAGE_SIZE - CODE_OFFSET) as usize;

pub const SEL_CODE32: u16 = 0x08;
pub const SEL_DATA32: u16 = 0x10;
pub const SEL_CODE16: u16 = 0x18;
pub const SEL_DATA16: u16 = 0x20;
pub const SEL_CODE64: u16 = 0x28;
pub const SEL_DATA64: u16 = 0x30;

/// Flat descriptors in selector order.
const GDT: [u64; 7] = [
    0,
    0x00CF_9A00_0000_FFFF, // code32: base 0, 4 GiB, D=1
    0x00CF_9200_0000_FFFF, // data32
    0x0000_9A00_0000_FFFF, // code16: 64 KiB
    0x0000_9200_0000_FFFF, // data16
    0x00AF_9A00_0000_FFFF, // code64: L=1
    0x00CF_9200_0000_FFFF, // data64
];

/// Everything the final jump needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffPlan {
    pub mode: PagingMode,
    /// Root of the kernel's page tables
    pub cr3: u64,
    /// Virtual entry point
    pub entry: u64,
    /// Physical address of the boot-info block
    pub boot_info: u64,
    /// Initial stack pointer, 16-byte aligned
    pub stack_top: u64,
    /// Physical (and virtual) address of the trampoline page
    pub trampoline: u64,
}

impl HandoffPlan {
    /// Address of the first trampoline instruction.
    pub fn code_address(&self) -> u64 {
        self.trampoline + CODE_OFFSET
    }
}

/// Fill the trampoline page for `plan`.
pub fn write_trampoline<M: PhysicalMemory + ?Sized>(
    phys: &mut M,
    plan: &HandoffPlan,
    code: &[u8],
) -> Result<()> {
    if code.is_empty() || code.len() > MAX_CODE_SIZE {
        log::warn!("handoff: trampoline code of {} bytes does not fit", code.len());
        return Err(Error::Invalid);
    }
    let page = plan.trampoline;

    let mut gdt = [0u8; GDT.len() * 8];
    for (slot, desc) in gdt.chunks_exact_mut(8).zip(GDT) {
        slot.copy_from_slice(&desc.to_le_bytes());
    }
    phys.write(page + GDT_OFFSET, &gdt)?;

    let mut gdtr = [0u8; 10];
    gdtr[..2].copy_from_slice(&((gdt.len() - 1) as u16).to_le_bytes());
    gdtr[2..].copy_from_slice(&(page + GDT_OFFSET).to_le_bytes());
    phys.write(page + GDTR_OFFSET, &gdtr)?;

    phys.write_u64(page + PARAMS_OFFSET, plan.cr3)?;
    phys.write_u64(page + PARAMS_OFFSET + 0x08, plan.entry)?;
    phys.write_u64(page + PARAMS_OFFSET + 0x10, plan.boot_info)?;
    phys.write_u64(page + PARAMS_OFFSET + 0x18, plan.stack_top)?;
    phys.write_u32(page + PARAMS_OFFSET + 0x20, plan.mode.code())?;

    phys.write(page + CODE_OFFSET, code)
}
