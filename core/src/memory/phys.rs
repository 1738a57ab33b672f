//! Access to physical memory
//!
//! Nothing in the loader dereferences a physical address directly. Table
//! writes, segment copies and the boot-info block all go through
//! [`PhysicalMemory`], which on hardware is a plain identity mapping and in
//! tests is a simulated address space.

use crate::{Error, Result};

pub trait PhysicalMemory {
    fn read(&mut self, phys: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, phys: u64, data: &[u8]) -> Result<()>;

    fn fill(&mut self, phys: u64, byte: u8, len: u64) -> Result<()>;

    fn read_u32(&mut self, phys: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(phys, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_u64(&mut self, phys: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read(phys, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn write_u32(&mut self, phys: u64, value: u32) -> Result<()> {
        self.write(phys, &value.to_le_bytes())
    }

    fn write_u64(&mut self, phys: u64, value: u64) -> Result<()> {
        self.write(phys, &value.to_le_bytes())
    }
}

/// Physical memory reached through the loader's identity mapping.
///
/// Firmware hands control over with paging either off (BIOS) or with all
/// RAM identity mapped (UEFI), so a physical address is also a pointer.
pub struct IdentityMapped {
    limit: u64,
}

impl IdentityMapped {
    /// # Safety
    /// Every address below `limit` handed to this accessor must be identity
    /// mapped and owned by the caller, as the memory manager guarantees for
    /// its allocations.
    pub const unsafe fn new(limit: u64) -> Self {
        Self { limit }
    }

    fn check(&self, phys: u64, len: u64) -> Result<()> {
        let end = phys.checked_add(len).ok_or(Error::Invalid)?;
        // Page zero is never handed out; a zero address is a bug upstream.
        if phys < crate::PAGE_SIZE || end > self.limit || end > usize::MAX as u64 {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

impl PhysicalMemory for IdentityMapped {
    fn read(&mut self, phys: u64, buf: &mut [u8]) -> Result<()> {
        self.check(phys, buf.len() as u64)?;
        // SAFETY: range validated against the identity-mapped limit
        unsafe {
            core::ptr::copy_nonoverlapping(phys as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&mut self, phys: u64, data: &[u8]) -> Result<()> {
        self.check(phys, data.len() as u64)?;
        // SAFETY: range validated against the identity-mapped limit
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), phys as usize as *mut u8, data.len());
        }
        Ok(())
    }

    fn fill(&mut self, phys: u64, byte: u8, len: u64) -> Result<()> {
        self.check(phys, len)?;
        // SAFETY: range validated against the identity-mapped limit
        unsafe {
            core::ptr::write_bytes(phys as usize as *mut u8, byte, len as usize);
        }
        Ok(())
    }
}
