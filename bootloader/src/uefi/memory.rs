// UEFI memory map access

use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr;

use laos_core::memory::{FirmwareRange, RegionKind};
use laos_core::PAGE_SIZE;

use super::tables::{
    BootServices, MemoryDescriptor, Status, ALLOCATE_ADDRESS, EFI_BUFFER_TOO_SMALL,
    EFI_CONVENTIONAL_MEMORY, EFI_SUCCESS,
};

/// Memory type for the pages we claim from firmware. Lives in the
/// OS-vendor range so nothing else hands it out.
pub const LAOS_MEMORY: u32 = 0x8000_4C41;

/// Pages of conventional memory left to the firmware for its own
/// allocations until ExitBootServices.
pub const FIRMWARE_SLACK_PAGES: u64 = 2048;

const ONE_MIB: u64 = 0x10_0000;
const FOUR_GIB: u64 = 0x1_0000_0000;

/// One GetMemoryMap result, kept as raw bytes.
pub struct MemoryMap {
    buffer: Vec<u8>,
    size: usize,
    pub map_key: usize,
    descriptor_size: usize,
}

impl MemoryMap {
    /// Fetch the current map.
    ///
    /// # Safety
    /// Boot services must still be running.
    pub unsafe fn snapshot(boot_services: &BootServices) -> Result<Self, Status> {
        let mut map = MemoryMap {
            buffer: Vec::new(),
            size: 0,
            map_key: 0,
            descriptor_size: size_of::<MemoryDescriptor>(),
        };
        let mut descriptor_version = 0u32;
        loop {
            let mut reported_size = map.buffer.len();
            let status = (boot_services.get_memory_map)(
                &mut reported_size,
                if map.buffer.is_empty() {
                    ptr::null_mut()
                } else {
                    map.buffer.as_mut_ptr()
                },
                &mut map.map_key,
                &mut map.descriptor_size,
                &mut descriptor_version,
            );

            if status == EFI_SUCCESS {
                map.size = reported_size;
                return Ok(map);
            }
            if status != EFI_BUFFER_TOO_SMALL {
                return Err(status);
            }
            // The growth itself can add descriptors on some firmware.
            map.buffer = vec![0u8; reported_size + map.descriptor_size * 8];
        }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = MemoryDescriptor> + '_ {
        let stride = self.descriptor_size.max(size_of::<MemoryDescriptor>());
        self.buffer[..self.size]
            .chunks_exact(stride)
            .map(|chunk| {
                // SAFETY: each chunk is at least one descriptor long.
                unsafe { ptr::read_unaligned(chunk.as_ptr() as *const MemoryDescriptor) }
            })
    }

    /// Translate into firmware ranges for the memory manager.
    ///
    /// Only pages claimed as [`LAOS_MEMORY`] are free for the loader;
    /// conventional memory the firmware kept is handed to the kernel as
    /// reclaimable.
    pub fn ranges(&self) -> Vec<FirmwareRange> {
        self.descriptors()
            .filter(|d| d.number_of_pages != 0)
            .map(|d| {
                let kind = match d.kind {
                    LAOS_MEMORY => RegionKind::Free,
                    EFI_CONVENTIONAL_MEMORY => RegionKind::Reclaimable,
                    other => RegionKind::from_uefi(other),
                };
                FirmwareRange::new(d.physical_start, d.number_of_pages * PAGE_SIZE, kind)
            })
            .collect()
    }
}

/// Claim conventional memory above 1 MiB for the loader.
///
/// The top [`FIRMWARE_SLACK_PAGES`] of the highest conventional range
/// below 4 GiB stay with the firmware. Returns the number of pages
/// claimed.
///
/// # Safety
/// Boot services must still be running.
pub unsafe fn claim_conventional(boot_services: &BootServices) -> Result<u64, Status> {
    let map = MemoryMap::snapshot(boot_services)?;

    let slack_owner = map
        .descriptors()
        .filter(|d| d.kind == EFI_CONVENTIONAL_MEMORY && d.end() <= FOUR_GIB)
        .map(|d| d.physical_start)
        .max();

    let mut claimed = 0;
    for d in map.descriptors() {
        if d.kind != EFI_CONVENTIONAL_MEMORY || d.end() <= ONE_MIB {
            continue;
        }
        let start = d.physical_start.max(ONE_MIB);
        let mut pages = (d.end() - start) / PAGE_SIZE;
        if Some(d.physical_start) == slack_owner {
            pages = pages.saturating_sub(FIRMWARE_SLACK_PAGES);
        }
        if pages == 0 {
            continue;
        }

        let mut address = start;
        let status = (boot_services.allocate_pages)(
            ALLOCATE_ADDRESS,
            LAOS_MEMORY,
            pages as usize,
            &mut address,
        );
        if status == EFI_SUCCESS {
            claimed += pages;
        } else {
            log::debug!("claim {:#x}+{} pages refused: {:#x}", start, pages, status);
        }
    }
    Ok(claimed)
}
