// UEFI Block I/O disks for the device registry

use alloc::vec;
use alloc::vec::Vec;

use laos_core::disk::{BlockDevice, DiskKind};
use laos_core::{Error, Result};

use super::status_to_error;
use super::tables::{BlockIoMedia, BlockIoProtocol, EFI_SUCCESS};

impl BlockIoProtocol {
    /// Read `buffer.len()` bytes starting at `lba` straight into `buffer`.
    pub fn read_sectors(&mut self, lba: u64, buffer: &mut [u8]) -> core::result::Result<(), usize> {
        // SAFETY: media stays valid for as long as the protocol does.
        let media_id = unsafe { (*self.media).media_id };
        let status = (self.read_blocks)(self, media_id, lba, buffer.len(), buffer.as_mut_ptr());
        if status == EFI_SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }
}

/// Physical disk kind from the media flags. Removable 2 KiB read-only
/// media is taken to be an optical drive.
pub fn classify(media: &BlockIoMedia) -> DiskKind {
    if media.removable_media && media.block_size == 2048 && media.read_only {
        DiskKind::Cd
    } else if media.removable_media {
        DiskKind::Removable
    } else {
        DiskKind::Fixed
    }
}

/// One whole-disk Block I/O instance.
pub struct UefiDisk {
    protocol: *mut BlockIoProtocol,
    block_size: usize,
    io_align: usize,
    /// Aligned staging area, grown on demand
    bounce: Vec<u8>,
}

impl UefiDisk {
    /// # Safety
    /// `protocol` must stay valid until boot services are exited.
    pub unsafe fn new(protocol: *mut BlockIoProtocol) -> Self {
        let media = &*(*protocol).media;
        Self {
            protocol,
            block_size: media.block_size as usize,
            io_align: (media.io_align as usize).max(1),
            bounce: Vec::new(),
        }
    }

    fn is_aligned(&self, buf: &[u8]) -> bool {
        (buf.as_ptr() as usize) % self.io_align == 0
    }

    fn read_bounced(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let needed = buf.len() + self.io_align;
        if self.bounce.len() < needed {
            self.bounce = vec![0u8; needed];
        }
        let offset = self.bounce.as_ptr().align_offset(self.io_align);
        let staging = &mut self.bounce[offset..offset + buf.len()];

        // SAFETY: the pointer came from the firmware and outlives us.
        let protocol = unsafe { &mut *self.protocol };
        protocol.read_sectors(lba, staging).map_err(status_to_error)?;
        buf.copy_from_slice(staging);
        Ok(())
    }
}

impl BlockDevice for UefiDisk {
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() % self.block_size != 0 {
            return Err(Error::Invalid);
        }
        if !self.is_aligned(buf) {
            return self.read_bounced(lba, buf);
        }
        // SAFETY: the pointer came from the firmware and outlives us.
        let protocol = unsafe { &mut *self.protocol };
        protocol.read_sectors(lba, buf).map_err(status_to_error)
    }
}
