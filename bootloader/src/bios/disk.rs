// INT 13h extended disk access

use laos_core::disk::{BlockDevice, DiskKind};
use laos_core::{Error, Result};

use super::realmode::{self, segment, offset, Regs, BOUNCE_ADDR, BOUNCE_SIZE, DAP_ADDR, SCRATCH_ADDR};

const INT_DISK: u8 = 0x13;

/// Most BIOSes cap a single extended read at 127 sectors.
const MAX_SECTORS_PER_CALL: usize = 127;
const READ_ATTEMPTS: usize = 3;

/// EDD drive parameter flag: removable media
const EDD_REMOVABLE: u16 = 1 << 2;

/// What AH=48h reports about a drive.
#[derive(Debug, Clone, Copy)]
pub struct DriveGeometry {
    pub sectors: u64,
    pub sector_size: u32,
    pub removable: bool,
}

/// Query a drive through the EDD extensions. `None` when the drive is
/// absent or predates them.
pub fn probe(drive: u8) -> Option<DriveGeometry> {
    let mut regs = Regs {
        eax: 0x4100,
        ebx: 0x55AA,
        edx: u32::from(drive),
        ..Default::default()
    };
    // SAFETY: thunk installed during platform bring-up.
    unsafe { realmode::call_bios(INT_DISK, &mut regs) };
    if regs.carry() || regs.ebx & 0xFFFF != 0xAA55 || regs.ecx & 1 == 0 {
        return None;
    }

    realmode::with_low_memory(|low| {
        let params = low.scratch();
        params[..0x1E].fill(0);
        params[..2].copy_from_slice(&0x1Eu16.to_le_bytes());

        let mut regs = Regs {
            eax: 0x4800,
            edx: u32::from(drive),
            esi: u32::from(offset(SCRATCH_ADDR)),
            ds: segment(SCRATCH_ADDR),
            ..Default::default()
        };
        // SAFETY: DS:SI points at the scratch block we hold.
        unsafe { low.call(INT_DISK, &mut regs) };
        if regs.carry() {
            return None;
        }

        let params = low.scratch();
        let flags = u16::from_le_bytes([params[2], params[3]]);
        let sectors = u64::from_le_bytes(params[0x10..0x18].try_into().ok()?);
        let sector_size = u16::from_le_bytes([params[0x18], params[0x19]]);
        if sector_size == 0 || sectors == 0 {
            return None;
        }
        Some(DriveGeometry {
            sectors,
            sector_size: u32::from(sector_size),
            removable: flags & EDD_REMOVABLE != 0,
        })
    })
}

/// Disk kind for a BIOS drive number. Floppies sit below 0x80; a 2 KiB
/// sector size means an El Torito CD.
pub fn classify(drive: u8, geometry: &DriveGeometry) -> DiskKind {
    if drive < 0x80 {
        DiskKind::Floppy
    } else if geometry.sector_size == 2048 {
        DiskKind::Cd
    } else if geometry.removable {
        DiskKind::Removable
    } else {
        DiskKind::Fixed
    }
}

pub struct BiosDisk {
    drive: u8,
    sector_size: usize,
}

impl BiosDisk {
    pub fn new(drive: u8, geometry: &DriveGeometry) -> Self {
        Self {
            drive,
            sector_size: geometry.sector_size as usize,
        }
    }

    /// One AH=42h call through the bounce buffer.
    fn read_chunk(&mut self, lba: u64, out: &mut [u8]) -> Result<()> {
        let count = out.len() / self.sector_size;
        let drive = self.drive;
        realmode::with_low_memory(|low| {
            let dap = low.dap();
            dap[0] = 0x10;
            dap[1] = 0;
            dap[2..4].copy_from_slice(&(count as u16).to_le_bytes());
            dap[4..6].copy_from_slice(&offset(BOUNCE_ADDR).to_le_bytes());
            dap[6..8].copy_from_slice(&segment(BOUNCE_ADDR).to_le_bytes());
            dap[8..16].copy_from_slice(&lba.to_le_bytes());

            let mut last = 0;
            for _ in 0..READ_ATTEMPTS {
                let mut regs = Regs {
                    eax: 0x4200,
                    edx: u32::from(drive),
                    esi: u32::from(offset(DAP_ADDR)),
                    ds: segment(DAP_ADDR),
                    ..Default::default()
                };
                // SAFETY: DAP and bounce buffer are held through `low`.
                unsafe { low.call(INT_DISK, &mut regs) };
                if !regs.carry() {
                    out.copy_from_slice(&low.bounce()[..out.len()]);
                    return Ok(());
                }
                last = regs.ah();

                // Reset the controller before trying again.
                let mut reset = Regs {
                    edx: u32::from(drive),
                    ..Default::default()
                };
                // SAFETY: as above.
                unsafe { low.call(INT_DISK, &mut reset) };
            }
            log::debug!("drive {:#x}: read at {} failed, status {:#x}", drive, lba, last);
            Err(Error::Io)
        })
    }
}

impl BlockDevice for BiosDisk {
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() % self.sector_size != 0 {
            return Err(Error::Invalid);
        }
        let per_call = (BOUNCE_SIZE / self.sector_size).min(MAX_SECTORS_PER_CALL);
        if per_call == 0 {
            return Err(Error::NotSupported);
        }

        let mut lba = lba;
        for chunk in buf.chunks_mut(per_call * self.sector_size) {
            self.read_chunk(lba, chunk)?;
            lba += (chunk.len() / self.sector_size) as u64;
        }
        Ok(())
    }
}
