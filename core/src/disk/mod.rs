//! Block devices
//!
//! Firmware back ends hand over one [`BlockDevice`] per physical disk; the
//! [`DeviceRegistry`] turns them (and the partitions found on them) into a
//! flat catalogue addressed by ids such as `hd0` or `hd0,5`.

pub mod block_io;
pub mod registry;

pub use block_io::RegistryBlockIo;
pub use registry::{DeviceRegistry, DiskInfo};

use crate::Result;

/// Transport for a whole disk. Partitions never see one of these; their
/// reads are translated by the registry.
pub trait BlockDevice {
    /// Read whole blocks starting at `lba`. `buf.len()` is a multiple of
    /// the block size the device was registered with.
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()>;
}

/// Physical disk type, which also picks the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Fixed,
    Removable,
    Cd,
    Floppy,
}

impl DiskKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            DiskKind::Fixed | DiskKind::Removable => "hd",
            DiskKind::Cd => "cdrom",
            DiskKind::Floppy => "fd",
        }
    }

    fn counter(self) -> usize {
        match self {
            DiskKind::Fixed | DiskKind::Removable => 0,
            DiskKind::Cd => 1,
            DiskKind::Floppy => 2,
        }
    }
}
