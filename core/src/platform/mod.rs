//! Firmware back-end contract
//!
//! The core never talks to firmware directly. A back end (UEFI or legacy
//! BIOS, both in the `laos-bootloader` crate) implements [`Platform`] and
//! the pipeline drives it. After `init` the console works and the memory
//! map can be fetched; disks appear with `scan_devices`; `finalise` tears
//! firmware services down right before `enter_kernel`.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::disk::{BlockDevice, DiskKind};
use crate::memory::FirmwareRange;
use crate::pipeline::HandoffPlan;
use crate::Result;

/// Line-oriented text output. Writes may nest: the logger can be called
/// from code that is itself printing.
pub trait Console: Sync {
    fn write_str(&self, s: &str);
}

/// Firmware tag stored in the boot-info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FirmwareKind {
    Bios = 1,
    Uefi = 2,
}

impl FirmwareKind {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            FirmwareKind::Bios => "BIOS",
            FirmwareKind::Uefi => "UEFI",
        }
    }
}

/// Linear frame buffer left set up by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per scan line
    pub pitch: u32,
    pub bpp: u32,
}

impl FramebufferInfo {
    pub fn size(&self) -> u64 {
        self.pitch as u64 * self.height as u64
    }
}

/// Firmware memory map plus the key that `finalise` must be given.
#[derive(Debug, Clone)]
pub struct MemoryMapSnapshot {
    pub ranges: Vec<FirmwareRange>,
    /// UEFI map key; zero on BIOS
    pub key: u64,
}

/// A disk found by the back end, ready for the registry.
pub struct DiskDescriptor {
    pub kind: DiskKind,
    pub block_size: u32,
    pub block_count: u64,
    pub device: Box<dyn BlockDevice>,
    /// The disk the firmware loaded us from
    pub boot: bool,
}

pub trait Platform {
    /// Bring up the console and whatever the memory map query needs.
    fn init(&mut self) -> Result<()>;

    fn firmware(&self) -> FirmwareKind;

    fn console(&self) -> &'static dyn Console;

    fn memory_map(&mut self) -> Result<MemoryMapSnapshot>;

    fn scan_devices(&mut self) -> Result<Vec<DiskDescriptor>>;

    /// Busy-wait for `us` microseconds.
    fn spin(&mut self, us: u64);

    /// A pending key press, if any. Never blocks.
    fn poll_key(&mut self) -> Option<u16>;

    fn framebuffer(&self) -> Option<FramebufferInfo>;

    /// Physical address of the UEFI system table, zero on BIOS.
    fn system_table(&self) -> u64 {
        0
    }

    /// Highest physical address (exclusive) the loader can write to.
    fn physical_ceiling(&self) -> u64 {
        u64::MAX
    }

    /// Whether the CPU supports 1 GiB pages.
    fn allow_huge_pages(&self) -> bool {
        false
    }

    /// Whether the CPU can enable EFER.NXE.
    fn supports_no_execute(&self) -> bool {
        true
    }

    /// Flat, position-independent hand-off code copied into the
    /// trampoline page.
    fn trampoline_code(&self) -> &'static [u8];

    /// Terminate firmware services. A stale `map_key` yields `Invalid`
    /// and leaves services running so the caller can refresh and retry.
    fn finalise(&mut self, map_key: u64) -> Result<()>;

    /// Jump through the trampoline. Firmware is gone by now.
    fn enter_kernel(&mut self, plan: &HandoffPlan) -> !;

    fn halt(&mut self) -> !;
}
