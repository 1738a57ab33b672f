//! Boot-info block handed to the kernel
//!
//! One contiguous region tagged [`RegionKind::BootInfo`]:
//!
//! ```text
//! +0      header (112 bytes, little-endian)
//! +112    command line, boot device id, module names (NUL terminated)
//! ...     module array    (24 bytes each: base, size, name pointer)
//! ...     memory map      (20 bytes each: base, size, kind code)
//! ```
//!
//! All pointers are physical addresses, which the loader also identity
//! maps. The memory map array is sized with slack so it can be rewritten
//! in place when the firmware map changes under us.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::memory::{AllocFlags, AllocRequest, MemoryManager, PhysicalMemory, Region, RegionKind};
use crate::platform::{FirmwareKind, FramebufferInfo};
use crate::{align_up, Error, Result, PAGE_SIZE};

pub const BOOT_INFO_MAGIC: u32 = 0x4C41_4F53;
pub const BOOT_INFO_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 112;
pub const MMAP_ENTRY_SIZE: usize = 20;
pub const MODULE_ENTRY_SIZE: usize = 24;

/// Spare memory-map slots for regions created after the block is sized.
const MMAP_SLACK: usize = 32;

mod offset {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const FIRMWARE: usize = 8;
    pub const HEADER_SIZE: usize = 12;
    pub const CMDLINE: usize = 16;
    pub const MMAP: usize = 24;
    pub const MMAP_COUNT: usize = 32;
    pub const MMAP_ENTRY_SIZE: usize = 36;
    pub const FB_BASE: usize = 40;
    pub const FB_WIDTH: usize = 48;
    pub const FB_HEIGHT: usize = 52;
    pub const FB_PITCH: usize = 56;
    pub const FB_BPP: usize = 60;
    pub const MODULES: usize = 64;
    pub const MODULE_COUNT: usize = 72;
    pub const SYSTEM_TABLE: usize = 80;
    pub const BOOT_DEVICE: usize = 88;
    pub const STACK_BASE: usize = 96;
    pub const STACK_SIZE: usize = 104;
}

/// A file loaded next to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: u64,
    pub size: u64,
    pub name: String,
}

/// Everything besides the memory map that goes into the block.
#[derive(Debug, Clone)]
pub struct BootInfoParams<'a> {
    pub firmware: FirmwareKind,
    pub cmdline: &'a str,
    pub boot_device: &'a str,
    pub modules: &'a [ModuleInfo],
    pub framebuffer: Option<FramebufferInfo>,
    pub system_table: u64,
    pub stack_base: u64,
    pub stack_size: u64,
}

/// Placement of a block in physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfoBlock {
    pub phys: u64,
    pub size: u64,
    mmap: u64,
    mmap_capacity: usize,
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    (get_u32(buf, at) as u64) | ((get_u32(buf, at + 4) as u64) << 32)
}

fn strings_len(params: &BootInfoParams<'_>) -> usize {
    params.cmdline.len()
        + 1
        + params.boot_device.len()
        + 1
        + params.modules.iter().map(|m| m.name.len() + 1).sum::<usize>()
}

impl BootInfoBlock {
    /// Claim a region big enough for `params` and a memory map of up to
    /// `regions` entries plus slack.
    pub fn allocate(mem: &mut MemoryManager, params: &BootInfoParams<'_>, regions: usize) -> Result<Self> {
        let modules_at = align_up((HEADER_SIZE + strings_len(params)) as u64, 8);
        let mmap_at = align_up(modules_at + (params.modules.len() * MODULE_ENTRY_SIZE) as u64, 8);
        let mmap_capacity = regions + MMAP_SLACK;
        let size = align_up(mmap_at + (mmap_capacity * MMAP_ENTRY_SIZE) as u64, PAGE_SIZE);

        let phys = mem.allocate_with(
            AllocRequest::new(size, RegionKind::BootInfo)
                .flags(AllocFlags::BELOW_4G | AllocFlags::HIGH)
                .owner("bootinfo"),
        )?;
        Ok(Self {
            phys,
            size,
            mmap: phys + mmap_at,
            mmap_capacity,
        })
    }

    pub fn memory_map_capacity(&self) -> usize {
        self.mmap_capacity
    }

    /// Write the whole block. `params` must be what `allocate` was sized for.
    pub fn write<M: PhysicalMemory + ?Sized>(
        &self,
        phys: &mut M,
        params: &BootInfoParams<'_>,
        regions: &[Region],
    ) -> Result<()> {
        let head_len = (self.mmap - self.phys) as usize;
        let mut buf = vec![0u8; head_len];

        // Strings right after the header.
        let mut cursor = HEADER_SIZE;
        let mut put_str = |buf: &mut Vec<u8>, s: &str| -> Result<u64> {
            let end = cursor + s.len() + 1;
            if end > buf.len() {
                return Err(Error::NoMemory);
            }
            buf[cursor..end - 1].copy_from_slice(s.as_bytes());
            let at = self.phys + cursor as u64;
            cursor = end;
            Ok(at)
        };
        let cmdline = put_str(&mut buf, params.cmdline)?;
        let boot_device = put_str(&mut buf, params.boot_device)?;
        let mut names = Vec::with_capacity(params.modules.len());
        for module in params.modules {
            names.push(put_str(&mut buf, &module.name)?);
        }

        let modules_at = align_up(cursor as u64, 8) as usize;
        if modules_at + params.modules.len() * MODULE_ENTRY_SIZE > head_len {
            return Err(Error::NoMemory);
        }
        for (i, (module, name)) in params.modules.iter().zip(names).enumerate() {
            let at = modules_at + i * MODULE_ENTRY_SIZE;
            put_u64(&mut buf, at, module.base);
            put_u64(&mut buf, at + 8, module.size);
            put_u64(&mut buf, at + 16, name);
        }

        put_u32(&mut buf, offset::MAGIC, BOOT_INFO_MAGIC);
        put_u32(&mut buf, offset::VERSION, BOOT_INFO_VERSION);
        put_u32(&mut buf, offset::FIRMWARE, params.firmware.code());
        put_u32(&mut buf, offset::HEADER_SIZE, HEADER_SIZE as u32);
        put_u64(&mut buf, offset::CMDLINE, cmdline);
        put_u64(&mut buf, offset::MMAP, self.mmap);
        put_u32(&mut buf, offset::MMAP_ENTRY_SIZE, MMAP_ENTRY_SIZE as u32);
        if let Some(fb) = params.framebuffer {
            put_u64(&mut buf, offset::FB_BASE, fb.base);
            put_u32(&mut buf, offset::FB_WIDTH, fb.width);
            put_u32(&mut buf, offset::FB_HEIGHT, fb.height);
            put_u32(&mut buf, offset::FB_PITCH, fb.pitch);
            put_u32(&mut buf, offset::FB_BPP, fb.bpp);
        }
        if !params.modules.is_empty() {
            put_u64(&mut buf, offset::MODULES, self.phys + modules_at as u64);
        }
        put_u32(&mut buf, offset::MODULE_COUNT, params.modules.len() as u32);
        put_u64(&mut buf, offset::SYSTEM_TABLE, params.system_table);
        put_u64(&mut buf, offset::BOOT_DEVICE, boot_device);
        put_u64(&mut buf, offset::STACK_BASE, params.stack_base);
        put_u64(&mut buf, offset::STACK_SIZE, params.stack_size);

        phys.write(self.phys, &buf)?;
        self.update_memory_map(phys, regions)
    }

    /// Rewrite the memory map array and its count.
    pub fn update_memory_map<M: PhysicalMemory + ?Sized>(&self, phys: &mut M, regions: &[Region]) -> Result<()> {
        if regions.len() > self.mmap_capacity {
            log::warn!(
                "bootinfo: {} regions exceed room for {}",
                regions.len(),
                self.mmap_capacity
            );
            return Err(Error::NoMemory);
        }
        let mut buf = vec![0u8; regions.len() * MMAP_ENTRY_SIZE];
        for (entry, region) in buf.chunks_exact_mut(MMAP_ENTRY_SIZE).zip(regions) {
            put_u64(entry, 0, region.base);
            put_u64(entry, 8, region.size);
            put_u32(entry, 16, region.kind.code());
        }
        phys.write(self.mmap, &buf)?;
        phys.write_u32(self.phys + offset::MMAP_COUNT as u64, regions.len() as u32)
    }
}

/// Decoded header, as a kernel would see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfoHeader {
    pub magic: u32,
    pub version: u32,
    pub firmware: u32,
    pub cmdline: u64,
    pub mmap: u64,
    pub mmap_count: u32,
    pub framebuffer: Option<FramebufferInfo>,
    pub modules: u64,
    pub module_count: u32,
    pub system_table: u64,
    pub boot_device: u64,
    pub stack_base: u64,
    pub stack_size: u64,
}

impl BootInfoHeader {
    pub fn read<M: PhysicalMemory + ?Sized>(phys: &mut M, at: u64) -> Result<Self> {
        let mut raw = [0u8; HEADER_SIZE];
        phys.read(at, &mut raw)?;
        let u32_at = |o: usize| get_u32(&raw, o);
        let u64_at = |o: usize| get_u64(&raw, o);

        if u32_at(offset::MAGIC) != BOOT_INFO_MAGIC {
            return Err(Error::Invalid);
        }
        let fb_base = u64_at(offset::FB_BASE);
        Ok(Self {
            magic: u32_at(offset::MAGIC),
            version: u32_at(offset::VERSION),
            firmware: u32_at(offset::FIRMWARE),
            cmdline: u64_at(offset::CMDLINE),
            mmap: u64_at(offset::MMAP),
            mmap_count: u32_at(offset::MMAP_COUNT),
            framebuffer: (fb_base != 0).then(|| FramebufferInfo {
                base: fb_base,
                width: u32_at(offset::FB_WIDTH),
                height: u32_at(offset::FB_HEIGHT),
                pitch: u32_at(offset::FB_PITCH),
                bpp: u32_at(offset::FB_BPP),
            }),
            modules: u64_at(offset::MODULES),
            module_count: u32_at(offset::MODULE_COUNT),
            system_table: u64_at(offset::SYSTEM_TABLE),
            boot_device: u64_at(offset::BOOT_DEVICE),
            stack_base: u64_at(offset::STACK_BASE),
            stack_size: u64_at(offset::STACK_SIZE),
        })
    }

    /// Memory map entries as `(base, size, kind code)`.
    pub fn memory_map<M: PhysicalMemory + ?Sized>(&self, phys: &mut M) -> Result<Vec<(u64, u64, u32)>> {
        let mut raw = vec![0u8; self.mmap_count as usize * MMAP_ENTRY_SIZE];
        phys.read(self.mmap, &mut raw)?;
        Ok(raw
            .chunks_exact(MMAP_ENTRY_SIZE)
            .map(|e| (get_u64(e, 0), get_u64(e, 8), get_u32(e, 16)))
            .collect())
    }
}

/// Read a NUL-terminated string the block points at.
pub fn read_c_string<M: PhysicalMemory + ?Sized>(phys: &mut M, mut at: u64) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let mut b = [0u8; 1];
        phys.read(at, &mut b)?;
        if b[0] == 0 {
            break;
        }
        bytes.push(b[0]);
        at += 1;
        if bytes.len() > PAGE_SIZE as usize {
            return Err(Error::Invalid);
        }
    }
    String::from_utf8(bytes).map_err(|_| Error::Invalid)
}
