//! Legacy BIOS back end
//!
//! Entered from the stage loader in flat 32-bit protected mode with
//! paging off. Firmware services are reached through the real-mode
//! thunk: E820 for memory, INT 13h extensions for disks, INT 16h for the
//! keyboard. Time comes from PIT channel 2, text goes to VGA and COM1.

pub mod console;
pub mod disk;
pub mod realmode;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::arch::asm;

use laos_core::memory::{FirmwareRange, RegionKind};
use laos_core::pipeline::HandoffPlan;
use laos_core::platform::{
    Console, DiskDescriptor, FirmwareKind, FramebufferInfo, MemoryMapSnapshot, Platform,
};
use laos_core::{align_down, align_up, Error, Result, PAGE_SIZE};

use crate::{cpu, heap};
use console::{serial_getc, CONSOLE};
use realmode::{segment, offset, Regs, LOW_AREA_END, SCRATCH_ADDR};

static HANDOFF: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/handoff32.bin"));

const ONE_MIB: u64 = 0x10_0000;
const FOUR_GIB: u64 = 0x1_0000_0000;

const MAX_E820_ENTRIES: usize = 128;
const SMAP: u32 = 0x534D_4150;

/// Hand-over block from the stage loader.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StageInfo {
    /// BIOS drive number the stage was read from
    pub boot_drive: u32,
    /// Physical load address and size of this image
    pub image_base: u32,
    pub image_size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct E820Entry {
    base: u64,
    size: u64,
    kind: u32,
}

/// Read the E820 map into a fixed table; runs before the heap exists.
fn read_e820(table: &mut [E820Entry; MAX_E820_ENTRIES]) -> usize {
    let mut count = 0;
    let mut continuation = 0u32;
    realmode::with_low_memory(|low| {
        while count < MAX_E820_ENTRIES {
            let mut regs = Regs {
                eax: 0xE820,
                ebx: continuation,
                ecx: 24,
                edx: SMAP,
                edi: u32::from(offset(SCRATCH_ADDR)),
                es: segment(SCRATCH_ADDR),
                ..Default::default()
            };
            // SAFETY: ES:DI points at the scratch block we hold.
            unsafe { low.call(0x15, &mut regs) };
            if regs.carry() || regs.eax != SMAP {
                break;
            }

            let raw = low.scratch();
            let field = |at: usize| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw[at..at + 8]);
                u64::from_le_bytes(bytes)
            };
            let entry = E820Entry {
                base: field(0),
                size: field(8),
                kind: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
            };
            if entry.size != 0 {
                table[count] = entry;
                count += 1;
            }

            continuation = regs.ebx;
            if continuation == 0 {
                break;
            }
        }
    });
    count
}

/// Highest 4 KiB-aligned spot for `size` bytes in usable RAM between
/// 1 MiB and 4 GiB that stays clear of `avoid`.
fn carve_heap(entries: &[E820Entry], size: u64, avoid: (u64, u64)) -> Option<u64> {
    let mut best: Option<u64> = None;
    for entry in entries.iter().filter(|e| e.kind == 1) {
        let start = align_up(entry.base.max(ONE_MIB), PAGE_SIZE);
        let end = align_down(entry.base.saturating_add(entry.size).min(FOUR_GIB), PAGE_SIZE);
        if end <= start {
            continue;
        }

        // The usable range minus the image: at most two pieces.
        let (avoid_start, avoid_end) = (align_down(avoid.0, PAGE_SIZE), align_up(avoid.1, PAGE_SIZE));
        let pieces = if avoid_end <= start || avoid_start >= end {
            [(start, end), (0, 0)]
        } else {
            [(start, avoid_start.max(start)), (avoid_end.min(end), end)]
        };

        for (lo, hi) in pieces {
            if hi > lo && hi - lo >= size {
                let base = hi - size;
                if best.map_or(true, |b| base > b) {
                    best = Some(base);
                }
            }
        }
    }
    best
}

/// Print an error seen before the loader proper is up.
pub fn early_error(error: Error) {
    CONSOLE.write_str("error: ");
    CONSOLE.write_str(error.kind_name());
    CONSOLE.write_str(": BIOS platform initialisation\n");
}

pub struct BiosPlatform {
    info: StageInfo,
    firmware_map: Vec<FirmwareRange>,
    heap_base: u64,
    huge_pages: bool,
}

impl BiosPlatform {
    /// Install the thunk, read E820 and set up the heap.
    ///
    /// # Safety
    /// Must run once, in flat 32-bit protected mode, with the low 64 KiB
    /// free for the loader.
    pub unsafe fn new(info: &StageInfo) -> Result<Self> {
        CONSOLE.init();
        realmode::install();

        let mut table = [E820Entry::default(); MAX_E820_ENTRIES];
        let count = read_e820(&mut table);
        if count == 0 {
            return Err(Error::NotSupported);
        }
        let entries = &table[..count];

        let image = (
            u64::from(info.image_base),
            u64::from(info.image_base) + u64::from(info.image_size),
        );
        let heap_base = carve_heap(entries, heap::HEAP_SIZE as u64, image).ok_or(Error::NoMemory)?;
        heap::init(heap_base as usize as *mut u8, heap::HEAP_SIZE);

        let firmware_map = entries
            .iter()
            .map(|e| FirmwareRange::new(e.base, e.size, RegionKind::from_e820(e.kind)))
            .collect();

        Ok(Self {
            info: *info,
            firmware_map,
            heap_base,
            huge_pages: cpu::has_huge_pages(),
        })
    }

    fn image_range(&self) -> FirmwareRange {
        let base = align_down(u64::from(self.info.image_base), PAGE_SIZE);
        let end = align_up(
            u64::from(self.info.image_base) + u64::from(self.info.image_size),
            PAGE_SIZE,
        );
        FirmwareRange::new(base, end - base, RegionKind::Reclaimable)
    }

    fn boot_drive(&self) -> u8 {
        self.info.boot_drive as u8
    }

    /// Busy-wait on PIT channel 2 in one-shot mode, up to ~54 ms a go.
    fn pit_wait(us: u64) {
        const PIT_HZ: u64 = 1_193_182;
        const MAX_CHUNK_US: u64 = 54_000;

        let mut remaining = us;
        while remaining > 0 {
            let chunk = remaining.min(MAX_CHUNK_US);
            let ticks = (chunk * PIT_HZ / 1_000_000).max(1) as u16;
            // SAFETY: PIT and port 0x61 gate; speaker stays off.
            unsafe {
                let gate = cpu::inb(0x61);
                cpu::outb(0x61, (gate & !0x02) | 0x01);
                cpu::outb(0x43, 0xB0);
                cpu::outb(0x42, ticks as u8);
                cpu::outb(0x42, (ticks >> 8) as u8);
                while cpu::inb(0x61) & 0x20 == 0 {
                    core::hint::spin_loop();
                }
            }
            remaining -= chunk;
        }
    }
}

impl Platform for BiosPlatform {
    fn init(&mut self) -> Result<()> {
        log::debug!(
            "stage: drive {:#x}, image {:#x}+{:#x}, heap {:#x}",
            self.info.boot_drive,
            self.info.image_base,
            self.info.image_size,
            self.heap_base
        );
        Ok(())
    }

    fn firmware(&self) -> FirmwareKind {
        FirmwareKind::Bios
    }

    fn console(&self) -> &'static dyn Console {
        &CONSOLE
    }

    fn memory_map(&mut self) -> Result<MemoryMapSnapshot> {
        let mut ranges = self.firmware_map.clone();
        // Overlaps are settled in favour of the non-free kind.
        ranges.push(FirmwareRange::new(0, LOW_AREA_END, RegionKind::Reclaimable));
        ranges.push(self.image_range());
        ranges.push(FirmwareRange::new(
            self.heap_base,
            heap::HEAP_SIZE as u64,
            RegionKind::Reclaimable,
        ));
        Ok(MemoryMapSnapshot { ranges, key: 0 })
    }

    fn scan_devices(&mut self) -> Result<Vec<DiskDescriptor>> {
        let boot = self.boot_drive();
        // SAFETY: the BIOS data area byte at 0x475 counts hard disks.
        let hard_disks = unsafe { core::ptr::read_volatile(0x475 as *const u8) };

        let mut drives: Vec<u8> = (0..hard_disks.min(16)).map(|i| 0x80 + i).collect();
        if !drives.contains(&boot) {
            drives.push(boot);
        }

        let mut disks = Vec::new();
        for drive in drives {
            let Some(geometry) = disk::probe(drive) else {
                log::debug!("drive {:#x}: no EDD support, skipped", drive);
                continue;
            };
            disks.push(DiskDescriptor {
                kind: disk::classify(drive, &geometry),
                block_size: geometry.sector_size,
                block_count: geometry.sectors,
                device: Box::new(disk::BiosDisk::new(drive, &geometry)),
                boot: drive == boot,
            });
        }
        Ok(disks)
    }

    fn spin(&mut self, us: u64) {
        Self::pit_wait(us);
    }

    fn poll_key(&mut self) -> Option<u16> {
        let mut regs = Regs {
            eax: 0x0100,
            ..Default::default()
        };
        // SAFETY: thunk installed in `new`.
        unsafe { realmode::call_bios(0x16, &mut regs) };
        if regs.zero() {
            return serial_getc().map(u16::from);
        }

        let mut regs = Regs::default();
        // SAFETY: as above; a key is pending so AH=00h returns at once.
        unsafe { realmode::call_bios(0x16, &mut regs) };
        let ascii = regs.eax as u8;
        Some(if ascii != 0 {
            u16::from(ascii)
        } else {
            0x8000 | u16::from(regs.ah())
        })
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        None
    }

    fn physical_ceiling(&self) -> u64 {
        FOUR_GIB
    }

    fn allow_huge_pages(&self) -> bool {
        self.huge_pages
    }

    fn supports_no_execute(&self) -> bool {
        cpu::has_no_execute()
    }

    fn trampoline_code(&self) -> &'static [u8] {
        HANDOFF
    }

    fn finalise(&mut self, _map_key: u64) -> Result<()> {
        Ok(())
    }

    fn enter_kernel(&mut self, plan: &HandoffPlan) -> ! {
        let code = plan.code_address() as usize;
        let trampoline = plan.trampoline as usize;
        // SAFETY: the pipeline wrote the trampoline page below 4 GiB.
        unsafe {
            asm!(
                "cli",
                "jmp {0}",
                in(reg) code,
                in("esi") trampoline,
                options(noreturn)
            )
        }
    }

    fn halt(&mut self) -> ! {
        cpu::halt()
    }
}
