//! Common test utilities: in-memory disks, a simulated physical address
//! space and a scriptable platform back end.

#![allow(dead_code)]

pub mod builder;
pub mod elf;
pub mod paging;

pub use builder::{gzip, DiskBuilder, Ext2Builder, FatBuilder, IsoBuilder};
pub use elf::ElfBuilder;

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Mutex;

use laos_core::disk::{BlockDevice, DiskKind};
use laos_core::memory::{FirmwareRange, MemoryManager, PhysicalMemory, RegionKind};
use laos_core::pipeline::HandoffPlan;
use laos_core::platform::{
    Console, DiskDescriptor, FirmwareKind, FramebufferInfo, MemoryMapSnapshot, Platform,
};
use laos_core::{Error, Result};

pub const MIB: u64 = 1024 * 1024;

// ═══════════════════════════════════════════════════════════════════════════
// DISKS
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory block device
pub struct MemoryDisk {
    pub data: Vec<u8>,
    pub block_size: usize,
    /// Reads that fail with `Io` before the device starts answering
    pub failures: Rc<Cell<u32>>,
    pub reads: Rc<Cell<u64>>,
}

impl MemoryDisk {
    pub fn new(data: Vec<u8>, block_size: usize) -> Self {
        Self {
            data,
            block_size,
            failures: Rc::new(Cell::new(0)),
            reads: Rc::new(Cell::new(0)),
        }
    }

    pub fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }
}

impl BlockDevice for MemoryDisk {
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.reads.set(self.reads.get() + 1);
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            return Err(Error::Io);
        }
        let offset = lba as usize * self.block_size;
        if buf.len() % self.block_size != 0 || offset + buf.len() > self.data.len() {
            return Err(Error::Io);
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PHYSICAL MEMORY
// ═══════════════════════════════════════════════════════════════════════════

const PAGE: u64 = 4096;

/// Sparse simulated RAM. Untouched pages read as zero.
#[derive(Default)]
pub struct SparseMemory {
    pages: HashMap<u64, Box<[u8; PAGE as usize]>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, phys: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read(phys, &mut buf).unwrap();
        buf
    }

    pub fn touched_pages(&self) -> usize {
        self.pages.len()
    }

    fn page(&mut self, addr: u64) -> &mut [u8; PAGE as usize] {
        self.pages
            .entry(addr / PAGE)
            .or_insert_with(|| Box::new([0u8; PAGE as usize]))
    }
}

impl PhysicalMemory for SparseMemory {
    fn read(&mut self, phys: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = phys + done as u64;
            let within = (addr % PAGE) as usize;
            let n = (PAGE as usize - within).min(buf.len() - done);
            match self.pages.get(&(addr / PAGE)) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, phys: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let addr = phys + done as u64;
            let within = (addr % PAGE) as usize;
            let n = (PAGE as usize - within).min(data.len() - done);
            self.page(addr)[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn fill(&mut self, phys: u64, byte: u8, len: u64) -> Result<()> {
        self.write(phys, &vec![byte; len as usize])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PLATFORM
// ═══════════════════════════════════════════════════════════════════════════

/// Console that keeps everything written to it.
#[derive(Default)]
pub struct TestConsole {
    pub text: Mutex<String>,
}

impl Console for TestConsole {
    fn write_str(&self, s: &str) {
        self.text.lock().unwrap().push_str(s);
    }
}

impl TestConsole {
    pub fn leaked() -> &'static TestConsole {
        Box::leak(Box::new(TestConsole::default()))
    }

    pub fn contents(&self) -> String {
        self.text.lock().unwrap().clone()
    }
}

/// Counters shared between a test and the platform it moved into the
/// loader.
#[derive(Default)]
pub struct PlatformProbe {
    pub memory_maps: Cell<u32>,
    pub finalise_keys: std::cell::RefCell<Vec<u64>>,
}

pub struct FakePlatform {
    pub firmware: FirmwareKind,
    pub ranges: Vec<FirmwareRange>,
    pub disks: Vec<(DiskKind, MemoryDisk, bool)>,
    /// Results handed out by `finalise`, `Ok` once exhausted
    pub finalise_results: VecDeque<Result<()>>,
    pub keys: VecDeque<u16>,
    pub console: &'static TestConsole,
    pub probe: Rc<PlatformProbe>,
    pub huge_pages: bool,
    /// Firmware allocation that shows up from the second map query on
    pub late_range: Option<FirmwareRange>,
    map_key: u64,
}

/// Hand-off code stand-in: `hlt` padding.
static TRAMPOLINE_CODE: [u8; 16] = [0xF4; 16];

impl FakePlatform {
    /// BIOS-like machine with `free` bytes of RAM from 1 MiB up.
    pub fn new(free: u64) -> Self {
        Self {
            firmware: FirmwareKind::Bios,
            ranges: vec![
                FirmwareRange::new(0, 0x9_F000, RegionKind::Free),
                FirmwareRange::new(0x9_F000, 0x6_1000, RegionKind::Reserved),
                FirmwareRange::new(MIB, free, RegionKind::Free),
            ],
            disks: Vec::new(),
            finalise_results: VecDeque::new(),
            keys: VecDeque::new(),
            console: TestConsole::leaked(),
            probe: Rc::new(PlatformProbe::default()),
            huge_pages: false,
            late_range: None,
            map_key: 1,
        }
    }

    pub fn with_disk(mut self, data: Vec<u8>, boot: bool) -> Self {
        self.disks
            .push((DiskKind::Fixed, MemoryDisk::new(data, 512), boot));
        self
    }

    pub fn uefi(mut self) -> Self {
        self.firmware = FirmwareKind::Uefi;
        self
    }

    pub fn failing_finalise(mut self, results: &[Result<()>]) -> Self {
        self.finalise_results = results.iter().copied().collect();
        self
    }
}

impl Platform for FakePlatform {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn firmware(&self) -> FirmwareKind {
        self.firmware
    }

    fn console(&self) -> &'static dyn Console {
        self.console
    }

    fn memory_map(&mut self) -> Result<MemoryMapSnapshot> {
        self.probe.memory_maps.set(self.probe.memory_maps.get() + 1);
        self.map_key += 1;
        let mut ranges = self.ranges.clone();
        if self.probe.memory_maps.get() > 1 {
            ranges.extend(self.late_range);
        }
        Ok(MemoryMapSnapshot {
            ranges,
            key: self.map_key,
        })
    }

    fn scan_devices(&mut self) -> Result<Vec<DiskDescriptor>> {
        Ok(self
            .disks
            .drain(..)
            .map(|(kind, disk, boot)| DiskDescriptor {
                kind,
                block_size: disk.block_size as u32,
                block_count: disk.block_count(),
                device: Box::new(disk),
                boot,
            })
            .collect())
    }

    fn spin(&mut self, _us: u64) {}

    fn poll_key(&mut self) -> Option<u16> {
        self.keys.pop_front()
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        None
    }

    fn allow_huge_pages(&self) -> bool {
        self.huge_pages
    }

    fn trampoline_code(&self) -> &'static [u8] {
        &TRAMPOLINE_CODE
    }

    fn finalise(&mut self, map_key: u64) -> Result<()> {
        self.probe.finalise_keys.borrow_mut().push(map_key);
        match self.finalise_results.pop_front() {
            Some(result) => result,
            None if map_key == self.map_key => Ok(()),
            None => Err(Error::Invalid),
        }
    }

    fn enter_kernel(&mut self, plan: &HandoffPlan) -> ! {
        panic!("entered kernel at {:#x}", plan.entry)
    }

    fn halt(&mut self) -> ! {
        panic!("halted")
    }
}

/// Region list invariant: sorted, disjoint, and covering exactly `ranges`.
pub fn assert_covers(memory: &MemoryManager, ranges: &[FirmwareRange]) {
    let regions = memory.regions();
    for pair in regions.windows(2) {
        assert!(pair[0].end() <= pair[1].base, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    let total: u64 = regions.iter().map(|r| r.size).sum();
    let firmware: u64 = ranges.iter().map(|r| r.size).sum();
    assert_eq!(total, firmware);
    for region in regions {
        assert!(
            ranges
                .iter()
                .any(|r| region.base >= r.base && region.end() <= r.base + r.size),
            "{:?} outside the firmware map",
            region
        );
    }
}
