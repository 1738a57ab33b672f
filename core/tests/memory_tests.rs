//! Memory manager invariants over longer allocation sequences

mod common;

use common::{assert_covers, MIB};
use laos_core::memory::{AllocFlags, AllocRequest, FirmwareRange, MemoryManager, RegionKind};
use laos_core::{Error, PAGE_SIZE};

fn firmware_map() -> Vec<FirmwareRange> {
    vec![
        FirmwareRange::new(0, 0x9_F000, RegionKind::Free),
        FirmwareRange::new(0x9_F000, 0x6_1000, RegionKind::Reserved),
        FirmwareRange::new(MIB, 63 * MIB, RegionKind::Free),
        FirmwareRange::new(0xFEC0_0000, 0x1000, RegionKind::Reserved),
        FirmwareRange::new(0x1_0000_0000, 512 * MIB, RegionKind::Free),
    ]
}

/// Deterministic xorshift so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn allocations_stay_aligned_and_disjoint() {
    let ranges = firmware_map();
    let mut mm = MemoryManager::from_firmware(&ranges);
    let mut rng = Rng(0x5EED_1234);
    let kinds = [
        RegionKind::Allocated,
        RegionKind::Kernel,
        RegionKind::PageTables,
        RegionKind::Modules,
        RegionKind::Reclaimable,
    ];
    let mut live = Vec::new();

    for step in 0..400 {
        let size = 1 + rng.next() % (3 * MIB);
        let align = PAGE_SIZE << (rng.next() % 10);
        let kind = kinds[(rng.next() % kinds.len() as u64) as usize];
        let mut flags = AllocFlags::NONE;
        if rng.next() % 2 == 0 {
            flags = flags | AllocFlags::HIGH;
        }
        if rng.next() % 3 == 0 {
            flags = flags | AllocFlags::BELOW_4G;
        }

        match mm.allocate_with(AllocRequest::new(size, kind).align(align).flags(flags)) {
            Ok(base) => {
                assert_eq!(base % align, 0, "step {}", step);
                assert!(base >= laos_core::memory::ALLOC_FLOOR);
                if flags.contains(AllocFlags::BELOW_4G) {
                    assert!(base + size <= 0x1_0000_0000);
                }
                let region = mm.region_at(base).copied().unwrap();
                assert_eq!(region.base, base);
                assert_eq!(region.size, size.next_multiple_of(PAGE_SIZE));
                assert_eq!(region.kind, kind);
                live.push((base, kind));
            }
            Err(e) => assert_eq!(e, Error::NoMemory),
        }

        if rng.next() % 4 == 0 && !live.is_empty() {
            let (base, kind) = live.swap_remove((rng.next() % live.len() as u64) as usize);
            let freed = mm.free(base);
            if matches!(kind, RegionKind::Allocated | RegionKind::Reclaimable) {
                assert_eq!(freed, Ok(()));
            } else {
                assert_eq!(freed, Err(Error::Invalid));
            }
        }

        assert_covers(&mm, &ranges);
    }
}

#[test]
fn restore_returns_the_exact_snapshot() {
    let mut mm = MemoryManager::from_firmware(&firmware_map());
    mm.allocate(PAGE_SIZE, PAGE_SIZE, RegionKind::PageTables).unwrap();
    let before = mm.snapshot();
    let checkpoint = mm.checkpoint();

    mm.allocate_at(0x20_0000, 3 * MIB, RegionKind::Kernel, "kernel").unwrap();
    mm.allocate_with(AllocRequest::new(5 * PAGE_SIZE, RegionKind::BootInfo).flags(AllocFlags::HIGH))
        .unwrap();
    assert_ne!(mm.snapshot(), before);

    mm.restore(checkpoint);
    assert_eq!(mm.snapshot(), before);
}

#[test]
fn fixed_placement_needs_free_memory() {
    let mut mm = MemoryManager::from_firmware(&firmware_map());
    assert_eq!(mm.allocate_at(0x9_F000, PAGE_SIZE, RegionKind::Kernel, "kernel"), Err(Error::NoMemory));
    assert_eq!(mm.allocate_at(0x10_0800, PAGE_SIZE, RegionKind::Kernel, "kernel"), Err(Error::Invalid));

    mm.allocate_at(0x10_0000, 2 * PAGE_SIZE, RegionKind::Kernel, "kernel").unwrap();
    assert_eq!(
        mm.allocate_at(0x10_1000, PAGE_SIZE, RegionKind::Kernel, "kernel"),
        Err(Error::NoMemory)
    );
    // Running off the end of the free range.
    assert_eq!(
        mm.allocate_at(63 * MIB, 2 * MIB, RegionKind::Kernel, "kernel"),
        Err(Error::NoMemory)
    );
}

#[test]
fn ceiling_limits_placement() {
    let mut mm = MemoryManager::from_firmware(&firmware_map());
    mm.set_ceiling(0x1_0000_0000);
    let base = mm
        .allocate_with(AllocRequest::new(PAGE_SIZE, RegionKind::Allocated).flags(AllocFlags::HIGH))
        .unwrap();
    assert!(base < 0x1_0000_0000);
}

#[test]
fn firmware_changes_take_free_memory_away() {
    let ranges = firmware_map();
    let mut mm = MemoryManager::from_firmware(&ranges);
    let free = mm.total_free();

    let mut changed = ranges.clone();
    changed.push(FirmwareRange::new(0x30_0000, 0x2000, RegionKind::Reclaimable));
    mm.merge_firmware_changes(&changed);

    assert_eq!(mm.total_free(), free - 0x2000);
    assert_eq!(mm.region_at(0x30_1000).unwrap().kind, RegionKind::Reclaimable);
    assert_covers(&mm, &ranges);
}
