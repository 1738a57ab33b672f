//! Partition table probing and partition-relative reads

mod common;

use common::builder::LINUX_DATA;
use common::{DiskBuilder, MemoryDisk};
use gpt_disk_types::GptPartitionType;
use laos_core::disk::{DeviceRegistry, DiskKind};
use laos_core::partition::{self, PartitionType, TableKind};
use laos_core::Error;

fn register(registry: &mut DeviceRegistry, data: Vec<u8>) -> usize {
    let disk = MemoryDisk::new(data, 512);
    let blocks = disk.block_count();
    registry
        .add_disk(DiskKind::Fixed, 512, blocks, Box::new(disk), true)
        .unwrap()
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn gpt_entries_replace_the_protective_mbr() {
    let disk = DiskBuilder::new()
        .gpt_partition(GptPartitionType::EFI_SYSTEM, 2048, 4095, patterned(4096, 1))
        .gpt_partition(LINUX_DATA, 4096, 20479, patterned(4096, 2))
        .build_gpt();

    let mut registry = DeviceRegistry::new();
    let hd0 = register(&mut registry, disk);
    assert_eq!(partition::detect(&mut registry, hd0), Ok(Some(TableKind::Gpt)));

    let parts = partition::scan(&mut registry, hd0).unwrap();
    assert_eq!(parts.len(), 2);
    assert!(parts.iter().all(|p| !matches!(p.kind, PartitionType::Mbr(0xEE))));
    assert_eq!(parts[0].number, 1);
    assert!(parts[0].bootable);
    assert_eq!((parts[1].first_lba, parts[1].sector_count), (4096, 16384));

    assert_eq!(partition::probe_all(&mut registry), 2);
    let mut head = [0u8; 16];
    registry.read_id("hd0,2", 0, &mut head).unwrap();
    assert_eq!(&head[..], &patterned(4096, 2)[..16]);
}

#[test]
fn logical_chain_is_numbered_in_order_and_loops_are_cut() {
    let disk = DiskBuilder::new()
        .logical(0x83, 64, patterned(512, 5))
        .logical(0x83, 64, patterned(512, 6))
        .logical(0x0C, 64, patterned(512, 7))
        .with_chain_loop()
        .build_mbr();

    let mut registry = DeviceRegistry::new();
    register(&mut registry, disk);
    assert_eq!(partition::probe_all(&mut registry), 4);

    let ids: Vec<&str> = registry.iter().map(|(_, info)| info.id.as_str()).collect();
    assert_eq!(ids, ["hd0", "hd0,1", "hd0,5", "hd0,6", "hd0,7"]);

    let container = registry.find("hd0,1").unwrap();
    assert!(registry.info(container).unwrap().container);

    for (id, seed) in [("hd0,5", 5), ("hd0,6", 6), ("hd0,7", 7)] {
        let mut first = [0u8; 8];
        registry.read_id(id, 0, &mut first).unwrap();
        assert_eq!(&first[..], &patterned(512, seed)[..8], "{}", id);
    }
}

#[test]
fn primary_partitions_keep_their_slot_numbers() {
    let disk = DiskBuilder::new()
        .primary(0x0C, true, 128, patterned(512, 1))
        .primary(0x83, false, 128, patterned(512, 2))
        .build_mbr();

    let mut registry = DeviceRegistry::new();
    let hd0 = register(&mut registry, disk);
    let parts = partition::scan(&mut registry, hd0).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].kind, PartitionType::Mbr(0x0C));
    assert!(parts[0].bootable);
    assert_eq!(parts[1].first_lba, 2048 + 128);
}

#[test]
fn reads_straddling_the_partition_end_are_clipped() {
    let disk = DiskBuilder::new()
        .primary(0x83, false, 8, patterned(8 * 512, 9))
        .primary(0x83, false, 8, vec![0xEE; 8 * 512])
        .build_mbr();

    let mut registry = DeviceRegistry::new();
    register(&mut registry, disk);
    partition::probe_all(&mut registry);
    let part = registry.find("hd0,1").unwrap();
    let size = registry.info(part).unwrap().size();
    assert_eq!(size, 8 * 512);

    let mut buf = vec![0u8; 1024];
    let read = registry.read(part, size - 100, &mut buf).unwrap();
    assert_eq!(read, 100);
    assert_eq!(&buf[..100], &patterned(8 * 512, 9)[8 * 512 - 100..]);
    // Nothing from the neighbouring partition leaked in.
    assert!(buf[100..].iter().all(|&b| b == 0));

    assert_eq!(registry.read_exact(part, size - 100, &mut buf), Err(Error::Io));
    assert_eq!(registry.read(part, size, &mut buf), Err(Error::Io));
}

#[test]
fn transient_read_errors_are_retried() {
    let disk = MemoryDisk::new(patterned(4096, 3), 512);
    let failures = disk.failures.clone();
    let reads = disk.reads.clone();
    failures.set(1);

    let mut registry = DeviceRegistry::new();
    let hd0 = registry
        .add_disk(DiskKind::Removable, 512, 8, Box::new(disk), false)
        .unwrap();
    let mut buf = [0u8; 512];
    registry.read_blocks(hd0, 2, &mut buf).unwrap();
    assert_eq!(&buf[..], &patterned(4096, 3)[1024..1536]);
    assert_eq!(reads.get(), 2);
}
