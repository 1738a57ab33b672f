//! Partition tables
//!
//! A fresh disk is probed for GPT first (protective MBR at LBA 0 plus the
//! `EFI PART` header at LBA 1) and for a classical MBR second. The table
//! kinds form a closed set, so dispatch is a plain `match`.

pub mod gpt;
pub mod mbr;

use alloc::vec;
use alloc::vec::Vec;
use uguid::Guid;

use crate::disk::DeviceRegistry;
use crate::{Error, Result};

/// Partition type as recorded in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Mbr(u8),
    Gpt(Guid),
}

/// One usable entry of a partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// 1-4 for MBR primaries, 5+ for logicals, entry index + 1 for GPT
    pub number: u32,
    pub kind: PartitionType,
    pub first_lba: u64,
    pub sector_count: u64,
    pub bootable: bool,
    /// Extended partition holding the logical chain
    pub container: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Mbr,
    Gpt,
}

/// Work out which table, if any, describes `disk`.
pub fn detect(registry: &mut DeviceRegistry, disk: usize) -> Result<Option<TableKind>> {
    let info = registry.info(disk).ok_or(Error::NotFound)?;
    let bs = info.block_size as usize;
    if info.block_count < 2 {
        return Ok(None);
    }

    let mut block = vec![0u8; bs];
    registry.read_blocks(disk, 0, &mut block)?;
    let Some(table) = mbr::MasterBootRecord::parse(&block) else {
        return Ok(None);
    };

    if table.is_protective() {
        registry.read_blocks(disk, 1, &mut block)?;
        if gpt::has_header_signature(&block) {
            return Ok(Some(TableKind::Gpt));
        }
        log::warn!("partition: protective MBR without a GPT header, ignoring disk");
        return Ok(None);
    }

    Ok(Some(TableKind::Mbr))
}

/// Read the partition table of `disk` without registering anything.
pub fn scan(registry: &mut DeviceRegistry, disk: usize) -> Result<Vec<PartitionInfo>> {
    match detect(registry, disk)? {
        Some(TableKind::Gpt) => gpt::scan(registry, disk),
        Some(TableKind::Mbr) => mbr::scan(registry, disk),
        None => Ok(Vec::new()),
    }
}

/// Scan `disk` and register its partitions. Returns the new node indices.
pub fn probe(registry: &mut DeviceRegistry, disk: usize) -> Result<Vec<usize>> {
    let partitions = scan(registry, disk)?;
    let mut nodes = Vec::with_capacity(partitions.len());
    for part in partitions {
        match registry.add_partition(
            disk,
            part.number,
            part.first_lba,
            part.sector_count,
            part.container,
        ) {
            Ok(index) => nodes.push(index),
            Err(e) => log::warn!(
                "partition: skipping entry {} ({})",
                part.number,
                e.kind_name()
            ),
        }
    }
    Ok(nodes)
}

/// Probe every whole disk currently registered. Failures are logged and
/// leave that disk without partitions.
pub fn probe_all(registry: &mut DeviceRegistry) -> usize {
    let disks: Vec<usize> = registry
        .iter()
        .filter(|(_, info)| !info.is_partition())
        .map(|(index, _)| index)
        .collect();

    let mut found = 0;
    for disk in disks {
        match probe(registry, disk) {
            Ok(nodes) => found += nodes.len(),
            Err(e) => {
                let id = registry.info(disk).map(|i| i.id.as_str()).unwrap_or("?");
                log::warn!("partition: probing {} failed: {}", id, e.kind_name());
            }
        }
    }
    found
}
