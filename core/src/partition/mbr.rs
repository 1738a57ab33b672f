//! Classical MBR and extended-partition chains

use alloc::vec;
use alloc::vec::Vec;

use super::{PartitionInfo, PartitionType};
use crate::disk::DeviceRegistry;
use crate::{Error, Result};

pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const PROTECTIVE_TYPE: u8 = 0xEE;

/// Longest logical-partition chain followed before giving up.
pub const MAX_CHAIN: usize = 32;

const ENTRY_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const FIRST_LOGICAL: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub bootable: u8,
    pub kind: u8,
    pub start_lba: u32,
    pub num_sectors: u32,
}

impl MbrEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            bootable: raw[0],
            kind: raw[4],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            num_sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == 0 || self.num_sectors == 0
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.kind, 0x05 | 0x0F | 0x85)
    }
}

/// Sector 0 of an MBR disk, or any EBR.
#[derive(Debug, Clone, Copy)]
pub struct MasterBootRecord {
    pub entries: [MbrEntry; 4],
}

impl MasterBootRecord {
    /// Parse a 512-byte record. `None` without the boot signature or when
    /// the entries cannot be a partition table (a boot sector's code).
    pub fn parse(sector: &[u8]) -> Option<Self> {
        if sector.len() < 512 {
            return None;
        }
        let signature = u16::from_le_bytes([sector[510], sector[511]]);
        if signature != MBR_SIGNATURE {
            return None;
        }

        let mut entries = [MbrEntry::parse(&[0; ENTRY_SIZE]); 4];
        for (i, entry) in entries.iter_mut().enumerate() {
            let at = ENTRY_OFFSET + i * ENTRY_SIZE;
            *entry = MbrEntry::parse(&sector[at..at + ENTRY_SIZE]);
            if entry.bootable != 0 && entry.bootable != 0x80 {
                return None;
            }
        }
        Some(Self { entries })
    }

    pub fn is_protective(&self) -> bool {
        self.entries.iter().any(|e| e.kind == PROTECTIVE_TYPE)
    }
}

/// Primaries 1-4, then logicals from 5 in chain order.
pub fn scan(registry: &mut DeviceRegistry, disk: usize) -> Result<Vec<PartitionInfo>> {
    let info = registry.info(disk).ok_or(Error::NotFound)?;
    let block_count = info.block_count;
    let mut sector = vec![0u8; info.block_size as usize];

    registry.read_blocks(disk, 0, &mut sector)?;
    let mbr = MasterBootRecord::parse(&sector).ok_or(Error::Invalid)?;

    let mut partitions = Vec::new();
    let mut next_logical = FIRST_LOGICAL;

    for (i, entry) in mbr.entries.iter().enumerate() {
        if entry.is_empty() {
            continue;
        }
        let first = entry.start_lba as u64;
        let count = entry.num_sectors as u64;
        if first == 0 || first + count > block_count {
            log::warn!(
                "partition: MBR entry {} ({}+{}) outside disk, skipped",
                i + 1,
                first,
                count
            );
            continue;
        }

        partitions.push(PartitionInfo {
            number: i as u32 + 1,
            kind: PartitionType::Mbr(entry.kind),
            first_lba: first,
            sector_count: count,
            bootable: entry.bootable == 0x80,
            container: entry.is_extended(),
        });

        if entry.is_extended() {
            walk_chain(
                registry,
                disk,
                first,
                first + count,
                &mut next_logical,
                &mut partitions,
            )?;
        }
    }

    Ok(partitions)
}

/// Follow the EBR list of the extended partition `[ext_start, ext_end)`.
///
/// Each EBR's first entry is a logical partition relative to the EBR, the
/// second points at the next EBR relative to the extended partition. A
/// revisited EBR or an overlong chain ends the walk with a warning.
fn walk_chain(
    registry: &mut DeviceRegistry,
    disk: usize,
    ext_start: u64,
    ext_end: u64,
    next_logical: &mut u32,
    out: &mut Vec<PartitionInfo>,
) -> Result<()> {
    let bs = registry.info(disk).ok_or(Error::NotFound)?.block_size as usize;
    let mut sector = vec![0u8; bs];
    let mut visited: Vec<u64> = Vec::new();
    let mut ebr_lba = ext_start;

    loop {
        if visited.len() == MAX_CHAIN {
            log::warn!(
                "partition: logical chain longer than {} links, truncated",
                MAX_CHAIN
            );
            break;
        }
        if visited.contains(&ebr_lba) {
            log::warn!(
                "partition: logical chain loops back to block {} at link {}, truncated",
                ebr_lba,
                visited.len() + 1
            );
            break;
        }
        if ebr_lba < ext_start || ebr_lba >= ext_end {
            log::warn!("partition: EBR at block {} outside container", ebr_lba);
            break;
        }
        visited.push(ebr_lba);

        registry.read_blocks(disk, ebr_lba, &mut sector)?;
        let Some(ebr) = MasterBootRecord::parse(&sector) else {
            log::warn!("partition: bad EBR signature at block {}", ebr_lba);
            break;
        };

        let logical = ebr.entries[0];
        if !logical.is_empty() {
            let first = ebr_lba + logical.start_lba as u64;
            let count = logical.num_sectors as u64;
            if first + count <= ext_end && logical.start_lba != 0 {
                out.push(PartitionInfo {
                    number: *next_logical,
                    kind: PartitionType::Mbr(logical.kind),
                    first_lba: first,
                    sector_count: count,
                    bootable: logical.bootable == 0x80,
                    container: false,
                });
                *next_logical += 1;
            } else {
                log::warn!(
                    "partition: logical at block {} overruns its container",
                    first
                );
            }
        }

        let link = ebr.entries[1];
        if link.is_empty() || !link.is_extended() {
            break;
        }
        ebr_lba = ext_start + link.start_lba as u64;
    }

    Ok(())
}
