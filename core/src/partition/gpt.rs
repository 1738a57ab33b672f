//! GPT scanning through gpt_disk_io

use alloc::vec;
use alloc::vec::Vec;

use gpt_disk_io::Disk;
use gpt_disk_types::GptPartitionType;

use super::{PartitionInfo, PartitionType};
use crate::disk::{DeviceRegistry, RegistryBlockIo};
use crate::{Error, Result};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

pub fn has_header_signature(block: &[u8]) -> bool {
    block.len() >= 8 && &block[..8] == GPT_SIGNATURE
}

/// Used entries of the primary GPT, numbered by entry index + 1.
pub fn scan(registry: &mut DeviceRegistry, disk: usize) -> Result<Vec<PartitionInfo>> {
    let info = registry.info(disk).ok_or(Error::NotFound)?;
    let block_count = info.block_count;
    let mut block = vec![0u8; info.block_size as usize];

    let io = RegistryBlockIo::new(registry, disk)?;
    let mut gpt = Disk::new(io).map_err(|_| Error::Io)?;

    let header = gpt
        .read_primary_gpt_header(&mut block)
        .map_err(|_| Error::Io)?;
    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|_| Error::Invalid)?;

    let iter = gpt
        .gpt_partition_entry_array_iter(layout, &mut block)
        .map_err(|_| Error::Io)?;

    let mut partitions = Vec::new();
    for (index, entry) in iter.enumerate() {
        let entry = entry.map_err(|_| Error::Io)?;
        if !entry.is_used() {
            continue;
        }

        let first = entry.starting_lba.to_u64();
        let last = entry.ending_lba.to_u64();
        if last < first || last >= block_count {
            log::warn!(
                "partition: GPT entry {} ({}..={}) outside disk, skipped",
                index + 1,
                first,
                last
            );
            continue;
        }

        // Copy out of the packed entry before comparing.
        let type_guid = entry.partition_type_guid;
        partitions.push(PartitionInfo {
            number: index as u32 + 1,
            kind: PartitionType::Gpt(type_guid.0),
            first_lba: first,
            sector_count: last - first + 1,
            bootable: type_guid == GptPartitionType::EFI_SYSTEM,
            container: false,
        });
    }

    Ok(partitions)
}
