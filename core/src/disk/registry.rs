//! Device Registry
//!
//! Disks and partitions share one table. A partition is a node with a
//! parent index and a start block; its reads are the parent's reads
//! shifted by that offset, all the way down to the disk that owns the
//! transport. Parents are always registered before their children, so a
//! node's index is larger than its parent's.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{BlockDevice, DiskKind};
use crate::{Error, Result};

/// Transport attempts per block run before giving up.
pub const READ_ATTEMPTS: usize = 3;

/// Largest run handed to a transport in one call.
const MAX_TRANSFER: usize = 64 * 1024;

/// Public description of a registry node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub id: String,
    pub kind: DiskKind,
    pub block_size: u32,
    pub block_count: u64,
    /// Index of the containing node, `None` for whole disks
    pub parent: Option<usize>,
    /// Start block on the parent
    pub offset_on_parent: u64,
    /// Partition number, 0 for whole disks
    pub number: u32,
    /// Extended-partition container; never mounted
    pub container: bool,
    /// The disk the loader itself was read from
    pub boot: bool,
}

impl DiskInfo {
    pub fn size(&self) -> u64 {
        self.block_count * self.block_size as u64
    }

    pub fn is_partition(&self) -> bool {
        self.parent.is_some()
    }
}

struct Node {
    info: DiskInfo,
    transport: Option<Box<dyn BlockDevice>>,
}

pub struct DeviceRegistry {
    nodes: Vec<Node>,
    counters: [u32; 3],
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            counters: [0; 3],
        }
    }

    /// Register a whole disk and return its index.
    pub fn add_disk(
        &mut self,
        kind: DiskKind,
        block_size: u32,
        block_count: u64,
        device: Box<dyn BlockDevice>,
        boot: bool,
    ) -> Result<usize> {
        if !block_size.is_power_of_two() || !(512..=4096).contains(&block_size) {
            log::warn!("disk: unsupported block size {}", block_size);
            return Err(Error::NotSupported);
        }

        let counter = &mut self.counters[kind.counter()];
        let id = format!("{}{}", kind.prefix(), counter);
        *counter += 1;

        log::info!(
            "disk: {} ({:?}, {} blocks of {} bytes{})",
            id,
            kind,
            block_count,
            block_size,
            if boot { ", boot" } else { "" }
        );

        self.nodes.push(Node {
            info: DiskInfo {
                id,
                kind,
                block_size,
                block_count,
                parent: None,
                offset_on_parent: 0,
                number: 0,
                container: false,
                boot,
            },
            transport: Some(device),
        });
        Ok(self.nodes.len() - 1)
    }

    /// Register partition `number` of `parent`, spanning `block_count`
    /// blocks from `first_block` (in the parent's blocks).
    pub fn add_partition(
        &mut self,
        parent: usize,
        number: u32,
        first_block: u64,
        block_count: u64,
        container: bool,
    ) -> Result<usize> {
        let parent_info = &self.nodes.get(parent).ok_or(Error::NotFound)?.info;
        let end = first_block.checked_add(block_count).ok_or(Error::Invalid)?;
        if block_count == 0 || end > parent_info.block_count {
            return Err(Error::Invalid);
        }

        let id = format!("{},{}", parent_info.id, number);
        if self.find(&id).is_some() {
            return Err(Error::Exists);
        }

        let info = DiskInfo {
            id,
            kind: parent_info.kind,
            block_size: parent_info.block_size,
            block_count,
            parent: Some(parent),
            offset_on_parent: first_block,
            number,
            container,
            boot: false,
        };
        log::info!(
            "disk: {} at block {} ({} blocks{})",
            info.id,
            first_block,
            block_count,
            if container { ", container" } else { "" }
        );

        self.nodes.push(Node {
            info,
            transport: None,
        });
        Ok(self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn info(&self, index: usize) -> Option<&DiskInfo> {
        self.nodes.get(index).map(|n| &n.info)
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.info.id == id)
    }

    /// Nodes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &DiskInfo)> {
        self.nodes.iter().enumerate().map(|(i, n)| (i, &n.info))
    }

    /// Direct children of `index`.
    pub fn children(&self, index: usize) -> impl Iterator<Item = (usize, &DiskInfo)> {
        self.iter().filter(move |(_, info)| info.parent == Some(index))
    }

    /// Read whole blocks of node `index`.
    pub fn read_blocks(&mut self, index: usize, lba: u64, buf: &mut [u8]) -> Result<()> {
        let info = self.info(index).ok_or(Error::NotFound)?;
        let bs = info.block_size as usize;
        if buf.len() % bs != 0 {
            return Err(Error::Invalid);
        }
        let count = (buf.len() / bs) as u64;
        match lba.checked_add(count) {
            Some(end) if end <= info.block_count => {}
            _ => return Err(Error::Io),
        }

        let (root, base) = self.resolve(index);
        for (i, chunk) in buf.chunks_mut(MAX_TRANSFER - MAX_TRANSFER % bs).enumerate() {
            let chunk_lba = base + lba + (i * (MAX_TRANSFER / bs)) as u64;
            self.transport_read(root, chunk_lba, chunk)?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at byte `offset`.
    ///
    /// A read starting past the end fails; one that runs over the end
    /// returns only the in-range byte count.
    pub fn read(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let info = self.info(index).ok_or(Error::NotFound)?;
        let size = info.size();
        let bs = info.block_size as u64;
        if offset >= size {
            return Err(Error::Io);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let buf = &mut buf[..len];

        let mut done = 0usize;
        let mut bounce = vec![0u8; bs as usize];

        // Unaligned head, or a request smaller than a block.
        let head_skip = (offset % bs) as usize;
        if head_skip != 0 || len < bs as usize {
            let lba = offset / bs;
            self.read_blocks(index, lba, &mut bounce)?;
            let take = (bs as usize - head_skip).min(len);
            buf[..take].copy_from_slice(&bounce[head_skip..head_skip + take]);
            done = take;
        }

        // Whole blocks straight into the caller's buffer.
        let whole = (len - done) / bs as usize * bs as usize;
        if whole > 0 {
            let lba = (offset + done as u64) / bs;
            self.read_blocks(index, lba, &mut buf[done..done + whole])?;
            done += whole;
        }

        if done < len {
            let lba = (offset + done as u64) / bs;
            self.read_blocks(index, lba, &mut bounce)?;
            let rest = len - done;
            buf[done..].copy_from_slice(&bounce[..rest]);
        }

        Ok(len)
    }

    /// Read exactly `buf.len()` bytes or fail with EIO.
    pub fn read_exact(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.read(index, offset, buf)? == buf.len() {
            Ok(())
        } else {
            Err(Error::Io)
        }
    }

    /// `read` addressed by string id.
    pub fn read_id(&mut self, id: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let index = self.find(id).ok_or(Error::NotFound)?;
        self.read(index, offset, buf)
    }

    /// Root disk index and block offset of `index` on it.
    fn resolve(&self, index: usize) -> (usize, u64) {
        let mut node = index;
        let mut offset = 0;
        while let Some(parent) = self.nodes[node].info.parent {
            offset += self.nodes[node].info.offset_on_parent;
            node = parent;
        }
        (node, offset)
    }

    fn transport_read(&mut self, root: usize, lba: u64, buf: &mut [u8]) -> Result<()> {
        let node = &mut self.nodes[root];
        let transport = node.transport.as_mut().ok_or(Error::NotSupported)?;

        let mut attempt = 1;
        loop {
            match transport.read_blocks(lba, buf) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < READ_ATTEMPTS => {
                    log::warn!(
                        "disk: {} read at block {} failed ({}), retrying",
                        node.info.id,
                        lba,
                        e.kind_name()
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
