//! Registry node to gpt_disk_io::BlockIo adapter
//!
//! Lets the GPT parser from `gpt_disk_io` read any registered disk through
//! the registry's translation and retry logic.

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};

use super::DeviceRegistry;
use crate::{Error, Result};

/// Read-only `BlockIo` view of one registry node
pub struct RegistryBlockIo<'a> {
    registry: &'a mut DeviceRegistry,
    index: usize,
    block_size: BlockSize,
    num_blocks: u64,
}

impl<'a> RegistryBlockIo<'a> {
    pub fn new(registry: &'a mut DeviceRegistry, index: usize) -> Result<Self> {
        let info = registry.info(index).ok_or(Error::NotFound)?;
        let block_size = BlockSize::new(info.block_size).ok_or(Error::NotSupported)?;
        let num_blocks = info.block_count;
        Ok(Self {
            registry,
            index,
            block_size,
            num_blocks,
        })
    }
}

impl BlockIo for RegistryBlockIo<'_> {
    type Error = Error;

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn num_blocks(&mut self) -> Result<u64> {
        Ok(self.num_blocks)
    }

    fn read_blocks(&mut self, start_lba: Lba, buffer: &mut [u8]) -> Result<()> {
        self.registry.read_blocks(self.index, start_lba.0, buffer)
    }

    fn write_blocks(&mut self, _start_lba: Lba, _buffer: &[u8]) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
