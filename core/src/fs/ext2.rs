//! Read-only ext2 driver
//!
//! Handles the classic block map (12 direct, single, double and triple
//! indirect blocks) as well as ext4 extent trees, so kernels on ext3/ext4
//! volumes without exotic features can be loaded too. Names are matched
//! byte for byte.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{FileNode, FsDriver, MountedFs, Volume};
use crate::{Error, Result};

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;
const EXT2_MAGIC: u16 = 0xEF53;
const EXT4_EXT_MAGIC: u16 = 0xF30A;

const ROOT_INODE: u32 = 2;
const GOOD_OLD_INODE_SIZE: u32 = 128;
const GOOD_OLD_DESC_SIZE: u32 = 32;
const SYMLINK_LIMIT: usize = 8;
const MAX_EXTENT_DEPTH: usize = 5;
/// Longest symbolic link target followed.
const MAX_LINK_LEN: u64 = 4096;

const S_IFMT: u16 = 0xF000;
const S_IFLNK: u16 = 0xA000;
const S_IFREG: u16 = 0x8000;
const S_IFDIR: u16 = 0x4000;

const EXTENTS_FL: u32 = 0x8_0000;

const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_RECOVER: u32 = 0x0004;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const INCOMPAT_64BIT: u32 = 0x0080;
const INCOMPAT_MMP: u32 = 0x0100;
const INCOMPAT_FLEX_BG: u32 = 0x0200;
const INCOMPAT_CSUM_SEED: u32 = 0x2000;
const INCOMPAT_SUPPORTED: u32 = INCOMPAT_FILETYPE
    | INCOMPAT_RECOVER
    | INCOMPAT_EXTENTS
    | INCOMPAT_64BIT
    | INCOMPAT_MMP
    | INCOMPAT_FLEX_BG
    | INCOMPAT_CSUM_SEED;

/// Indirect blocks kept around between lookups.
const INDIRECT_CACHE: usize = 4;

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

pub struct Ext2Driver;

impl FsDriver for Ext2Driver {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn mount(&self, volume: &mut Volume<'_>) -> Result<Option<Box<dyn MountedFs>>> {
        if volume.size() < SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64 {
            return Ok(None);
        }
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        volume.read(SUPERBLOCK_OFFSET, &mut raw)?;
        if le16(&raw, 56) != EXT2_MAGIC {
            return Ok(None);
        }

        let sb = Superblock::parse(&raw)?;
        Ok(Some(Box::new(Ext2Fs {
            sb,
            inode_cache: None,
            indirect_cache: Vec::new(),
        })))
    }
}

struct Superblock {
    block_size: u64,
    first_data_block: u32,
    inodes_count: u32,
    inodes_per_group: u32,
    inode_size: u32,
    desc_size: u32,
    is_64bit: bool,
    label: Option<String>,
}

impl Superblock {
    fn parse(raw: &[u8]) -> Result<Self> {
        let log_block_size = le32(raw, 24);
        if log_block_size > 6 {
            return Err(Error::Invalid);
        }
        let block_size = 1024u64 << log_block_size;
        let rev_level = le32(raw, 76);

        let incompat = if rev_level >= 1 { le32(raw, 96) } else { 0 };
        if incompat & !INCOMPAT_SUPPORTED != 0 {
            log::warn!(
                "ext2: unsupported incompatible features {:#x}",
                incompat & !INCOMPAT_SUPPORTED
            );
            return Err(Error::NotSupported);
        }

        let inode_size = if rev_level >= 1 {
            le16(raw, 88) as u32
        } else {
            GOOD_OLD_INODE_SIZE
        };
        let is_64bit = incompat & INCOMPAT_64BIT != 0;
        let desc_size = if is_64bit {
            (le16(raw, 0xFE) as u32).max(GOOD_OLD_DESC_SIZE)
        } else {
            GOOD_OLD_DESC_SIZE
        };

        let inodes_per_group = le32(raw, 40);
        if inodes_per_group == 0 || inode_size < GOOD_OLD_INODE_SIZE {
            return Err(Error::Invalid);
        }

        let name = &raw[120..136];
        let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        let label = core::str::from_utf8(&name[..end])
            .ok()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_owned());

        Ok(Self {
            block_size,
            first_data_block: le32(raw, 20),
            inodes_count: le32(raw, 0),
            inodes_per_group,
            inode_size,
            desc_size,
            is_64bit,
            label,
        })
    }
}

#[derive(Clone)]
struct Inode {
    mode: u16,
    size: u64,
    sectors: u32,
    flags: u32,
    block: [u8; 60],
}

impl Inode {
    fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    fn ptr(&self, index: usize) -> u32 {
        le32(&self.block, index * 4)
    }
}

struct Ext2Fs {
    sb: Superblock,
    inode_cache: Option<(u32, Inode)>,
    indirect_cache: Vec<(u64, Vec<u8>)>,
}

impl Ext2Fs {
    /// Byte offset of `block`. Block numbers come off the disk, so one
    /// past the end of the address space is a corrupt volume.
    fn block_offset(&self, block: u64) -> Result<u64> {
        block.checked_mul(self.sb.block_size).ok_or(Error::Invalid)
    }

    fn read_block(&self, volume: &mut Volume<'_>, block: u64, buf: &mut [u8]) -> Result<()> {
        volume.read(self.block_offset(block)?, buf)
    }

    fn inode(&mut self, volume: &mut Volume<'_>, num: u32) -> Result<Inode> {
        if let Some((cached, inode)) = &self.inode_cache {
            if *cached == num {
                return Ok(inode.clone());
            }
        }
        if num == 0 || num > self.sb.inodes_count {
            return Err(Error::Invalid);
        }

        let group = (num - 1) / self.sb.inodes_per_group;
        let index = (num - 1) % self.sb.inodes_per_group;

        let gdt = (self.sb.first_data_block as u64 + 1) * self.sb.block_size;
        let mut desc = [0u8; 64];
        let desc_len = self.sb.desc_size.min(64) as usize;
        volume.read(
            gdt + group as u64 * self.sb.desc_size as u64,
            &mut desc[..desc_len],
        )?;
        let mut table = le32(&desc, 8) as u64;
        if self.sb.is_64bit && desc_len >= 0x2C {
            table |= (le32(&desc, 0x28) as u64) << 32;
        }

        let at = self
            .block_offset(table)?
            .checked_add(index as u64 * self.sb.inode_size as u64)
            .ok_or(Error::Invalid)?;
        let mut raw = [0u8; GOOD_OLD_INODE_SIZE as usize];
        volume.read(at, &mut raw)?;

        let mode = le16(&raw, 0);
        let mut size = le32(&raw, 4) as u64;
        if mode & S_IFMT == S_IFREG {
            size |= (le32(&raw, 108) as u64) << 32;
        }
        let mut block = [0u8; 60];
        block.copy_from_slice(&raw[40..100]);

        let inode = Inode {
            mode,
            size,
            sectors: le32(&raw, 28),
            flags: le32(&raw, 32),
            block,
        };
        self.inode_cache = Some((num, inode.clone()));
        Ok(inode)
    }

    /// Physical block backing logical block `lb`, `None` for holes.
    fn map_block(&mut self, volume: &mut Volume<'_>, inode: &Inode, lb: u64) -> Result<Option<u64>> {
        if inode.flags & EXTENTS_FL != 0 {
            return self.map_extent(volume, inode, lb);
        }

        let per = self.sb.block_size / 4;
        let mut lb = lb;
        if lb < 12 {
            let block = inode.ptr(lb as usize);
            return Ok((block != 0).then_some(block as u64));
        }
        lb -= 12;
        if lb < per {
            return self.walk(volume, inode.ptr(12), &[lb]);
        }
        lb -= per;
        if lb < per * per {
            return self.walk(volume, inode.ptr(13), &[lb / per, lb % per]);
        }
        lb -= per * per;
        if lb < per * per * per {
            return self.walk(
                volume,
                inode.ptr(14),
                &[lb / (per * per), (lb / per) % per, lb % per],
            );
        }
        Err(Error::Invalid)
    }

    fn walk(&mut self, volume: &mut Volume<'_>, start: u32, indices: &[u64]) -> Result<Option<u64>> {
        let mut block = start as u64;
        for &index in indices {
            if block == 0 {
                return Ok(None);
            }
            let table = self.indirect(volume, block)?;
            block = le32(table, index as usize * 4) as u64;
        }
        Ok((block != 0).then_some(block))
    }

    fn indirect(&mut self, volume: &mut Volume<'_>, block: u64) -> Result<&[u8]> {
        let pos = match self.indirect_cache.iter().position(|(b, _)| *b == block) {
            Some(pos) => pos,
            None => {
                let mut data = vec![0u8; self.sb.block_size as usize];
                self.read_block(volume, block, &mut data)?;
                if self.indirect_cache.len() == INDIRECT_CACHE {
                    self.indirect_cache.remove(0);
                }
                self.indirect_cache.push((block, data));
                self.indirect_cache.len() - 1
            }
        };
        Ok(&self.indirect_cache[pos].1)
    }

    fn map_extent(&mut self, volume: &mut Volume<'_>, inode: &Inode, lb: u64) -> Result<Option<u64>> {
        let mut node: Vec<u8> = inode.block.to_vec();

        for _ in 0..MAX_EXTENT_DEPTH {
            if le16(&node, 0) != EXT4_EXT_MAGIC {
                return Err(Error::Invalid);
            }
            let entries = le16(&node, 2) as usize;
            let depth = le16(&node, 6);
            if 12 + entries * 12 > node.len() {
                return Err(Error::Invalid);
            }

            if depth == 0 {
                for i in 0..entries {
                    let e = 12 + i * 12;
                    let first = le32(&node, e) as u64;
                    let raw_len = le16(&node, e + 4) as u64;
                    let (len, unwritten) = if raw_len > 32768 {
                        (raw_len - 32768, true)
                    } else {
                        (raw_len, false)
                    };
                    if lb >= first && lb < first + len {
                        let start = ((le16(&node, e + 6) as u64) << 32) | le32(&node, e + 8) as u64;
                        return Ok((!unwritten).then_some(start + (lb - first)));
                    }
                }
                return Ok(None);
            }

            let mut next = None;
            for i in 0..entries {
                let e = 12 + i * 12;
                if (le32(&node, e) as u64) > lb {
                    break;
                }
                next = Some(((le16(&node, e + 8) as u64) << 32) | le32(&node, e + 4) as u64);
            }
            let Some(leaf) = next else {
                return Err(Error::Invalid);
            };
            node = vec![0u8; self.sb.block_size as usize];
            self.read_block(volume, leaf, &mut node)?;
        }
        Err(Error::Invalid)
    }

    fn read_inode_data(
        &mut self,
        volume: &mut Volume<'_>,
        inode: &Inode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= inode.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(inode.size - offset) as usize;
        let bs = self.sb.block_size;

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let within = (pos % bs) as usize;
            let n = (bs as usize - within).min(len - done);
            match self.map_block(volume, inode, pos / bs)? {
                Some(block) => {
                    let at = self.block_offset(block)? + within as u64;
                    volume.read(at, &mut buf[done..done + n])?
                }
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(len)
    }

    fn find_entry(&mut self, volume: &mut Volume<'_>, dir: &Inode, name: &str) -> Result<Option<u32>> {
        let bs = self.sb.block_size as usize;
        let mut block = vec![0u8; bs];
        let blocks = (dir.size + bs as u64 - 1) / bs as u64;

        for lb in 0..blocks {
            let Some(phys) = self.map_block(volume, dir, lb)? else {
                continue;
            };
            self.read_block(volume, phys, &mut block)?;

            let mut off = 0;
            while off + 8 <= bs {
                let inode = le32(&block, off);
                let rec_len = le16(&block, off + 4) as usize;
                let name_len = block[off + 6] as usize;
                if rec_len < 8 || off + rec_len > bs || 8 + name_len > rec_len {
                    log::warn!("ext2: corrupt directory entry in block {}", phys);
                    return Err(Error::Invalid);
                }
                if inode != 0 && &block[off + 8..off + 8 + name_len] == name.as_bytes() {
                    return Ok(Some(inode));
                }
                off += rec_len;
            }
        }
        Ok(None)
    }

    fn read_link(&mut self, volume: &mut Volume<'_>, inode: &Inode) -> Result<String> {
        if inode.size > MAX_LINK_LEN {
            return Err(Error::Invalid);
        }
        let len = inode.size as usize;
        let target = if inode.sectors == 0 && len <= inode.block.len() {
            inode.block[..len].to_vec()
        } else {
            let mut data = vec![0u8; len];
            self.read_inode_data(volume, inode, 0, &mut data)?;
            data
        };
        String::from_utf8(target).map_err(|_| Error::Invalid)
    }

    /// Walk `path` from the root, following symbolic links.
    fn resolve(&mut self, volume: &mut Volume<'_>, path: &str) -> Result<(u32, Inode)> {
        if !path.starts_with('/') {
            return Err(Error::Invalid);
        }

        let mut pending: Vec<String> = path
            .split('/')
            .filter(|p| !p.is_empty())
            .rev()
            .map(|p| p.to_owned())
            .collect();
        let mut trail: Vec<u32> = vec![ROOT_INODE];
        let mut links = 0;

        while let Some(name) = pending.pop() {
            match name.as_str() {
                "." => continue,
                ".." => {
                    if trail.len() > 1 {
                        trail.pop();
                    }
                    continue;
                }
                _ => {}
            }

            let dir_num = *trail.last().ok_or(Error::Invalid)?;
            let dir = self.inode(volume, dir_num)?;
            if dir.file_type() != S_IFDIR {
                return Err(Error::NotFound);
            }
            let num = self.find_entry(volume, &dir, &name)?.ok_or(Error::NotFound)?;
            let inode = self.inode(volume, num)?;

            if inode.file_type() == S_IFLNK {
                links += 1;
                if links > SYMLINK_LIMIT {
                    log::warn!("ext2: too many symbolic links resolving {}", path);
                    return Err(Error::Invalid);
                }
                let target = self.read_link(volume, &inode)?;
                if target.starts_with('/') {
                    trail.truncate(1);
                }
                pending.extend(
                    target
                        .split('/')
                        .filter(|p| !p.is_empty())
                        .rev()
                        .map(|p| p.to_owned()),
                );
                continue;
            }
            trail.push(num);
        }

        let num = *trail.last().ok_or(Error::Invalid)?;
        let inode = self.inode(volume, num)?;
        Ok((num, inode))
    }
}

impl MountedFs for Ext2Fs {
    fn driver(&self) -> &'static str {
        "ext2"
    }

    fn case_sensitive(&self) -> bool {
        true
    }

    fn label(&self) -> Option<&str> {
        self.sb.label.as_deref()
    }

    fn open(&mut self, volume: &mut Volume<'_>, path: &str) -> Result<FileNode> {
        let (num, inode) = self.resolve(volume, path)?;
        if inode.file_type() != S_IFREG {
            return Err(Error::Invalid);
        }
        Ok(FileNode {
            id: num as u64,
            size: inode.size,
        })
    }

    fn read(
        &mut self,
        volume: &mut Volume<'_>,
        node: &FileNode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let num = u32::try_from(node.id).map_err(|_| Error::Invalid)?;
        let inode = self.inode(volume, num)?;
        self.read_inode_data(volume, &inode, offset, buf)
    }
}
