//! Read-only FAT12/16/32 driver
//!
//! The variant is decided by cluster count, the way the on-disk format
//! defines it. Short 8.3 names and VFAT long names are both matched,
//! case-insensitively, and `\` is accepted as a path separator.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{names_match, path_components, FileNode, FsDriver, MountedFs, Volume};
use crate::{Error, Result};

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const ENTRY_DELETED: u8 = 0xE5;
const LFN_LAST: u8 = 0x40;
const LFN_CHARS: usize = 13;
/// A directory holds at most 65536 entries.
const MAX_DIR_BYTES: usize = 65536 * DIR_ENTRY_SIZE;

/// Character offsets of the 13 UTF-16 units inside a long-name entry.
const LFN_OFFSETS: [usize; LFN_CHARS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    fn end_of_chain(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }
}

/// Geometry from the BIOS parameter block
#[derive(Debug, Clone)]
pub struct FatContext {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub fat_size: u32,
    pub root_entries: u32,
    pub root_cluster: u32,
    pub root_dir_sector: u32,
    pub data_start_sector: u32,
    pub cluster_count: u32,
    pub label: Option<String>,
}

impl FatContext {
    /// Parse sector 0. `None` when it is not a FAT boot sector.
    pub fn from_boot_sector(bs: &[u8]) -> Option<Self> {
        if bs.len() < 512 || !matches!(bs[0], 0xEB | 0xE9) {
            return None;
        }

        let bytes_per_sector = le16(bs, 0x0B) as u32;
        let sectors_per_cluster = bs[0x0D] as u32;
        let reserved_sectors = le16(bs, 0x0E) as u32;
        let num_fats = bs[0x10] as u32;
        let root_entries = le16(bs, 0x11) as u32;
        let total_16 = le16(bs, 0x13) as u32;
        let fat_size_16 = le16(bs, 0x16) as u32;
        let total_32 = le32(bs, 0x20);

        if !bytes_per_sector.is_power_of_two()
            || !(512..=4096).contains(&bytes_per_sector)
            || !sectors_per_cluster.is_power_of_two()
            || reserved_sectors == 0
            || num_fats == 0
        {
            return None;
        }

        let fat_size = if fat_size_16 != 0 {
            fat_size_16
        } else {
            le32(bs, 0x24)
        };
        let total = if total_16 != 0 { total_16 } else { total_32 };
        let root_dir_sectors =
            (root_entries * DIR_ENTRY_SIZE as u32 + bytes_per_sector - 1) / bytes_per_sector;
        // Untrusted fields: a geometry that does not fit is not FAT.
        let root_dir_sector = num_fats
            .checked_mul(fat_size)?
            .checked_add(reserved_sectors)?;
        let data_start_sector = root_dir_sector.checked_add(root_dir_sectors)?;
        if fat_size == 0 || total <= data_start_sector {
            return None;
        }
        let cluster_count = (total - data_start_sector) / sectors_per_cluster;

        let fat_type = if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };
        if fat_type != FatType::Fat32 && root_entries == 0 {
            return None;
        }

        let (root_cluster, label_at) = match fat_type {
            FatType::Fat32 => (le32(bs, 0x2C), 0x47),
            _ => (0, 0x2B),
        };
        let label = core::str::from_utf8(&bs[label_at..label_at + 11])
            .ok()
            .map(|l| l.trim_end())
            .filter(|l| !l.is_empty() && *l != "NO NAME")
            .map(String::from);

        Some(Self {
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            fat_size,
            root_entries,
            root_cluster,
            root_dir_sector,
            data_start_sector,
            cluster_count,
            label,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        (self.sectors_per_cluster * self.bytes_per_sector) as u64
    }

    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        let sector = self.data_start_sector as u64 + (cluster as u64 - 2) * self.sectors_per_cluster as u64;
        sector * self.bytes_per_sector as u64
    }

    fn valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster - 2 < self.cluster_count
    }
}

pub struct FatDriver;

impl FsDriver for FatDriver {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn mount(&self, volume: &mut Volume<'_>) -> Result<Option<Box<dyn MountedFs>>> {
        if volume.size() < 512 {
            return Ok(None);
        }
        let mut sector = [0u8; 512];
        volume.read(0, &mut sector)?;
        let Some(ctx) = FatContext::from_boot_sector(&sector) else {
            return Ok(None);
        };
        log::debug!(
            "fat: {:?}, {} clusters of {} bytes",
            ctx.fat_type,
            ctx.cluster_count,
            ctx.cluster_size()
        );
        Ok(Some(Box::new(FatFs {
            ctx,
            fat_cache: None,
            chain_cache: None,
        })))
    }
}

#[derive(Debug, Clone, Copy)]
enum Dir {
    /// Fixed root directory region of FAT12/16
    Root,
    Cluster(u32),
}

#[derive(Debug, Clone)]
struct DirEntry {
    name: String,
    short_name: String,
    attr: u8,
    cluster: u32,
    size: u32,
}

struct FatFs {
    ctx: FatContext,
    /// One cached FAT sector: (byte offset, contents)
    fat_cache: Option<(u64, Vec<u8>)>,
    /// Last chain position read: (first cluster, index, cluster)
    chain_cache: Option<(u32, u64, u32)>,
}

impl FatFs {
    fn fat_byte(&mut self, volume: &mut Volume<'_>, offset: u64) -> Result<u8> {
        let bps = self.ctx.bytes_per_sector as u64;
        let sector = offset / bps * bps;
        let hit = matches!(&self.fat_cache, Some((at, _)) if *at == sector);
        if !hit {
            let mut data = vec![0u8; bps as usize];
            volume.read(sector, &mut data)?;
            self.fat_cache = Some((sector, data));
        }
        match &self.fat_cache {
            Some((_, data)) => Ok(data[(offset - sector) as usize]),
            None => Err(Error::Io),
        }
    }

    fn read_fat_entry(&mut self, volume: &mut Volume<'_>, cluster: u32) -> Result<u32> {
        let fat_start = self.ctx.reserved_sectors as u64 * self.ctx.bytes_per_sector as u64;
        let (offset, width) = match self.ctx.fat_type {
            FatType::Fat12 => (cluster as u64 + cluster as u64 / 2, 2),
            FatType::Fat16 => (cluster as u64 * 2, 2),
            FatType::Fat32 => (cluster as u64 * 4, 4),
        };

        let mut raw = [0u8; 4];
        for (i, byte) in raw.iter_mut().take(width).enumerate() {
            *byte = self.fat_byte(volume, fat_start + offset + i as u64)?;
        }
        let value = u32::from_le_bytes(raw);

        Ok(match self.ctx.fat_type {
            FatType::Fat12 if cluster & 1 == 1 => value >> 4,
            FatType::Fat12 => value & 0xFFF,
            FatType::Fat16 => value & 0xFFFF,
            FatType::Fat32 => value & 0x0FFF_FFFF,
        })
    }

    /// Next cluster of a chain, `None` at the end.
    fn next_cluster(&mut self, volume: &mut Volume<'_>, cluster: u32) -> Result<Option<u32>> {
        let next = self.read_fat_entry(volume, cluster)?;
        if next >= self.ctx.fat_type.end_of_chain() {
            return Ok(None);
        }
        if !self.ctx.valid_cluster(next) {
            log::warn!("fat: broken chain at cluster {} -> {:#x}", cluster, next);
            return Err(Error::Invalid);
        }
        Ok(Some(next))
    }

    /// Cluster number holding chain position `index` of the chain at `first`.
    fn cluster_at(&mut self, volume: &mut Volume<'_>, first: u32, index: u64) -> Result<u32> {
        let (mut pos, mut cluster) = match self.chain_cache {
            Some((f, i, c)) if f == first && i <= index => (i, c),
            _ => (0, first),
        };
        while pos < index {
            cluster = self.next_cluster(volume, cluster)?.ok_or(Error::Io)?;
            pos += 1;
        }
        self.chain_cache = Some((first, index, cluster));
        Ok(cluster)
    }

    fn read_dir(&mut self, volume: &mut Volume<'_>, dir: Dir) -> Result<Vec<u8>> {
        match dir {
            Dir::Root => {
                let len = self.ctx.root_entries as usize * DIR_ENTRY_SIZE;
                let mut data = vec![0u8; len];
                volume.read(
                    self.ctx.root_dir_sector as u64 * self.ctx.bytes_per_sector as u64,
                    &mut data,
                )?;
                Ok(data)
            }
            Dir::Cluster(first) => {
                let cs = self.ctx.cluster_size() as usize;
                let mut data = Vec::new();
                let mut cluster = Some(first);
                let mut hops = 0;
                while let Some(c) = cluster {
                    if !self.ctx.valid_cluster(c)
                        || hops > self.ctx.cluster_count
                        || data.len() >= MAX_DIR_BYTES
                    {
                        return Err(Error::Invalid);
                    }
                    let at = data.len();
                    data.resize(at + cs, 0);
                    volume.read(self.ctx.cluster_offset(c), &mut data[at..])?;
                    cluster = self.next_cluster(volume, c)?;
                    hops += 1;
                }
                Ok(data)
            }
        }
    }

    fn lookup(&mut self, volume: &mut Volume<'_>, dir: Dir, wanted: &str) -> Result<Option<DirEntry>> {
        let data = self.read_dir(volume, dir)?;
        Ok(parse_entries(&data)
            .into_iter()
            .find(|e| names_match(wanted, &e.name, false) || names_match(wanted, &e.short_name, false)))
    }
}

/// Decode the live entries of a directory image.
fn parse_entries(data: &[u8]) -> Vec<DirEntry> {
    let mut out = Vec::new();
    let mut lfn: Vec<u16> = Vec::new();
    let mut lfn_sum: Option<u8> = None;

    for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
        match raw[0] {
            0x00 => break,
            ENTRY_DELETED => {
                lfn.clear();
                lfn_sum = None;
                continue;
            }
            _ => {}
        }

        let attr = raw[11];
        if attr & 0x3F == ATTR_LONG_NAME {
            let seq = raw[0];
            let order = (seq & 0x1F) as usize;
            if seq & LFN_LAST != 0 {
                lfn = vec![0xFFFF; order * LFN_CHARS];
                lfn_sum = Some(raw[13]);
            }
            if order == 0 || order * LFN_CHARS > lfn.len() || lfn_sum != Some(raw[13]) {
                lfn.clear();
                lfn_sum = None;
                continue;
            }
            for (i, &at) in LFN_OFFSETS.iter().enumerate() {
                lfn[(order - 1) * LFN_CHARS + i] = le16(raw, at);
            }
            continue;
        }

        let short = &raw[..11];
        let long_name = match lfn_sum {
            Some(sum) if sum == short_name_checksum(short) => decode_lfn(&lfn),
            _ => None,
        };
        lfn.clear();
        lfn_sum = None;

        if attr & ATTR_VOLUME_ID != 0 {
            continue;
        }

        let short_name = decode_short_name(short, raw[12]);
        out.push(DirEntry {
            name: long_name.unwrap_or_else(|| short_name.clone()),
            short_name,
            attr,
            cluster: ((le16(raw, 20) as u32) << 16) | le16(raw, 26) as u32,
            size: le32(raw, 28),
        });
    }
    out
}

fn short_name_checksum(name: &[u8]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &c| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c))
}

fn decode_lfn(units: &[u16]) -> Option<String> {
    let end = units
        .iter()
        .position(|&u| u == 0x0000 || u == 0xFFFF)
        .unwrap_or(units.len());
    char::decode_utf16(units[..end].iter().copied())
        .collect::<core::result::Result<String, _>>()
        .ok()
}

/// `NAME    EXT` to `NAME.EXT`, honouring the NT lower-case flags.
fn decode_short_name(raw: &[u8], nt_flags: u8) -> String {
    let mut base: Vec<u8> = raw[..8].to_vec();
    if base[0] == 0x05 {
        base[0] = ENTRY_DELETED;
    }
    let mut name = String::new();
    for &c in base.iter().take_while(|&&c| c != b' ') {
        let c = if nt_flags & 0x08 != 0 { c.to_ascii_lowercase() } else { c };
        name.push(c as char);
    }
    let ext: Vec<u8> = raw[8..11].iter().copied().take_while(|&c| c != b' ').collect();
    if !ext.is_empty() {
        name.push('.');
        for c in ext {
            let c = if nt_flags & 0x10 != 0 { c.to_ascii_lowercase() } else { c };
            name.push(c as char);
        }
    }
    name
}

impl MountedFs for FatFs {
    fn driver(&self) -> &'static str {
        match self.ctx.fat_type {
            FatType::Fat12 => "fat12",
            FatType::Fat16 => "fat16",
            FatType::Fat32 => "fat32",
        }
    }

    fn case_sensitive(&self) -> bool {
        false
    }

    fn label(&self) -> Option<&str> {
        self.ctx.label.as_deref()
    }

    fn open(&mut self, volume: &mut Volume<'_>, path: &str) -> Result<FileNode> {
        let path = path.replace('\\', "/");
        let parts = path_components(&path)?;
        let (last, dirs) = parts.split_last().ok_or(Error::Invalid)?;

        let mut dir = match self.ctx.fat_type {
            FatType::Fat32 => Dir::Cluster(self.ctx.root_cluster),
            _ => Dir::Root,
        };
        for name in dirs {
            let entry = self.lookup(volume, dir, name)?.ok_or(Error::NotFound)?;
            if entry.attr & ATTR_DIRECTORY == 0 {
                return Err(Error::NotFound);
            }
            dir = match (entry.cluster, self.ctx.fat_type) {
                (0, FatType::Fat32) => Dir::Cluster(self.ctx.root_cluster),
                (0, _) => Dir::Root,
                (c, _) => Dir::Cluster(c),
            };
        }

        let entry = self.lookup(volume, dir, last)?.ok_or(Error::NotFound)?;
        if entry.attr & ATTR_DIRECTORY != 0 {
            return Err(Error::Invalid);
        }
        Ok(FileNode {
            id: entry.cluster as u64,
            size: entry.size as u64,
        })
    }

    fn read(
        &mut self,
        volume: &mut Volume<'_>,
        node: &FileNode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= node.size {
            return Ok(0);
        }
        let first = u32::try_from(node.id).map_err(|_| Error::Invalid)?;
        if !self.ctx.valid_cluster(first) {
            return Err(Error::Invalid);
        }

        let cs = self.ctx.cluster_size();
        let len = (buf.len() as u64).min(node.size - offset) as usize;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let cluster = self.cluster_at(volume, first, pos / cs)?;
            let within = pos % cs;
            let n = ((cs - within) as usize).min(len - done);
            volume.read(
                self.ctx.cluster_offset(cluster) + within,
                &mut buf[done..done + n],
            )?;
            done += n;
        }
        Ok(len)
    }
}
