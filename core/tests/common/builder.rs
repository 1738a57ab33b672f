//! Image builders: partitioned disks, ext2, FAT and ISO9660 volumes, gzip
//! streams.

use std::collections::BTreeMap;

use gpt_disk_io::{BlockIoAdapter, Disk};
use gpt_disk_types::{
    guid, BlockSize, GptHeader, GptPartitionEntryArray, GptPartitionType, LbaLe, U32Le,
};

pub const SECTOR: usize = 512;

/// Linux filesystem data
pub const LINUX_DATA: GptPartitionType = GptPartitionType(guid!("0fc63daf-8483-4772-8e79-3d69d8477de4"));

// ═══════════════════════════════════════════════════════════════════════════
// PARTITIONED DISKS
// ═══════════════════════════════════════════════════════════════════════════

struct Slot {
    kind: u8,
    bootable: bool,
    first: u64,
    sectors: u64,
    image: Vec<u8>,
}

/// Lays partitions out back to back from LBA 2048.
pub struct DiskBuilder {
    primaries: Vec<Slot>,
    logicals: Vec<Slot>,
    gpt: Vec<(GptPartitionType, u64, u64, Vec<u8>)>,
    loop_back: bool,
    next: u64,
}

impl DiskBuilder {
    pub fn new() -> Self {
        Self {
            primaries: Vec::new(),
            logicals: Vec::new(),
            gpt: Vec::new(),
            loop_back: false,
            next: 2048,
        }
    }

    fn place(&mut self, sectors: u64, image: &[u8]) -> u64 {
        assert!(image.len() as u64 <= sectors * SECTOR as u64, "image larger than partition");
        let first = self.next;
        self.next = first + sectors;
        first
    }

    /// MBR primary of `sectors` sectors holding `image`.
    pub fn primary(mut self, kind: u8, bootable: bool, sectors: u64, image: Vec<u8>) -> Self {
        let first = self.place(sectors, &image);
        self.primaries.push(Slot {
            kind,
            bootable,
            first,
            sectors,
            image,
        });
        self
    }

    /// Logical partition in the extended container. Each logical gets a
    /// 1 MiB slot in front for its EBR.
    pub fn logical(mut self, kind: u8, sectors: u64, image: Vec<u8>) -> Self {
        let ebr = self.place(2048 + sectors, &image);
        self.logicals.push(Slot {
            kind,
            bootable: false,
            first: ebr,
            sectors,
            image,
        });
        self
    }

    /// Point the last EBR back at the first one.
    pub fn with_chain_loop(mut self) -> Self {
        self.loop_back = true;
        self
    }

    pub fn gpt_partition(mut self, kind: GptPartitionType, first: u64, last: u64, image: Vec<u8>) -> Self {
        assert!(image.len() as u64 <= (last - first + 1) * SECTOR as u64);
        self.next = self.next.max(last + 1);
        self.gpt.push((kind, first, last, image));
        self
    }

    fn total_sectors(&self) -> u64 {
        // Room for the backup GPT at the end.
        self.next + 64
    }

    pub fn build_mbr(self) -> Vec<u8> {
        let total = self.total_sectors();
        let mut disk = vec![0u8; total as usize * SECTOR];

        let mut entries: Vec<(u8, bool, u64, u64)> = self
            .primaries
            .iter()
            .map(|p| (p.kind, p.bootable, p.first, p.sectors))
            .collect();

        if let (Some(first), Some(last)) = (self.logicals.first(), self.logicals.last()) {
            let ext_start = first.first;
            let ext_end = last.first + 2048 + last.sectors;
            entries.insert(0, (0x05, false, ext_start, ext_end - ext_start));

            for (i, logical) in self.logicals.iter().enumerate() {
                let ebr = logical.first;
                let mut table = vec![(logical.kind, false, 2048, logical.sectors)];
                match self.logicals.get(i + 1) {
                    Some(next) => table.push((0x05, false, next.first - ext_start, next.sectors + 2048)),
                    None if self.loop_back => table.push((0x05, false, 0, 2048)),
                    None => {}
                }
                write_table(&mut disk[ebr as usize * SECTOR..], &table);
                copy_at(&mut disk, ebr + 2048, &logical.image);
            }
        }

        write_table(&mut disk, &entries);
        for p in &self.primaries {
            copy_at(&mut disk, p.first, &p.image);
        }
        disk
    }

    pub fn build_gpt(self) -> Vec<u8> {
        let total = self.total_sectors();
        let mut data = vec![0u8; total as usize * SECTOR];

        {
            let io = BlockIoAdapter::new(data.as_mut_slice(), BlockSize::BS_512);
            let mut disk = Disk::new(io).unwrap();

            let mut header = GptHeader {
                my_lba: LbaLe::from_u64(1),
                alternate_lba: LbaLe::from_u64(total - 1),
                first_usable_lba: LbaLe::from_u64(34),
                last_usable_lba: LbaLe::from_u64(total - 34),
                disk_guid: guid!("57a7e374-8c8b-4fd1-9c3c-2b7c3f1a9e01"),
                partition_entry_lba: LbaLe::from_u64(2),
                number_of_partition_entries: U32Le::from_u32(128),
                ..Default::default()
            };

            let layout = header.get_partition_entry_array_layout().unwrap();
            let mut entry_buf = vec![0u8; 128 * 128];
            let mut entries = GptPartitionEntryArray::new(layout, BlockSize::BS_512, &mut entry_buf).unwrap();
            for (i, (kind, first, last, _)) in self.gpt.iter().enumerate() {
                let entry = entries.get_partition_entry_mut(i as u32).unwrap();
                entry.partition_type_guid = *kind;
                entry.unique_partition_guid = guid!("6c1bd1a3-0b4e-4c4f-a0f6-5bd08c9c1d00");
                entry.starting_lba = LbaLe::from_u64(*first);
                entry.ending_lba = LbaLe::from_u64(*last);
            }

            header.partition_entry_array_crc32 = entries.calculate_crc32();
            header.update_header_crc32();

            let mut buf = [0u8; SECTOR];
            disk.write_protective_mbr(&mut buf).unwrap();
            disk.write_primary_gpt_header(&header, &mut buf).unwrap();
            disk.write_gpt_partition_entry_array(&entries).unwrap();
            disk.flush().unwrap();
        }

        for (_, first, _, image) in &self.gpt {
            copy_at(&mut data, *first, image);
        }
        data
    }
}

fn copy_at(disk: &mut [u8], lba: u64, image: &[u8]) {
    let at = lba as usize * SECTOR;
    disk[at..at + image.len()].copy_from_slice(image);
}

/// Write up to four `(type, active, start, count)` entries plus the boot
/// signature into the sector at the start of `sector`.
pub fn write_table(sector: &mut [u8], entries: &[(u8, bool, u64, u64)]) {
    for (i, &(kind, active, start, count)) in entries.iter().enumerate() {
        let at = 446 + i * 16;
        sector[at] = if active { 0x80 } else { 0 };
        sector[at + 4] = kind;
        sector[at + 8..at + 12].copy_from_slice(&(start as u32).to_le_bytes());
        sector[at + 12..at + 16].copy_from_slice(&(count as u32).to_le_bytes());
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

// ═══════════════════════════════════════════════════════════════════════════
// EXT2
// ═══════════════════════════════════════════════════════════════════════════

enum Node {
    Dir(BTreeMap<String, usize>),
    File(Vec<u8>),
    Link(String),
}

/// Revision 1 ext2 with 1 KiB blocks, one block group and 128-byte inodes.
pub struct Ext2Builder {
    label: String,
    nodes: Vec<Node>,
}

const EXT2_BLOCK: usize = 1024;
const INODES: u32 = 64;
const INODE_SIZE: usize = 128;
const INODE_TABLE: usize = 5;
const FIRST_DATA: usize = INODE_TABLE + INODES as usize * INODE_SIZE / EXT2_BLOCK;

impl Ext2Builder {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            nodes: vec![Node::Dir(BTreeMap::new())],
        }
    }

    /// Node index of directory `path`, creating missing components.
    fn dir(&mut self, path: &str) -> usize {
        let mut current = 0;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let existing = match &self.nodes[current] {
                Node::Dir(children) => children.get(part).copied(),
                _ => panic!("{} is not a directory", part),
            };
            current = match existing {
                Some(index) => index,
                None => self.insert(current, part, Node::Dir(BTreeMap::new())),
            };
        }
        current
    }

    fn insert(&mut self, parent: usize, name: &str, node: Node) -> usize {
        self.nodes.push(node);
        let index = self.nodes.len() - 1;
        match &mut self.nodes[parent] {
            Node::Dir(children) => children.insert(name.to_string(), index),
            _ => panic!("parent is not a directory"),
        };
        index
    }

    fn split(path: &str) -> (&str, &str) {
        let at = path.rfind('/').expect("absolute path");
        (&path[..at], &path[at + 1..])
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        let (dir, name) = Self::split(path);
        let parent = self.dir(dir);
        self.insert(parent, name, Node::File(data.to_vec()));
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let (dir, name) = Self::split(path);
        let parent = self.dir(dir);
        self.insert(parent, name, Node::Link(target.to_string()));
        self
    }

    fn inode_number(index: usize) -> u32 {
        if index == 0 {
            2
        } else {
            10 + index as u32
        }
    }

    pub fn build(self) -> Vec<u8> {
        assert!(self.nodes.len() + 11 <= INODES as usize);
        let mut image = vec![0u8; FIRST_DATA * EXT2_BLOCK];
        let mut parents = vec![0usize; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            if let Node::Dir(children) = node {
                for &child in children.values() {
                    parents[child] = index;
                }
            }
        }

        for (index, node) in self.nodes.iter().enumerate() {
            let (mode, data, fast_link) = match node {
                Node::Dir(children) => {
                    let mut entries = vec![
                        (".".to_string(), Self::inode_number(index), 2u8),
                        ("..".to_string(), Self::inode_number(parents[index]), 2u8),
                    ];
                    for (name, &child) in children {
                        let file_type = match self.nodes[child] {
                            Node::Dir(_) => 2,
                            Node::File(_) => 1,
                            Node::Link(_) => 7,
                        };
                        entries.push((name.clone(), Self::inode_number(child), file_type));
                    }
                    (0x41ED, dir_blocks(&entries), false)
                }
                Node::File(data) => (0x81A4, data.clone(), false),
                Node::Link(target) => (0xA1FF, target.as_bytes().to_vec(), target.len() < 60),
            };

            let mut inode = [0u8; INODE_SIZE];
            inode[0..2].copy_from_slice(&(mode as u16).to_le_bytes());
            inode[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
            inode[26..28].copy_from_slice(&1u16.to_le_bytes());

            if fast_link {
                inode[40..40 + data.len()].copy_from_slice(&data);
            } else {
                let blocks = write_blocks(&mut image, &data);
                for (i, &block) in blocks.iter().take(12).enumerate() {
                    inode[40 + i * 4..44 + i * 4].copy_from_slice(&block.to_le_bytes());
                }
                if blocks.len() > 12 {
                    let pointers: Vec<u8> = blocks[12..].iter().flat_map(|b| b.to_le_bytes()).collect();
                    assert!(pointers.len() <= EXT2_BLOCK, "file too large for the builder");
                    let indirect = write_blocks(&mut image, &pointers)[0];
                    inode[88..92].copy_from_slice(&indirect.to_le_bytes());
                }
                let sectors = ((blocks.len() + usize::from(blocks.len() > 12)) * 2) as u32;
                inode[28..32].copy_from_slice(&sectors.to_le_bytes());
            }

            let number = Self::inode_number(index) as usize;
            let at = INODE_TABLE * EXT2_BLOCK + (number - 1) * INODE_SIZE;
            image[at..at + INODE_SIZE].copy_from_slice(&inode);
        }

        let blocks = image.len() / EXT2_BLOCK;
        let sb = EXT2_BLOCK;
        let put32 = |img: &mut Vec<u8>, at: usize, v: u32| img[sb + at..sb + at + 4].copy_from_slice(&v.to_le_bytes());
        put32(&mut image, 0, INODES);
        put32(&mut image, 4, blocks as u32);
        put32(&mut image, 20, 1);
        put32(&mut image, 24, 0);
        put32(&mut image, 32, 8192);
        put32(&mut image, 40, INODES);
        put32(&mut image, 76, 1);
        put32(&mut image, 96, 0x0002);
        image[sb + 56..sb + 58].copy_from_slice(&0xEF53u16.to_le_bytes());
        image[sb + 88..sb + 90].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
        let label = self.label.as_bytes();
        image[sb + 120..sb + 120 + label.len()].copy_from_slice(label);

        // Group descriptor: bitmaps at 3 and 4, inode table after.
        let gd = 2 * EXT2_BLOCK;
        image[gd..gd + 4].copy_from_slice(&3u32.to_le_bytes());
        image[gd + 4..gd + 8].copy_from_slice(&4u32.to_le_bytes());
        image[gd + 8..gd + 12].copy_from_slice(&(INODE_TABLE as u32).to_le_bytes());

        image
    }
}

/// Append `data` in fresh blocks, returning their numbers.
fn write_blocks(image: &mut Vec<u8>, data: &[u8]) -> Vec<u32> {
    let count = data.len().div_ceil(EXT2_BLOCK).max(1);
    let first = image.len() / EXT2_BLOCK;
    image.resize(image.len() + count * EXT2_BLOCK, 0);
    image[first * EXT2_BLOCK..first * EXT2_BLOCK + data.len()].copy_from_slice(data);
    (first..first + count).map(|b| b as u32).collect()
}

fn dir_blocks(entries: &[(String, u32, u8)]) -> Vec<u8> {
    let mut out = vec![0u8; EXT2_BLOCK];
    let mut off = 0;
    for (i, (name, inode, file_type)) in entries.iter().enumerate() {
        let len = (8 + name.len()).next_multiple_of(4);
        let rec_len = if i + 1 == entries.len() { EXT2_BLOCK - off } else { len };
        assert!(off + rec_len <= EXT2_BLOCK, "directory larger than one block");
        out[off..off + 4].copy_from_slice(&inode.to_le_bytes());
        out[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
        out[off + 6] = name.len() as u8;
        out[off + 7] = *file_type;
        out[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
        off += rec_len;
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// FAT
// ═══════════════════════════════════════════════════════════════════════════

/// FAT12 (small) or FAT16 volume with 512-byte sectors and clusters.
pub struct FatBuilder {
    clusters: usize,
    files: Vec<(String, Vec<u8>)>,
}

impl FatBuilder {
    pub fn fat12() -> Self {
        Self {
            clusters: 2000,
            files: Vec::new(),
        }
    }

    pub fn fat16() -> Self {
        Self {
            clusters: 5000,
            files: Vec::new(),
        }
    }

    /// `path` like `/KERNEL.GZ` or `/boot/Long Name.elf`; one directory
    /// level at most.
    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.push((path.to_string(), data.to_vec()));
        self
    }

    pub fn sectors(&self) -> u64 {
        let (_, data_start) = self.layout();
        (data_start + self.clusters) as u64
    }

    fn is_fat12(&self) -> bool {
        self.clusters < 4085
    }

    /// (FAT size in sectors, first data sector)
    fn layout(&self) -> (usize, usize) {
        let fat_bytes = if self.is_fat12() {
            (self.clusters + 2) * 3 / 2 + 1
        } else {
            (self.clusters + 2) * 2
        };
        let fat_size = fat_bytes.div_ceil(SECTOR);
        (fat_size, 1 + 2 * fat_size + 32)
    }

    pub fn build(self) -> Vec<u8> {
        let (fat_size, data_start) = self.layout();
        let total = data_start + self.clusters;
        let mut image = vec![0u8; total * SECTOR];
        let mut fat = vec![0u32; self.clusters + 2];
        fat[0] = 0xFF8;
        fat[1] = 0xFFF;
        let eoc = if self.is_fat12() { 0xFFF } else { 0xFFFF };
        let mut next_cluster = 2usize;

        let mut alloc = |image: &mut Vec<u8>, fat: &mut Vec<u32>, data: &[u8]| -> u32 {
            if data.is_empty() {
                return 0;
            }
            let count = data.len().div_ceil(SECTOR);
            let first = next_cluster;
            for c in first..first + count {
                fat[c] = if c + 1 == first + count { eoc } else { c as u32 + 1 };
            }
            let at = (data_start + first - 2) * SECTOR;
            image[at..at + data.len()].copy_from_slice(data);
            next_cluster += count;
            first as u32
        };

        // Group files per directory.
        let mut dirs: BTreeMap<String, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for (path, data) in &self.files {
            let path = path.trim_start_matches('/');
            let (dir, name) = match path.rfind('/') {
                Some(at) => (&path[..at], &path[at + 1..]),
                None => ("", path),
            };
            dirs.entry(dir.to_string())
                .or_default()
                .push((name.to_string(), data.clone()));
        }

        let mut root_entries = Vec::new();
        let mut alias = 1;
        for (dir, files) in &dirs {
            let mut entries = Vec::new();
            for (name, data) in files {
                let first = alloc(&mut image, &mut fat, data);
                entries.extend(dir_entry(name, 0x20, first, data.len() as u32, &mut alias));
            }
            if dir.is_empty() {
                root_entries.extend(entries);
            } else {
                let first = alloc(&mut image, &mut fat, &entries_padded(&entries));
                root_entries.extend(dir_entry(dir, 0x10, first, 0, &mut alias));
            }
        }
        let root_at = (1 + 2 * fat_size) * SECTOR;
        let root: Vec<u8> = root_entries.concat();
        assert!(root.len() <= 32 * SECTOR);
        image[root_at..root_at + root.len()].copy_from_slice(&root);

        // FATs
        let mut table = vec![0u8; fat_size * SECTOR];
        for (n, &value) in fat.iter().enumerate() {
            if self.is_fat12() {
                let at = n * 3 / 2;
                let word = u16::from_le_bytes([table[at], table[at + 1]]);
                let word = if n % 2 == 0 {
                    (word & 0xF000) | value as u16
                } else {
                    (word & 0x000F) | ((value as u16) << 4)
                };
                table[at..at + 2].copy_from_slice(&word.to_le_bytes());
            } else {
                table[n * 2..n * 2 + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
        }
        for copy in 0..2 {
            let at = (1 + copy * fat_size) * SECTOR;
            image[at..at + table.len()].copy_from_slice(&table);
        }

        // Boot sector
        let bs = &mut image[..SECTOR];
        bs[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        bs[3..11].copy_from_slice(b"MSWIN4.1");
        bs[0x0B..0x0D].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        bs[0x0D] = 1;
        bs[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes());
        bs[0x10] = 2;
        bs[0x11..0x13].copy_from_slice(&512u16.to_le_bytes());
        if total < 0x10000 {
            bs[0x13..0x15].copy_from_slice(&(total as u16).to_le_bytes());
        } else {
            bs[0x20..0x24].copy_from_slice(&(total as u32).to_le_bytes());
        }
        bs[0x15] = 0xF8;
        bs[0x16..0x18].copy_from_slice(&(fat_size as u16).to_le_bytes());
        bs[0x2B..0x36].copy_from_slice(b"LAOSBOOT   ");
        bs[510] = 0x55;
        bs[511] = 0xAA;

        image
    }
}

fn entries_padded(entries: &[[u8; 32]]) -> Vec<u8> {
    let mut out = entries.concat();
    out.resize(out.len().div_ceil(SECTOR).max(1) * SECTOR, 0);
    out
}

fn short_name_of(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = match name.rfind('.') {
        Some(at) => (&name[..at], &name[at + 1..]),
        None => (name, ""),
    };
    let valid = |s: &str, max: usize| {
        !s.is_empty() && s.len() <= max && s.bytes().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_')
    };
    if !valid(base, 8) || !(ext.is_empty() || valid(ext, 3)) {
        return None;
    }
    let mut out = [b' '; 11];
    out[..base.len()].copy_from_slice(base.as_bytes());
    out[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    Some(out)
}

fn checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &c| (sum >> 1 | (sum & 1) << 7).wrapping_add(c))
}

/// Directory entries for `name`: long-name entries (if needed) followed by
/// the short entry.
fn dir_entry(name: &str, attr: u8, cluster: u32, size: u32, alias: &mut u32) -> Vec<[u8; 32]> {
    let (short, long) = match short_name_of(name) {
        Some(short) => (short, false),
        None => {
            let mut short = *b"LAOS~   BIN";
            let digits = alias.to_string();
            short[5..5 + digits.len()].copy_from_slice(digits.as_bytes());
            *alias += 1;
            (short, true)
        }
    };

    let mut out = Vec::new();
    if long {
        let units: Vec<u16> = name.encode_utf16().collect();
        let pieces = units.len().div_ceil(13);
        let sum = checksum(&short);
        for seq in (1..=pieces).rev() {
            let mut e = [0u8; 32];
            e[0] = seq as u8 | if seq == pieces { 0x40 } else { 0 };
            e[11] = 0x0F;
            e[13] = sum;
            let offsets = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
            for (i, &at) in offsets.iter().enumerate() {
                let index = (seq - 1) * 13 + i;
                let unit = match index.cmp(&units.len()) {
                    std::cmp::Ordering::Less => units[index],
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 0xFFFF,
                };
                e[at..at + 2].copy_from_slice(&unit.to_le_bytes());
            }
            out.push(e);
        }
    }

    let mut e = [0u8; 32];
    e[..11].copy_from_slice(&short);
    e[11] = attr;
    e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    out.push(e);
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// ISO9660
// ═══════════════════════════════════════════════════════════════════════════

pub const ISO_SECTOR: usize = 2048;

/// ISO9660 image, optionally with a Joliet tree. Primary names are upper
/// cased and anything outside `A-Z 0-9 . _` becomes `_`.
pub struct IsoBuilder {
    label: String,
    joliet: bool,
    files: Vec<(String, Vec<u8>)>,
}

fn parent(path: &str) -> &str {
    &path[..path.rfind('/').unwrap()]
}

fn leaf(path: &str) -> &str {
    &path[path.rfind('/').unwrap() + 1..]
}

fn both16(out: &mut [u8], v: u16) {
    out[..2].copy_from_slice(&v.to_le_bytes());
    out[2..4].copy_from_slice(&v.to_be_bytes());
}

fn both32(out: &mut [u8], v: u32) {
    out[..4].copy_from_slice(&v.to_le_bytes());
    out[4..8].copy_from_slice(&v.to_be_bytes());
}

fn iso_name(name: &str, joliet: bool, dir: bool) -> Vec<u8> {
    let version = if dir { "" } else { ";1" };
    if joliet {
        return format!("{}{}", name, version)
            .encode_utf16()
            .flat_map(u16::to_be_bytes)
            .collect();
    }
    let mangled: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' => c.to_ascii_uppercase(),
            _ => '_',
        })
        .collect();
    format!("{}{}", mangled, version).into_bytes()
}

/// Directory record for `(extent, size)`.
fn iso_record(id: &[u8], (extent, size): (usize, usize), dir: bool) -> Vec<u8> {
    let len = 33 + id.len() + (id.len() + 1) % 2;
    let mut r = vec![0u8; len];
    r[0] = len as u8;
    both32(&mut r[2..10], extent as u32);
    both32(&mut r[10..18], size as u32);
    r[25] = if dir { 0x02 } else { 0 };
    both16(&mut r[28..32], 1);
    r[32] = id.len() as u8;
    r[33..33 + id.len()].copy_from_slice(id);
    r
}

impl IsoBuilder {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            joliet: false,
            files: Vec::new(),
        }
    }

    pub fn joliet(mut self) -> Self {
        self.joliet = true;
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.push((path.to_string(), data.to_vec()));
        self
    }

    /// Root (as `""`) and every parent of a file, parents first.
    fn directories(&self) -> Vec<String> {
        let mut dirs = vec![String::new()];
        for (path, _) in &self.files {
            for (i, _) in path.match_indices('/').skip(1) {
                if !dirs.iter().any(|d| d == &path[..i]) {
                    dirs.push(path[..i].to_string());
                }
            }
        }
        dirs
    }

    /// Records of `dir`, packed so that none crosses a sector.
    fn dir_image(&self, dir: &str, joliet: bool, dirs: &[String], dir_at: &[(usize, usize)], file_at: &[usize]) -> Vec<u8> {
        let me = dirs.iter().position(|d| d == dir).unwrap();
        let up = if dir.is_empty() { me } else { dirs.iter().position(|d| d == parent(dir)).unwrap() };

        let mut records = vec![iso_record(&[0], dir_at[me], true), iso_record(&[1], dir_at[up], true)];
        for (i, sub) in dirs.iter().enumerate() {
            if !sub.is_empty() && parent(sub) == dir {
                records.push(iso_record(&iso_name(leaf(sub), joliet, true), dir_at[i], true));
            }
        }
        for (i, (path, data)) in self.files.iter().enumerate() {
            if parent(path) == dir {
                records.push(iso_record(&iso_name(leaf(path), joliet, false), (file_at[i], data.len()), false));
            }
        }

        let mut out = Vec::new();
        for r in records {
            let used = out.len() % ISO_SECTOR;
            if used + r.len() > ISO_SECTOR {
                out.resize(out.len() + ISO_SECTOR - used, 0);
            }
            out.extend(r);
        }
        out.resize(out.len().div_ceil(ISO_SECTOR) * ISO_SECTOR, 0);
        out
    }

    pub fn build(self) -> Vec<u8> {
        let dirs = self.directories();
        let trees: Vec<bool> = if self.joliet { vec![false, true] } else { vec![false] };

        // Directory sizes do not depend on where anything is placed.
        let blank_dirs = vec![(0, 0); dirs.len()];
        let blank_files = vec![0; self.files.len()];
        let mut next = 17 + trees.len();
        let mut dir_at: Vec<Vec<(usize, usize)>> = Vec::new();
        for &joliet in &trees {
            let mut at = Vec::new();
            for dir in &dirs {
                let bytes = self.dir_image(dir, joliet, &dirs, &blank_dirs, &blank_files).len();
                at.push((next, bytes));
                next += bytes / ISO_SECTOR;
            }
            dir_at.push(at);
        }
        let mut file_at = Vec::new();
        for (_, data) in &self.files {
            file_at.push(next);
            next += data.len().div_ceil(ISO_SECTOR).max(1);
        }

        let mut image = vec![0u8; next * ISO_SECTOR];
        for (t, &joliet) in trees.iter().enumerate() {
            for (d, dir) in dirs.iter().enumerate() {
                let data = self.dir_image(dir, joliet, &dirs, &dir_at[t], &file_at);
                let at = dir_at[t][d].0 * ISO_SECTOR;
                image[at..at + data.len()].copy_from_slice(&data);
            }
        }
        for ((_, data), &sector) in self.files.iter().zip(&file_at) {
            let at = sector * ISO_SECTOR;
            image[at..at + data.len()].copy_from_slice(data);
        }

        for (t, &joliet) in trees.iter().enumerate() {
            let desc = &mut image[(16 + t) * ISO_SECTOR..(17 + t) * ISO_SECTOR];
            desc[0] = if joliet { 2 } else { 1 };
            desc[1..6].copy_from_slice(b"CD001");
            desc[6] = 1;
            let label = format!("{:<32}", self.label);
            desc[40..72].copy_from_slice(&label.as_bytes()[..32]);
            both32(&mut desc[80..88], next as u32);
            if joliet {
                desc[88..91].copy_from_slice(&[0x25, 0x2F, 0x45]);
            }
            both16(&mut desc[128..132], ISO_SECTOR as u16);
            let root = iso_record(&[0], dir_at[t][0], true);
            desc[156..156 + root.len()].copy_from_slice(&root);
        }
        let end = 16 + trees.len();
        image[end * ISO_SECTOR] = 255;
        image[end * ISO_SECTOR + 1..end * ISO_SECTOR + 6].copy_from_slice(b"CD001");
        image[end * ISO_SECTOR + 6] = 1;
        image
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GZIP
// ═══════════════════════════════════════════════════════════════════════════

fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

/// Single-member gzip file carrying `name`.
pub fn gzip(data: &[u8], name: &str) -> Vec<u8> {
    let mut out = vec![0x1F, 0x8B, 8, 0x08, 0, 0, 0, 0, 0, 3];
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend(miniz_oxide::deflate::compress_to_vec(data, 6));
    out.extend_from_slice(&crc32(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}
