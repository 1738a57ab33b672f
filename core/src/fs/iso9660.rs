//! Read-only ISO9660 driver
//!
//! Volume descriptors start at sector 16. When a Joliet supplementary
//! descriptor is present its directory tree is used instead of the
//! primary one, for the long mixed-case names. Matching is
//! case-insensitive and the `;1` version suffix is ignored.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{names_match, path_components, FileNode, FsDriver, MountedFs, Volume};
use crate::{Error, Result};

pub const SECTOR_SIZE: u64 = 2048;
const DESCRIPTORS_START: u64 = 16;
/// Descriptors read before giving up on finding a terminator.
const MAX_DESCRIPTORS: u64 = 112;
const IDENTIFIER: &[u8; 5] = b"CD001";

const DESC_PRIMARY: u8 = 1;
const DESC_SUPPLEMENTARY: u8 = 2;
const DESC_TERMINATOR: u8 = 255;

const RECORD_HEADER: usize = 33;
const FLAG_HIDDEN: u8 = 0x01;
const FLAG_DIRECTORY: u8 = 0x02;
const MAX_DIR_BYTES: u32 = 4 << 20;

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// One directory record, as far as lookups care.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    name: String,
    extent: u32,
    size: u32,
    directory: bool,
}

impl Record {
    /// Decode the record at the start of `raw`. Returns it with its length.
    fn parse(raw: &[u8], joliet: bool) -> Result<(Option<Self>, usize)> {
        let len = raw[0] as usize;
        if len < RECORD_HEADER || len > raw.len() {
            return Err(Error::Invalid);
        }
        let id_len = raw[32] as usize;
        if RECORD_HEADER + id_len > len {
            return Err(Error::Invalid);
        }

        let flags = raw[25];
        let id = &raw[RECORD_HEADER..RECORD_HEADER + id_len];
        // `.` and `..` are single 0x00 and 0x01 bytes.
        if flags & FLAG_HIDDEN != 0 || matches!(id, [0] | [1]) {
            return Ok((None, len));
        }

        let name = if joliet { joliet_name(id) } else { plain_name(id) };
        let record = Self {
            name,
            extent: le32(raw, 2),
            size: le32(raw, 10),
            directory: flags & FLAG_DIRECTORY != 0,
        };
        Ok((Some(record), len))
    }
}

/// `NAME.EXT;1` to `NAME.EXT`, and `NAME.;1` to `NAME`.
fn plain_name(id: &[u8]) -> String {
    let end = id.iter().position(|&c| c == b';').unwrap_or(id.len());
    let base = match &id[..end] {
        [rest @ .., b'.'] if !rest.is_empty() => rest,
        base => base,
    };
    String::from_utf8_lossy(base).into_owned()
}

/// UCS-2 big-endian, with the same suffixes dropped.
fn joliet_name(id: &[u8]) -> String {
    let units = id.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
    let mut name: String = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    if name.len() > 2 && name.ends_with(";1") {
        name.truncate(name.len() - 2);
    }
    while name.len() >= 2 && name.ends_with('.') {
        name.pop();
    }
    name
}

/// Joliet levels 1 to 3 announce themselves with these escape sequences.
fn is_joliet(desc: &[u8]) -> bool {
    matches!(&desc[88..91], [0x25, 0x2F, 0x40 | 0x43 | 0x45])
}

/// Label from the primary descriptor, blanks trimmed.
fn volume_label(desc: &[u8]) -> Option<String> {
    core::str::from_utf8(&desc[40..72])
        .ok()
        .map(|l| l.trim_end_matches(|c: char| c == ' ' || c == '\0'))
        .filter(|l| !l.is_empty())
        .map(String::from)
}

pub struct Iso9660Driver;

impl FsDriver for Iso9660Driver {
    fn name(&self) -> &'static str {
        "iso9660"
    }

    fn mount(&self, volume: &mut Volume<'_>) -> Result<Option<Box<dyn MountedFs>>> {
        let mut primary: Option<Vec<u8>> = None;
        let mut joliet: Option<Vec<u8>> = None;

        for sector in DESCRIPTORS_START..DESCRIPTORS_START + MAX_DESCRIPTORS {
            if (sector + 1) * SECTOR_SIZE > volume.size() {
                break;
            }
            let mut desc = vec![0u8; SECTOR_SIZE as usize];
            volume.read(sector * SECTOR_SIZE, &mut desc)?;
            if &desc[1..6] != IDENTIFIER {
                break;
            }
            match desc[0] {
                DESC_PRIMARY if primary.is_none() => primary = Some(desc),
                DESC_SUPPLEMENTARY if joliet.is_none() && is_joliet(&desc) => joliet = Some(desc),
                DESC_TERMINATOR => break,
                _ => {}
            }
        }

        let Some(primary) = primary else {
            return Ok(None);
        };
        if le16(&primary, 128) as u64 != SECTOR_SIZE {
            log::warn!("iso9660: unsupported block size {}", le16(&primary, 128));
            return Ok(None);
        }

        let root_desc = joliet.as_deref().unwrap_or(&primary);
        let root = &root_desc[156..156 + 34];
        let fs = IsoFs {
            root_extent: le32(root, 2),
            root_size: le32(root, 10),
            joliet: joliet.is_some(),
            label: volume_label(&primary),
        };
        log::debug!("iso9660: root at sector {}, joliet {}", fs.root_extent, fs.joliet);
        Ok(Some(Box::new(fs)))
    }
}

struct IsoFs {
    root_extent: u32,
    root_size: u32,
    joliet: bool,
    label: Option<String>,
}

impl IsoFs {
    fn read_dir(&self, volume: &mut Volume<'_>, extent: u32, size: u32) -> Result<Vec<Record>> {
        if size > MAX_DIR_BYTES {
            return Err(Error::Invalid);
        }
        let mut data = vec![0u8; size as usize];
        volume.read(extent as u64 * SECTOR_SIZE, &mut data)?;

        let mut records = Vec::new();
        let mut at = 0usize;
        while at < data.len() {
            if data[at] == 0 {
                // Records never span sectors; the rest of this one is padding.
                at = (at / SECTOR_SIZE as usize + 1) * SECTOR_SIZE as usize;
                continue;
            }
            let (record, len) = Record::parse(&data[at..], self.joliet)?;
            records.extend(record);
            at += len;
        }
        Ok(records)
    }
}

impl MountedFs for IsoFs {
    fn driver(&self) -> &'static str {
        "iso9660"
    }

    fn case_sensitive(&self) -> bool {
        false
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn open(&mut self, volume: &mut Volume<'_>, path: &str) -> Result<FileNode> {
        let parts = path_components(path)?;
        let (last, dirs) = parts.split_last().ok_or(Error::Invalid)?;

        let (mut extent, mut size) = (self.root_extent, self.root_size);
        for name in dirs {
            let dir = self
                .read_dir(volume, extent, size)?
                .into_iter()
                .find(|r| names_match(name, &r.name, false))
                .ok_or(Error::NotFound)?;
            if !dir.directory {
                return Err(Error::NotFound);
            }
            (extent, size) = (dir.extent, dir.size);
        }

        let file = self
            .read_dir(volume, extent, size)?
            .into_iter()
            .find(|r| names_match(last, &r.name, false))
            .ok_or(Error::NotFound)?;
        if file.directory {
            return Err(Error::Invalid);
        }
        Ok(FileNode {
            id: file.extent as u64,
            size: file.size as u64,
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
        // Files are a single contiguous extent.
        let len = (buf.len() as u64).min(node.size - offset) as usize;
        volume.read(node.id * SECTOR_SIZE + offset, &mut buf[..len])?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &[u8], flags: u8) -> Vec<u8> {
        let len = RECORD_HEADER + id.len() + (id.len() + 1) % 2;
        let mut raw = vec![0u8; len];
        raw[0] = len as u8;
        raw[2..6].copy_from_slice(&20u32.to_le_bytes());
        raw[10..14].copy_from_slice(&300u32.to_le_bytes());
        raw[25] = flags;
        raw[32] = id.len() as u8;
        raw[RECORD_HEADER..RECORD_HEADER + id.len()].copy_from_slice(id);
        raw
    }

    #[test]
    fn version_suffixes_are_dropped() {
        assert_eq!(plain_name(b"KERNEL.ELF;1"), "KERNEL.ELF");
        assert_eq!(plain_name(b"README.;1"), "README");
        assert_eq!(plain_name(b"BOOT"), "BOOT");

        let utf16: Vec<u8> = "vmlinuz-6.1;1".encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(joliet_name(&utf16), "vmlinuz-6.1");
        let dotted: Vec<u8> = "initrd..".encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(joliet_name(&dotted), "initrd");
    }

    #[test]
    fn records_are_decoded() {
        let raw = record(b"KERNEL.;1", 0);
        let (rec, len) = Record::parse(&raw, false).expect("record");
        assert_eq!(len, raw.len());
        assert_eq!(
            rec,
            Some(Record {
                name: "KERNEL".into(),
                extent: 20,
                size: 300,
                directory: false
            })
        );

        assert_eq!(Record::parse(&record(&[0], FLAG_DIRECTORY), false).expect("dot").0, None);
        assert_eq!(Record::parse(&record(&[1], FLAG_DIRECTORY), false).expect("dotdot").0, None);
        assert_eq!(Record::parse(&record(b"SECRET;1", FLAG_HIDDEN), false).expect("hidden").0, None);
    }

    #[test]
    fn malformed_records_are_invalid() {
        let mut raw = record(b"KERNEL;1", 0);
        // Identifier runs past the record.
        raw[32] = 40;
        assert_eq!(Record::parse(&raw, false), Err(Error::Invalid));

        let raw = record(b"KERNEL;1", 0);
        assert_eq!(Record::parse(&raw[..20], false), Err(Error::Invalid));

        let mut raw = record(b"KERNEL;1", 0);
        raw[0] = 10;
        assert_eq!(Record::parse(&raw, false), Err(Error::Invalid));
    }
}
