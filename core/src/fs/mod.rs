//! Filesystem layer
//!
//! Drivers are kept in a table and tried in order against each device;
//! the first one that recognises the leading blocks wins the mount. All
//! file access afterwards goes through [`Filesystems`], which owns the
//! mounts and hands out [`FileHandle`]s. Reads are always absolute
//! `(offset, buf)` pairs.

pub mod ext2;
pub mod fat;
pub mod iso9660;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::disk::DeviceRegistry;
use crate::{Error, Result};

/// Byte-addressed view of a registry node, given to drivers.
pub struct Volume<'a> {
    registry: &'a mut DeviceRegistry,
    index: usize,
    size: u64,
}

impl<'a> Volume<'a> {
    pub fn new(registry: &'a mut DeviceRegistry, index: usize) -> Result<Self> {
        let size = registry.info(index).ok_or(Error::NotFound)?.size();
        Ok(Self {
            registry,
            index,
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` from byte `offset` or fail.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.registry.read_exact(self.index, offset, buf)
    }
}

/// A file as a driver identifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileNode {
    /// Inode number, first cluster, or whatever the driver keys files by
    pub id: u64,
    pub size: u64,
}

/// Filesystem driver entry in the probe table.
pub trait FsDriver: Sync {
    fn name(&self) -> &'static str;

    /// Inspect the start of `volume`; `Ok(None)` when it is not ours.
    fn mount(&self, volume: &mut Volume<'_>) -> Result<Option<Box<dyn MountedFs>>>;
}

/// State of one mounted filesystem.
pub trait MountedFs {
    fn driver(&self) -> &'static str;

    fn case_sensitive(&self) -> bool;

    fn label(&self) -> Option<&str> {
        None
    }

    /// Resolve an absolute path to a regular file.
    fn open(&mut self, volume: &mut Volume<'_>, path: &str) -> Result<FileNode>;

    /// Read from `node` at `offset`. Returns the byte count, short only at
    /// end of file.
    fn read(
        &mut self,
        volume: &mut Volume<'_>,
        node: &FileNode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize>;
}

static EXT2: ext2::Ext2Driver = ext2::Ext2Driver;
static FAT: fat::FatDriver = fat::FatDriver;
static ISO9660: iso9660::Iso9660Driver = iso9660::Iso9660Driver;

/// Probe order.
pub static DRIVERS: &[&dyn FsDriver] = &[&EXT2, &FAT, &ISO9660];

/// Split an absolute path into its components, resolving `.` and `..`.
pub fn path_components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(Error::Invalid);
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    Ok(parts)
}

/// Compare a path component with a directory entry name.
pub fn names_match(wanted: &str, found: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        wanted == found
    } else {
        wanted.eq_ignore_ascii_case(found)
    }
}

/// Anything the loader can read at absolute offsets.
pub trait FileRead {
    fn size(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` completely or fail with EIO.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::Io);
            }
            done += n;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountId(usize);

/// Open file. Not `Clone`: it is given back through [`Filesystems::close`].
#[derive(Debug, PartialEq, Eq)]
pub struct FileHandle {
    pub mount: MountId,
    pub node: FileNode,
}

impl FileHandle {
    pub fn size(&self) -> u64 {
        self.node.size
    }
}

struct Mount {
    device: usize,
    fs: Box<dyn MountedFs>,
}

/// Mount table plus open-file bookkeeping.
pub struct Filesystems {
    mounts: Vec<Mount>,
    open_files: usize,
}

impl Filesystems {
    pub const fn new() -> Self {
        Self {
            mounts: Vec::new(),
            open_files: 0,
        }
    }

    /// Mount `device` with the first driver that recognises it. Containers
    /// are never mounted; an already mounted device returns its mount.
    pub fn mount(&mut self, registry: &mut DeviceRegistry, device: usize) -> Result<Option<MountId>> {
        let info = registry.info(device).ok_or(Error::NotFound)?;
        if info.container {
            return Ok(None);
        }
        if let Some(existing) = self.mount_for_device(device) {
            return Ok(Some(existing));
        }

        let mut volume = Volume::new(registry, device)?;
        for driver in DRIVERS {
            match driver.mount(&mut volume) {
                Ok(Some(fs)) => {
                    log::info!(
                        "fs: mounted {} on {}{}",
                        fs.driver(),
                        volume.registry.info(device).map(|i| i.id.as_str()).unwrap_or("?"),
                        fs.label().map(|l| alloc::format!(" ({})", l)).unwrap_or_default()
                    );
                    self.mounts.push(Mount { device, fs });
                    return Ok(Some(MountId(self.mounts.len() - 1)));
                }
                Ok(None) => {}
                Err(e) => log::debug!("fs: {} probe error: {}", driver.name(), e.kind_name()),
            }
        }
        Ok(None)
    }

    /// Try every registered node. Returns how many got mounted.
    pub fn mount_all(&mut self, registry: &mut DeviceRegistry) -> usize {
        let devices: Vec<usize> = registry.iter().map(|(index, _)| index).collect();
        devices
            .into_iter()
            .filter(|&device| matches!(self.mount(registry, device), Ok(Some(_))))
            .count()
    }

    pub fn mount_for_device(&self, device: usize) -> Option<MountId> {
        self.mounts
            .iter()
            .position(|m| m.device == device)
            .map(MountId)
    }

    /// Mounts in mount order with their device index.
    pub fn mounts(&self) -> impl Iterator<Item = (MountId, usize)> + '_ {
        self.mounts
            .iter()
            .enumerate()
            .map(|(i, m)| (MountId(i), m.device))
    }

    pub fn device_of(&self, mount: MountId) -> Option<usize> {
        self.mounts.get(mount.0).map(|m| m.device)
    }

    pub fn case_sensitive(&self, mount: MountId) -> Option<bool> {
        self.mounts.get(mount.0).map(|m| m.fs.case_sensitive())
    }

    pub fn open(
        &mut self,
        registry: &mut DeviceRegistry,
        mount: MountId,
        path: &str,
    ) -> Result<FileHandle> {
        let entry = self.mounts.get_mut(mount.0).ok_or(Error::NotFound)?;
        let mut volume = Volume::new(registry, entry.device)?;
        let node = entry.fs.open(&mut volume, path)?;
        self.open_files += 1;
        log::debug!("fs: opened {} ({} bytes)", path, node.size);
        Ok(FileHandle { mount, node })
    }

    pub fn read(
        &mut self,
        registry: &mut DeviceRegistry,
        handle: &FileHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= handle.node.size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(handle.node.size - offset) as usize;
        let entry = self.mounts.get_mut(handle.mount.0).ok_or(Error::NotFound)?;
        let mut volume = Volume::new(registry, entry.device)?;
        entry.fs.read(&mut volume, &handle.node, offset, &mut buf[..len])
    }

    pub fn close(&mut self, handle: FileHandle) {
        drop(handle);
        self.release();
    }

    fn release(&mut self) {
        self.open_files = self.open_files.saturating_sub(1);
    }

    pub fn open_files(&self) -> usize {
        self.open_files
    }
}

/// A handle bound to the tables it reads through. Closing happens on drop.
pub struct FileReader<'a> {
    fs: &'a mut Filesystems,
    registry: &'a mut DeviceRegistry,
    handle: FileHandle,
    cursor: u64,
}

impl<'a> FileReader<'a> {
    pub fn new(fs: &'a mut Filesystems, registry: &'a mut DeviceRegistry, handle: FileHandle) -> Self {
        Self {
            fs,
            registry,
            handle,
            cursor: 0,
        }
    }

    /// Offset just past the last byte read.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl FileRead for FileReader<'_> {
    fn size(&self) -> u64 {
        self.handle.size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.fs.read(self.registry, &self.handle, offset, buf)?;
        self.cursor = offset + n as u64;
        Ok(n)
    }
}

impl Drop for FileReader<'_> {
    fn drop(&mut self) {
        // The handle itself goes with the reader.
        self.fs.release();
    }
}

/// A plain byte slice, used for files already in memory.
impl FileRead for &[u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}
