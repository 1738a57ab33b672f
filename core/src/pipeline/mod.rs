//! Boot pipeline
//!
//! [`Loader`] owns every piece of loader state and runs the phases in
//! order: platform and memory init, device scan, partition probing,
//! mounting, configuration, then for the chosen entry kernel load,
//! address-space construction, boot-info, firmware shutdown and the
//! jump. Everything a failed entry allocated is rolled back before the
//! menu gets control again.

pub mod handoff;
pub mod menu;

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

pub use handoff::HandoffPlan;
pub use menu::{AutoMenu, Menu};

use crate::bootinfo::{BootInfoBlock, BootInfoParams, ModuleInfo};
use crate::config::{self, BootConfig, BootEntry};
use crate::decompress;
use crate::disk::DeviceRegistry;
use crate::elf::{self, ElfImage};
use crate::fs::{FileRead, FileReader, Filesystems, MountId};
use crate::logger;
use crate::memory::{AllocFlags, AllocRequest, MemoryManager, PhysicalMemory, RegionKind};
use crate::mmu::{MapFlags, MmuContext, PagingMode};
use crate::partition;
use crate::platform::Platform;
use crate::{align_up, Error, Result, PAGE_SIZE};

/// ExitBootServices attempts before giving up.
pub const FINALISE_ATTEMPTS: usize = 3;

/// Kernel stack handed over with the boot-info block.
pub const STACK_SIZE: u64 = 16 * 1024;

/// Largest configuration file read.
const MAX_CONFIG_SIZE: u64 = 64 * 1024;
const MODULE_CHUNK: usize = 64 * 1024;

/// A boot attempt that did not make it, with what was being done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFailure {
    pub error: Error,
    pub context: String,
}

impl fmt::Display for BootFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}: {}", self.error.kind_name(), self.context)
    }
}

trait Context<T> {
    fn context(self, what: impl FnOnce() -> String) -> core::result::Result<T, BootFailure>;
}

impl<T> Context<T> for Result<T> {
    fn context(self, what: impl FnOnce() -> String) -> core::result::Result<T, BootFailure> {
        self.map_err(|error| BootFailure {
            error,
            context: what(),
        })
    }
}

/// Process-wide loader context. Built once; `new` consumes the platform.
pub struct Loader<P: Platform, M: PhysicalMemory> {
    platform: P,
    phys: M,
    memory: MemoryManager,
    registry: DeviceRegistry,
    filesystems: Filesystems,
    config: BootConfig,
    trampoline: u64,
}

impl<P: Platform, M: PhysicalMemory> Loader<P, M> {
    /// `platform_init` followed by `memory_init`.
    pub fn new(mut platform: P, phys: M) -> Result<Self> {
        platform.init()?;
        logger::attach(platform.console());
        log::info!("LAOS starting on {}", platform.firmware().name());

        let map = platform.memory_map()?;
        let mut memory = MemoryManager::from_firmware(&map.ranges);
        memory.set_ceiling(platform.physical_ceiling());
        log::info!("memory: {} MiB usable", memory.total_free() >> 20);

        // Allocated now so it sits clear of anything a kernel asks for later.
        let trampoline = memory.allocate_with(
            AllocRequest::new(PAGE_SIZE, RegionKind::PageTables)
                .flags(AllocFlags::BELOW_4G | AllocFlags::HIGH)
                .owner("trampoline"),
        )?;

        Ok(Self {
            platform,
            phys,
            memory,
            registry: DeviceRegistry::new(),
            filesystems: Filesystems::new(),
            config: BootConfig::fallback(),
            trampoline,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn phys(&mut self) -> &mut M {
        &mut self.phys
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn filesystems(&self) -> &Filesystems {
        &self.filesystems
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn trampoline(&self) -> u64 {
        self.trampoline
    }

    /// Register the disks the firmware reports. Returns how many.
    pub fn scan_devices(&mut self) -> Result<usize> {
        let mut added = 0;
        for disk in self.platform.scan_devices()? {
            match self.registry.add_disk(disk.kind, disk.block_size, disk.block_count, disk.device, disk.boot) {
                Ok(_) => added += 1,
                Err(e) => log::warn!("disk: skipped a {:?} disk: {}", disk.kind, e.kind_name()),
            }
        }
        Ok(added)
    }

    pub fn probe_partitions(&mut self) -> usize {
        partition::probe_all(&mut self.registry)
    }

    pub fn mount_filesystems(&mut self) -> usize {
        self.filesystems.mount_all(&mut self.registry)
    }

    /// Everything up to the menu: devices, partitions, mounts, config.
    pub fn initialise(&mut self) -> Result<()> {
        let disks = self.scan_devices()?;
        let partitions = self.probe_partitions();
        let mounts = self.mount_filesystems();
        log::info!(
            "{} disks, {} partitions, {} filesystems",
            disks,
            partitions,
            mounts
        );
        self.load_config();
        Ok(())
    }

    /// Mounts in search order: those on the boot disk first.
    fn search_order(&self) -> Vec<MountId> {
        let on_boot_disk = |device: usize| {
            let mut index = device;
            while let Some(info) = self.registry.info(index) {
                match info.parent {
                    Some(parent) => index = parent,
                    None => return info.boot,
                }
            }
            false
        };
        let (mut first, rest): (Vec<_>, Vec<_>) = self
            .filesystems
            .mounts()
            .partition(|&(_, device)| on_boot_disk(device));
        first.extend(rest);
        first.into_iter().map(|(mount, _)| mount).collect()
    }

    /// Find the mount holding `path`, restricted to `device` if given.
    pub fn locate(&mut self, device: Option<&str>, path: &str) -> Result<MountId> {
        let candidates = match device {
            Some(id) => {
                let index = self.registry.find(id).ok_or(Error::NotFound)?;
                let mount = self
                    .filesystems
                    .mount(&mut self.registry, index)?
                    .ok_or(Error::NotFound)?;
                vec![mount]
            }
            None => self.search_order(),
        };

        for mount in candidates {
            match self.filesystems.open(&mut self.registry, mount, path) {
                Ok(handle) => {
                    self.filesystems.close(handle);
                    return Ok(mount);
                }
                Err(Error::NotFound) => {}
                Err(e) => log::debug!("{}: {}", path, e),
            }
        }
        Err(Error::NotFound)
    }

    /// Read the first configuration file found, or fall back to booting
    /// the default kernel path.
    pub fn load_config(&mut self) -> &BootConfig {
        for mount in self.search_order() {
            for path in config::CONFIG_PATHS {
                let Ok(handle) = self.filesystems.open(&mut self.registry, mount, path) else {
                    continue;
                };
                let size = handle.size().min(MAX_CONFIG_SIZE) as usize;
                let device = self
                    .filesystems
                    .device_of(mount)
                    .and_then(|d| self.registry.info(d))
                    .map(|i| i.id.clone())
                    .unwrap_or_default();

                let mut reader = FileReader::new(&mut self.filesystems, &mut self.registry, handle);
                let mut raw = vec![0u8; size];
                let read = reader.read_exact_at(0, &mut raw);
                drop(reader);
                if read.is_err() {
                    log::warn!("config: cannot read {}:{}", device, path);
                    continue;
                }

                let Ok(text) = core::str::from_utf8(&raw) else {
                    log::warn!("config: {}:{} is not text", device, path);
                    continue;
                };
                let name = format!("{}:{}", device, path);
                match config::parse(text, &name) {
                    Ok(parsed) if !parsed.entries.is_empty() => {
                        log::info!("config: loaded {} ({} entries)", name, parsed.entries.len());
                        logger::set_verbose(parsed.debug);
                        self.config = parsed;
                        return &self.config;
                    }
                    Ok(_) => log::warn!("config: {} has no entries", name),
                    Err(_) => {}
                }
            }
        }

        log::info!("config: none found, booting {}", config::DEFAULT_KERNEL);
        self.config = BootConfig::fallback();
        &self.config
    }

    /// Build everything the hand-off needs for `entry` and shut firmware
    /// down. On failure the memory map is rolled back (unless the failure
    /// is fatal) and the console is usable again.
    pub fn prepare(&mut self, entry: &BootEntry) -> core::result::Result<HandoffPlan, BootFailure> {
        let checkpoint = self.memory.checkpoint();
        let result = self.try_prepare(entry);
        if let Err(failure) = &result {
            logger::attach(self.platform.console());
            if failure.error != Error::Fatal {
                self.memory.restore(checkpoint);
            }
        }
        result
    }

    fn try_prepare(&mut self, entry: &BootEntry) -> core::result::Result<HandoffPlan, BootFailure> {
        log::info!("Loading '{}'", entry.title);

        let mount = self
            .locate(entry.device.as_deref(), &entry.kernel)
            .context(|| format!("kernel {}", entry.kernel))?;
        let kernel_device = self
            .filesystems
            .device_of(mount)
            .ok_or(Error::NotFound)
            .context(|| format!("device holding {}", entry.kernel))?;

        let handle = self
            .filesystems
            .open(&mut self.registry, mount, &entry.kernel)
            .context(|| format!("kernel {}", entry.kernel))?;
        let reader = FileReader::new(&mut self.filesystems, &mut self.registry, handle);
        let mut file = decompress::open(reader).context(|| format!("kernel {}", entry.kernel))?;

        let image = ElfImage::parse(&mut *file).context(|| format!("ELF image {}", entry.kernel))?;
        let mode = image
            .target_mode(entry.mode)
            .context(|| format!("paging mode for {}", entry.kernel))?;

        let mut mmu = MmuContext::new(mode, &mut self.memory, &mut self.phys)
            .context(|| "page tables".to_string())?;
        mmu.set_allow_huge_pages(mode == PagingMode::Long && self.platform.allow_huge_pages());
        mmu.set_no_execute(self.platform.supports_no_execute());

        let loaded = elf::load(&mut *file, &image, &mut mmu, &mut self.memory, &mut self.phys)
            .context(|| format!("loading {}", entry.kernel))?;
        drop(file);

        let mut modules = Vec::new();
        for wanted in &entry.modules {
            let module = self
                .load_module(&mut mmu, kernel_device, &wanted.path, &wanted.name)
                .context(|| format!("module {}", wanted.path))?;
            modules.push(module);
        }

        let trampoline = self.trampoline;
        mmu.map(&mut self.memory, &mut self.phys, trampoline, trampoline, PAGE_SIZE, MapFlags::EXEC)
            .context(|| "identity mapping the trampoline".to_string())?;

        let stack = self
            .memory
            .allocate_with(
                AllocRequest::new(STACK_SIZE, RegionKind::Reclaimable)
                    .flags(AllocFlags::BELOW_4G | AllocFlags::HIGH)
                    .owner("stack"),
            )
            .context(|| "kernel stack".to_string())?;
        mmu.map(&mut self.memory, &mut self.phys, stack, stack, STACK_SIZE, MapFlags::WRITE)
            .context(|| "mapping the kernel stack".to_string())?;

        let boot_device = self
            .registry
            .info(kernel_device)
            .map(|i| i.id.clone())
            .unwrap_or_default();
        let params = BootInfoParams {
            firmware: self.platform.firmware(),
            cmdline: &entry.cmdline,
            boot_device: &boot_device,
            modules: &modules,
            framebuffer: self.platform.framebuffer(),
            system_table: self.platform.system_table(),
            stack_base: stack,
            stack_size: STACK_SIZE,
        };
        let regions = self.memory.regions().len();
        let block = BootInfoBlock::allocate(&mut self.memory, &params, regions)
            .context(|| "boot info".to_string())?;
        mmu.map(&mut self.memory, &mut self.phys, block.phys, block.phys, block.size, MapFlags::WRITE)
            .context(|| "mapping boot info".to_string())?;
        block
            .write(&mut self.phys, &params, self.memory.regions())
            .context(|| "boot info".to_string())?;

        let plan = HandoffPlan {
            mode,
            cr3: mmu.root(),
            entry: loaded.entry,
            boot_info: block.phys,
            stack_top: stack + STACK_SIZE,
            trampoline,
        };
        handoff::write_trampoline(&mut self.phys, &plan, self.platform.trampoline_code())
            .context(|| "trampoline".to_string())?;
        mmu.destroy();

        log::info!(
            "Entering {} kernel at {:#x}, boot info at {:#x}",
            mode.name(),
            plan.entry,
            plan.boot_info
        );
        self.finalise(&block)?;
        Ok(plan)
    }

    /// Read a module into its own region and identity map it.
    fn load_module(&mut self, mmu: &mut MmuContext, device: usize, path: &str, name: &str) -> Result<ModuleInfo> {
        let mount = match self.filesystems.mount_for_device(device) {
            Some(mount) if self.locate_on(mount, path) => mount,
            _ => self.locate(None, path)?,
        };
        let handle = self.filesystems.open(&mut self.registry, mount, path)?;
        let size = handle.size();
        if size == 0 {
            self.filesystems.close(handle);
            return Err(Error::Invalid);
        }

        let mut req = AllocRequest::new(size, RegionKind::Modules).owner("module");
        if !mmu.mode().is_64bit() {
            req = req.flags(AllocFlags::BELOW_4G);
        }
        let base = match self.memory.allocate_with(req) {
            Ok(base) => base,
            Err(e) => {
                self.filesystems.close(handle);
                return Err(e);
            }
        };

        let mut reader = FileReader::new(&mut self.filesystems, &mut self.registry, handle);
        let mut buf = vec![0u8; MODULE_CHUNK];
        let mut done = 0u64;
        while done < size {
            let n = ((size - done) as usize).min(MODULE_CHUNK);
            reader.read_exact_at(done, &mut buf[..n])?;
            self.phys.write(base + done, &buf[..n])?;
            done += n as u64;
        }
        drop(reader);

        let mapped = align_up(size, PAGE_SIZE);
        mmu.map(&mut self.memory, &mut self.phys, base, base, mapped, MapFlags::WRITE)?;
        log::info!("module {} ({} bytes) at {:#x}", name, size, base);
        Ok(ModuleInfo {
            base,
            size,
            name: name.to_string(),
        })
    }

    fn locate_on(&mut self, mount: MountId, path: &str) -> bool {
        match self.filesystems.open(&mut self.registry, mount, path) {
            Ok(handle) => {
                self.filesystems.close(handle);
                true
            }
            Err(_) => false,
        }
    }

    /// Shut firmware down, retrying on a stale map key. The boot-info map
    /// is refreshed from the firmware before every attempt.
    fn finalise(&mut self, block: &BootInfoBlock) -> core::result::Result<(), BootFailure> {
        logger::detach();

        for attempt in 1..=FINALISE_ATTEMPTS {
            // Once a finalise attempt has failed, firmware is half gone.
            let escalate = |e: Error| if attempt > 1 { Error::Fatal } else { e };

            let map = self
                .platform
                .memory_map()
                .map_err(escalate)
                .context(|| "re-reading the memory map".to_string())?;
            self.memory.merge_firmware_changes(&map.ranges);
            block
                .update_memory_map(&mut self.phys, self.memory.regions())
                .map_err(escalate)
                .context(|| "boot-info memory map".to_string())?;

            match self.platform.finalise(map.key) {
                Ok(()) => return Ok(()),
                // Stale map key: fetch the map again and retry.
                Err(Error::Invalid) => log::warn!("finalise attempt {}: memory map changed", attempt),
                Err(e) => {
                    return Err(BootFailure {
                        error: escalate(e),
                        context: "firmware shutdown".to_string(),
                    })
                }
            }
        }

        Err(BootFailure {
            error: Error::Fatal,
            context: format!("firmware shutdown failed after {} attempts", FINALISE_ATTEMPTS),
        })
    }

    /// Menu loop. Returns only by jumping to a kernel or halting.
    pub fn run(mut self, menu: &mut dyn Menu) -> ! {
        loop {
            let Some(index) = menu.select(&self.config, &mut self.platform) else {
                log::error!("no bootable entry left");
                self.platform.halt();
            };
            let Some(entry) = self.config.entries.get(index).cloned() else {
                self.platform.halt();
            };

            match self.prepare(&entry) {
                Ok(plan) => self.platform.enter_kernel(&plan),
                Err(failure) => {
                    let console = self.platform.console();
                    console.write_str(&format!("{}\n", failure));
                    if failure.error == Error::Fatal {
                        self.platform.halt();
                    }
                    menu.failed(index, &failure);
                }
            }
        }
    }
}
