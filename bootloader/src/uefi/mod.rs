//! UEFI back end
//!
//! Runs as an x86_64 UEFI application with the firmware's identity map.
//! Disks come from Block I/O, the console from `ConOut`/`ConIn`, time
//! from `Stall`. Memory above 1 MiB is claimed up front so the core's
//! memory manager owns it outright; `finalise` is ExitBootServices.

pub mod block_io;
pub mod console;
pub mod memory;
pub mod tables;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::arch::asm;
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr;

use laos_core::platform::{
    Console, DiskDescriptor, FirmwareKind, FramebufferInfo, MemoryMapSnapshot, Platform,
};
use laos_core::pipeline::HandoffPlan;
use laos_core::{Error, Result};

use crate::{cpu, heap};
use block_io::{classify, UefiDisk};
use console::UefiConsole;
use memory::MemoryMap;
use tables::*;

static CONSOLE: spin::Once<UefiConsole> = spin::Once::new();

static HANDOFF: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/handoff64.bin"));

/// Map a firmware status onto a loader error.
pub fn status_to_error(status: Status) -> Error {
    match status {
        EFI_OUT_OF_RESOURCES => Error::NoMemory,
        EFI_DEVICE_ERROR | EFI_MEDIA_CHANGED => Error::Io,
        EFI_NO_MEDIA | EFI_NOT_FOUND => Error::NotFound,
        EFI_TIMEOUT => Error::TimedOut,
        EFI_UNSUPPORTED => Error::NotSupported,
        EFI_INVALID_PARAMETER | EFI_BAD_BUFFER_SIZE | EFI_BUFFER_TOO_SMALL => Error::Invalid,
        _ => Error::Io,
    }
}

/// Status returned from `efi_main` when the loader gives up.
pub fn status_from_error(error: Error) -> Status {
    match error {
        Error::NoMemory => EFI_OUT_OF_RESOURCES,
        Error::Io => EFI_DEVICE_ERROR,
        Error::NotFound => EFI_NOT_FOUND,
        Error::Invalid => EFI_INVALID_PARAMETER,
        Error::TimedOut => EFI_TIMEOUT,
        Error::NotSupported => EFI_UNSUPPORTED,
        Error::Exists | Error::Fatal => EFI_LOAD_ERROR,
    }
}

fn check(status: Status) -> Result<()> {
    if status == EFI_SUCCESS {
        Ok(())
    } else {
        Err(status_to_error(status))
    }
}

pub struct UefiPlatform {
    image: Handle,
    system_table: *const SystemTable,
    boot_services: *const BootServices,
    framebuffer: Option<FramebufferInfo>,
    huge_pages: bool,
}

impl UefiPlatform {
    /// Disable the watchdog, set up the heap and the console.
    ///
    /// # Safety
    /// `image` and `system_table` must be the values the firmware passed
    /// to the entry point, and this must run once.
    pub unsafe fn new(image: Handle, system_table: *const SystemTable) -> core::result::Result<Self, Status> {
        if system_table.is_null() || (*system_table).boot_services.is_null() {
            return Err(EFI_INVALID_PARAMETER);
        }
        let st = &*system_table;
        let bs = &*st.boot_services;

        (bs.set_watchdog_timer)(0, 0, 0, ptr::null());

        let pages = heap::HEAP_SIZE / PAGE_BYTES;
        let mut base = 0u64;
        let status = (bs.allocate_pages)(ALLOCATE_ANY_PAGES, EFI_LOADER_DATA, pages, &mut base);
        if status != EFI_SUCCESS {
            return Err(status);
        }
        heap::init(base as *mut u8, heap::HEAP_SIZE);

        CONSOLE.call_once(|| UefiConsole::new(st.con_out));

        Ok(Self {
            image,
            system_table,
            boot_services: st.boot_services,
            framebuffer: None,
            huge_pages: cpu::has_huge_pages(),
        })
    }

    fn boot_services(&self) -> &BootServices {
        // SAFETY: valid until ExitBootServices, after which only
        // `enter_kernel` and `halt` run.
        unsafe { &*self.boot_services }
    }

    fn protocol<T>(&self, handle: Handle, guid: &Guid) -> Option<*mut T> {
        let mut interface: *mut c_void = ptr::null_mut();
        let status = (self.boot_services().handle_protocol)(handle, guid, &mut interface);
        (status == EFI_SUCCESS && !interface.is_null()).then_some(interface as *mut T)
    }

    fn query_framebuffer(&self) -> Option<FramebufferInfo> {
        let mut interface: *mut c_void = ptr::null_mut();
        let status = (self.boot_services().locate_protocol)(
            &EFI_GRAPHICS_OUTPUT_PROTOCOL_GUID,
            ptr::null(),
            &mut interface,
        );
        if status != EFI_SUCCESS || interface.is_null() {
            return None;
        }
        // SAFETY: firmware-owned structures, read-only here.
        unsafe {
            let gop = &*(interface as *const GraphicsOutputProtocol);
            let mode = gop.mode.as_ref()?;
            let info = mode.info.as_ref()?;
            match info.pixel_format {
                GopPixelFormat::Rgbx | GopPixelFormat::Bgrx => Some(FramebufferInfo {
                    base: mode.frame_buffer_base,
                    width: info.horizontal_resolution,
                    height: info.vertical_resolution,
                    pitch: info.pixels_per_scan_line * 4,
                    bpp: 32,
                }),
                GopPixelFormat::BitMask | GopPixelFormat::BltOnly => None,
            }
        }
    }

    fn block_io_handles(&self) -> Result<Vec<Handle>> {
        let bs = self.boot_services();
        let mut size = 0usize;
        let status = (bs.locate_handle)(
            BY_PROTOCOL,
            &EFI_BLOCK_IO_PROTOCOL_GUID,
            ptr::null(),
            &mut size,
            ptr::null_mut(),
        );
        match status {
            EFI_BUFFER_TOO_SMALL => {}
            EFI_NOT_FOUND => return Ok(Vec::new()),
            other => return Err(status_to_error(other)),
        }

        let mut handles: Vec<Handle> = vec![ptr::null_mut(); size / size_of::<Handle>()];
        check((bs.locate_handle)(
            BY_PROTOCOL,
            &EFI_BLOCK_IO_PROTOCOL_GUID,
            ptr::null(),
            &mut size,
            handles.as_mut_ptr(),
        ))?;
        handles.truncate(size / size_of::<Handle>());
        Ok(handles)
    }

    /// Device path bytes up to (not including) the end node.
    fn device_path(&self, handle: Handle) -> Option<Vec<u8>> {
        let mut node = self.protocol::<DevicePathNode>(handle, &EFI_DEVICE_PATH_PROTOCOL_GUID)? as *const u8;
        let mut bytes = Vec::new();
        // SAFETY: a well-formed path is terminated by an end node; the
        // node count is bounded in case it is not.
        unsafe {
            for _ in 0..64 {
                let header = &*(node as *const DevicePathNode);
                let length = u16::from_le_bytes(header.length) as usize;
                if header.kind == END_OF_PATH || length < size_of::<DevicePathNode>() {
                    break;
                }
                bytes.extend_from_slice(core::slice::from_raw_parts(node, length));
                node = node.add(length);
            }
        }
        Some(bytes)
    }

    /// Path of the device this image was loaded from.
    fn boot_device_path(&self) -> Option<Vec<u8>> {
        let image = self.protocol::<LoadedImageProtocol>(self.image, &EFI_LOADED_IMAGE_PROTOCOL_GUID)?;
        // SAFETY: firmware-owned protocol instance.
        let device = unsafe { (*image).device_handle };
        if device.is_null() {
            return None;
        }
        self.device_path(device)
    }
}

const PAGE_BYTES: usize = 4096;

impl Platform for UefiPlatform {
    fn init(&mut self) -> Result<()> {
        if let Some(console) = CONSOLE.get() {
            console.clear();
        }
        self.framebuffer = self.query_framebuffer();

        // SAFETY: boot services are running.
        let claimed = unsafe { memory::claim_conventional(self.boot_services()) }
            .map_err(status_to_error)?;
        log::debug!("claimed {} MiB from firmware", (claimed * PAGE_BYTES as u64) >> 20);
        Ok(())
    }

    fn firmware(&self) -> FirmwareKind {
        FirmwareKind::Uefi
    }

    fn console(&self) -> &'static dyn Console {
        match CONSOLE.get() {
            Some(console) => console,
            None => CONSOLE.call_once(|| UefiConsole::new(ptr::null_mut())),
        }
    }

    fn memory_map(&mut self) -> Result<MemoryMapSnapshot> {
        // SAFETY: boot services are running.
        let map = unsafe { MemoryMap::snapshot(self.boot_services()) }.map_err(status_to_error)?;
        Ok(MemoryMapSnapshot {
            ranges: map.ranges(),
            key: map.map_key as u64,
        })
    }

    fn scan_devices(&mut self) -> Result<Vec<DiskDescriptor>> {
        let boot_path = self.boot_device_path();
        let mut disks = Vec::new();

        for handle in self.block_io_handles()? {
            let Some(protocol) = self.protocol::<BlockIoProtocol>(handle, &EFI_BLOCK_IO_PROTOCOL_GUID) else {
                continue;
            };
            // SAFETY: media is valid while the protocol is.
            let media = unsafe { &*(*protocol).media };
            if media.logical_partition || !media.media_present || media.block_size == 0 {
                continue;
            }

            let boot = match (&boot_path, self.device_path(handle)) {
                (Some(image), Some(disk)) => !disk.is_empty() && image.starts_with(&disk),
                _ => false,
            };
            disks.push(DiskDescriptor {
                kind: classify(media),
                block_size: media.block_size,
                block_count: media.last_block + 1,
                // SAFETY: firmware keeps the protocol alive until EBS.
                device: Box::new(unsafe { UefiDisk::new(protocol) }),
                boot,
            });
        }
        Ok(disks)
    }

    fn spin(&mut self, us: u64) {
        (self.boot_services().stall)(us as usize);
    }

    fn poll_key(&mut self) -> Option<u16> {
        // SAFETY: the system table outlives boot services.
        let con_in = unsafe { (*self.system_table).con_in };
        if con_in.is_null() {
            return None;
        }
        let mut key = InputKey::default();
        // SAFETY: firmware-owned protocol.
        let status = unsafe { ((*con_in).read_key_stroke)(con_in, &mut key) };
        if status != EFI_SUCCESS {
            return None;
        }
        Some(if key.unicode_char != 0 {
            key.unicode_char
        } else {
            0x8000 | key.scan_code
        })
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        self.framebuffer
    }

    fn system_table(&self) -> u64 {
        self.system_table as u64
    }

    fn allow_huge_pages(&self) -> bool {
        self.huge_pages
    }

    fn supports_no_execute(&self) -> bool {
        cpu::has_no_execute()
    }

    fn trampoline_code(&self) -> &'static [u8] {
        HANDOFF
    }

    fn finalise(&mut self, map_key: u64) -> Result<()> {
        let status = (self.boot_services().exit_boot_services)(self.image, map_key as usize);
        if status != EFI_SUCCESS {
            return Err(status_to_error(status));
        }
        if let Some(console) = CONSOLE.get() {
            console.mark_exited();
        }
        Ok(())
    }

    fn enter_kernel(&mut self, plan: &HandoffPlan) -> ! {
        let code = plan.code_address();
        // SAFETY: the pipeline wrote the trampoline and its parameter
        // block; firmware is gone and nothing here runs again.
        unsafe {
            asm!(
                "cli",
                "jmp {0}",
                in(reg) code,
                in("rsi") plan.trampoline,
                options(noreturn)
            )
        }
    }

    fn halt(&mut self) -> ! {
        cpu::halt()
    }
}
