//! UEFI tables and protocols, the parts the loader calls
//!
//! Layouts are those of UEFI 2.x. Services the loader never
//! calls are kept as `usize` placeholders so the offsets stay right.

use core::ffi::c_void;

pub type Handle = *mut c_void;
pub type Status = usize;
pub type Guid = [u8; 16];

// ═══════════════════════════════════════════════════════════════════════════
// STATUS CODES
// ═══════════════════════════════════════════════════════════════════════════

pub const EFI_SUCCESS: Status = 0;
const EFI_ERROR_BIT: Status = 1 << (usize::BITS - 1);
pub const EFI_LOAD_ERROR: Status = EFI_ERROR_BIT | 1;
pub const EFI_INVALID_PARAMETER: Status = EFI_ERROR_BIT | 2;
pub const EFI_UNSUPPORTED: Status = EFI_ERROR_BIT | 3;
pub const EFI_BAD_BUFFER_SIZE: Status = EFI_ERROR_BIT | 4;
pub const EFI_BUFFER_TOO_SMALL: Status = EFI_ERROR_BIT | 5;
pub const EFI_NOT_READY: Status = EFI_ERROR_BIT | 6;
pub const EFI_DEVICE_ERROR: Status = EFI_ERROR_BIT | 7;
pub const EFI_OUT_OF_RESOURCES: Status = EFI_ERROR_BIT | 9;
pub const EFI_NO_MEDIA: Status = EFI_ERROR_BIT | 12;
pub const EFI_MEDIA_CHANGED: Status = EFI_ERROR_BIT | 13;
pub const EFI_NOT_FOUND: Status = EFI_ERROR_BIT | 14;
pub const EFI_TIMEOUT: Status = EFI_ERROR_BIT | 18;
pub const EFI_ABORTED: Status = EFI_ERROR_BIT | 21;

// ═══════════════════════════════════════════════════════════════════════════
// GUIDS
// ═══════════════════════════════════════════════════════════════════════════

/// 964E5B21-6459-11D2-8E39-00A0C969723B
pub const EFI_BLOCK_IO_PROTOCOL_GUID: Guid = [
    0x21, 0x5b, 0x4e, 0x96, 0x59, 0x64, 0xd2, 0x11, 0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b,
];

/// 9042A9DE-23DC-4A38-96FB-7ADED080516A
pub const EFI_GRAPHICS_OUTPUT_PROTOCOL_GUID: Guid = [
    0xDE, 0xA9, 0x42, 0x90, 0xDC, 0x23, 0x38, 0x4A, 0x96, 0xFB, 0x7A, 0xDE, 0xD0, 0x80, 0x51, 0x6A,
];

/// 5B1B31A1-9562-11D2-8E3F-00A0C969723B
pub const EFI_LOADED_IMAGE_PROTOCOL_GUID: Guid = [
    0xA1, 0x31, 0x1B, 0x5B, 0x62, 0x95, 0xD2, 0x11, 0x8E, 0x3F, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B,
];

/// 09576E91-6D3F-11D2-8E39-00A0C969723B
pub const EFI_DEVICE_PATH_PROTOCOL_GUID: Guid = [
    0x91, 0x6E, 0x57, 0x09, 0x3F, 0x6D, 0xD2, 0x11, 0x8E, 0x39, 0x00, 0xA0, 0xC9, 0x69, 0x72, 0x3B,
];

// ═══════════════════════════════════════════════════════════════════════════
// SYSTEM TABLE
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
pub struct SystemTable {
    _header: [u8; 24],
    _firmware_vendor: *const u16,
    _firmware_revision: u32,
    _console_in_handle: Handle,
    pub con_in: *mut SimpleTextInputProtocol,
    _console_out_handle: Handle,
    pub con_out: *mut SimpleTextOutputProtocol,
    _stderr_handle: Handle,
    _stderr: *const c_void,
    _runtime_services: *const c_void,
    pub boot_services: *const BootServices,
    _number_of_table_entries: usize,
    _configuration_table: *const c_void,
}

#[repr(C)]
pub struct BootServices {
    _header: [u8; 24],
    // Task Priority Services
    _raise_tpl: usize,
    _restore_tpl: usize,
    // Memory Services
    pub allocate_pages:
        extern "efiapi" fn(allocate_type: usize, memory_type: u32, pages: usize, memory: *mut u64) -> Status,
    pub free_pages: extern "efiapi" fn(memory: u64, pages: usize) -> Status,
    pub get_memory_map: extern "efiapi" fn(
        memory_map_size: *mut usize,
        memory_map: *mut u8,
        map_key: *mut usize,
        descriptor_size: *mut usize,
        descriptor_version: *mut u32,
    ) -> Status,
    _allocate_pool: usize,
    _free_pool: usize,
    // Event & Timer Services
    _create_event: usize,
    _set_timer: usize,
    _wait_for_event: usize,
    _signal_event: usize,
    _close_event: usize,
    _check_event: usize,
    // Protocol Handler Services
    _install_protocol_interface: usize,
    _reinstall_protocol_interface: usize,
    _uninstall_protocol_interface: usize,
    pub handle_protocol:
        extern "efiapi" fn(handle: Handle, protocol: *const Guid, interface: *mut *mut c_void) -> Status,
    _reserved: usize,
    _register_protocol_notify: usize,
    pub locate_handle: extern "efiapi" fn(
        search_type: usize,
        protocol: *const Guid,
        search_key: *const c_void,
        buffer_size: *mut usize,
        buffer: *mut Handle,
    ) -> Status,
    _locate_device_path: usize,
    _install_configuration_table: usize,
    // Image Services
    _load_image: usize,
    _start_image: usize,
    _exit: usize,
    _unload_image: usize,
    pub exit_boot_services: extern "efiapi" fn(image_handle: Handle, map_key: usize) -> Status,
    // Miscellaneous Services
    _get_next_monotonic_count: usize,
    /// Stall for microseconds
    pub stall: extern "efiapi" fn(microseconds: usize) -> Status,
    /// Disable/set watchdog timer (timeout in seconds, 0 = disable)
    pub set_watchdog_timer: extern "efiapi" fn(
        timeout: usize,
        watchdog_code: u64,
        data_size: usize,
        watchdog_data: *const u16,
    ) -> Status,
    // Driver Support Services
    _connect_controller: usize,
    _disconnect_controller: usize,
    // Open/Close Protocol Services
    _open_protocol: usize,
    _close_protocol: usize,
    _open_protocol_information: usize,
    // Library Services
    _protocols_per_handle: usize,
    _locate_handle_buffer: usize,
    pub locate_protocol:
        extern "efiapi" fn(protocol: *const Guid, registration: *const c_void, interface: *mut *mut c_void) -> Status,
}

/// `LocateHandle` search type
pub const BY_PROTOCOL: usize = 2;

/// `AllocatePages` allocation types
pub const ALLOCATE_ANY_PAGES: usize = 0;
pub const ALLOCATE_ADDRESS: usize = 2;

/// Memory types the loader deals in
pub const EFI_LOADER_DATA: u32 = 2;
pub const EFI_CONVENTIONAL_MEMORY: u32 = 7;

// ═══════════════════════════════════════════════════════════════════════════
// CONSOLE
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InputKey {
    pub scan_code: u16,
    pub unicode_char: u16,
}

#[repr(C)]
pub struct SimpleTextInputProtocol {
    _reset: usize,
    pub read_key_stroke: extern "efiapi" fn(*mut SimpleTextInputProtocol, *mut InputKey) -> Status,
}

#[repr(C)]
pub struct SimpleTextOutputProtocol {
    _reset: usize,
    pub output_string: extern "efiapi" fn(*mut SimpleTextOutputProtocol, *const u16) -> Status,
    _test_string: usize,
    _query_mode: usize,
    _set_mode: usize,
    _set_attribute: usize,
    pub clear_screen: extern "efiapi" fn(*mut SimpleTextOutputProtocol) -> Status,
    _set_cursor_position: usize,
    _enable_cursor: usize,
    _mode: *const c_void,
}

// ═══════════════════════════════════════════════════════════════════════════
// BLOCK I/O
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
pub struct BlockIoProtocol {
    pub revision: u64,
    pub media: *const BlockIoMedia,
    _reset: usize,
    pub read_blocks: extern "efiapi" fn(
        *mut BlockIoProtocol,
        u32,     // MediaId
        u64,     // LBA
        usize,   // BufferSize
        *mut u8, // Buffer
    ) -> Status,
    _write_blocks: usize,
    _flush_blocks: usize,
}

#[repr(C)]
pub struct BlockIoMedia {
    pub media_id: u32,
    pub removable_media: bool,
    pub media_present: bool,
    pub logical_partition: bool,
    pub read_only: bool,
    pub write_caching: bool,
    pub block_size: u32,
    pub io_align: u32,
    pub last_block: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// IMAGES AND DEVICE PATHS
// ═══════════════════════════════════════════════════════════════════════════

/// Leading fields of `EFI_LOADED_IMAGE_PROTOCOL`
#[repr(C)]
pub struct LoadedImageProtocol {
    pub revision: u32,
    pub parent_handle: Handle,
    pub system_table: *const SystemTable,
    pub device_handle: Handle,
}

/// Generic device path node header
#[repr(C)]
pub struct DevicePathNode {
    pub kind: u8,
    pub sub_kind: u8,
    pub length: [u8; 2],
}

pub const END_OF_PATH: u8 = 0x7F;

// ═══════════════════════════════════════════════════════════════════════════
// GRAPHICS OUTPUT PROTOCOL (GOP)
// ═══════════════════════════════════════════════════════════════════════════

/// GOP Pixel Format
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopPixelFormat {
    /// Red-Green-Blue-Reserved 8-bits per color
    Rgbx = 0,
    /// Blue-Green-Red-Reserved 8-bits per color
    Bgrx = 1,
    /// Pixel format defined by pixel bitmask
    BitMask = 2,
    /// No direct framebuffer access
    BltOnly = 3,
}

#[repr(C)]
pub struct GopModeInfo {
    pub version: u32,
    pub horizontal_resolution: u32,
    pub vertical_resolution: u32,
    pub pixel_format: GopPixelFormat,
    pub pixel_information: [u32; 4],
    pub pixels_per_scan_line: u32,
}

#[repr(C)]
pub struct GopMode {
    pub max_mode: u32,
    pub mode: u32,
    pub info: *const GopModeInfo,
    pub size_of_info: usize,
    pub frame_buffer_base: u64,
    pub frame_buffer_size: usize,
}

#[repr(C)]
pub struct GraphicsOutputProtocol {
    _query_mode: usize,
    _set_mode: usize,
    _blt: usize,
    pub mode: *mut GopMode,
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY MAP
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub kind: u32,
    _pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

impl MemoryDescriptor {
    pub fn end(&self) -> u64 {
        self.physical_start + self.number_of_pages * 4096
    }
}
