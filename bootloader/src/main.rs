//! LAOS boot loader binary
//!
//! Firmware entry points plus the two platform back ends. Each entry
//! point builds its back end, gives it to the core's [`Loader`] and hands
//! control to the menu loop; nothing returns once a kernel is entered.
//!
//! ```text
//! efi_main (x86_64 UEFI)          _start (BIOS stage, 32-bit PM)
//!     │                               │
//!     ├── UefiPlatform::new           ├── BiosPlatform::new
//!     │   (watchdog off, heap,        │   (E820, heap, INT 13h thunk)
//!     │    GOP, claim memory)         │
//!     └──────────────┬────────────────┘
//!                    ▼
//!          Loader::new → initialise → run(AutoMenu)
//! ```

#![no_std]
#![no_main]

extern crate alloc;

mod cpu;
mod heap;

#[cfg(feature = "bios")]
mod bios;
#[cfg(feature = "efi")]
mod uefi;

#[cfg(all(feature = "efi", feature = "bios"))]
compile_error!("the `efi` and `bios` features select different targets; enable one");

use core::panic::PanicInfo;

use laos_core::memory::IdentityMapped;
use laos_core::pipeline::{AutoMenu, Loader};
use laos_core::platform::Platform;
use laos_core::Error;

/// Init, device scan, menu. Returns only when the loader cannot get as
/// far as the menu.
fn start<P: Platform>(platform: P) -> Error {
    // SAFETY: both back ends run with RAM identity mapped up to their
    // ceiling, and the core only touches memory it allocated.
    let phys = unsafe { IdentityMapped::new(platform.physical_ceiling()) };

    let mut loader = match Loader::new(platform, phys) {
        Ok(loader) => loader,
        Err(e) => {
            log::error!("error: {}: platform initialisation", e.kind_name());
            return e;
        }
    };
    if let Err(e) = loader.initialise() {
        log::error!("error: {}: device scan", e.kind_name());
        return e;
    }
    loader.run(&mut AutoMenu::new())
}

#[cfg(feature = "efi")]
#[no_mangle]
pub extern "efiapi" fn efi_main(
    image_handle: uefi::tables::Handle,
    system_table: *const uefi::tables::SystemTable,
) -> usize {
    // SAFETY: called once by firmware with its own handle and table.
    let platform = match unsafe { uefi::UefiPlatform::new(image_handle, system_table) } {
        Ok(platform) => platform,
        Err(status) => return status,
    };
    uefi::status_from_error(start(platform))
}

#[cfg(feature = "bios")]
#[no_mangle]
pub extern "C" fn _start(info: *const bios::StageInfo) -> ! {
    // SAFETY: the stage loader passes a valid hand-over block.
    let info = unsafe { info.read() };
    // SAFETY: entered once, in flat 32-bit protected mode, paging off.
    match unsafe { bios::BiosPlatform::new(&info) } {
        Ok(platform) => {
            start(platform);
        }
        Err(e) => bios::early_error(e),
    }
    cpu::halt()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("panic: {}", info);
    cpu::halt()
}
