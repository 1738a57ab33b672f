//! LAOS core library
//!
//! The platform-independent half of the boot loader: memory bookkeeping,
//! the device registry, partition tables and filesystems, the gzip shim,
//! the ELF loader, the page-table builder and the boot pipeline that ties
//! them together. Firmware back ends live in the `laos-bootloader` crate
//! and plug in through [`platform::Platform`].

#![no_std]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

pub mod bootinfo;
pub mod config;
pub mod decompress;
pub mod disk;
pub mod elf;
pub mod error;
pub mod fs;
pub mod logger;
pub mod memory;
pub mod mmu;
pub mod partition;
pub mod pipeline;
pub mod platform;

pub use error::{Error, Result};

/// Base page size.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Like [`align_up`], but `None` when the result does not fit in a `u64`.
#[inline]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
