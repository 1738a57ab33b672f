//! Firmware text console
//!
//! `ConOut` takes NUL-terminated UTF-16. Text is converted in small
//! stack chunks so printing never allocates. Once boot services are gone
//! the protocol may not be called at all, so writes are dropped.

use core::sync::atomic::{AtomicBool, Ordering};

use laos_core::platform::Console;

use super::tables::SimpleTextOutputProtocol;

const CHUNK: usize = 126;

pub struct UefiConsole {
    out: *mut SimpleTextOutputProtocol,
    exited: AtomicBool,
}

// SAFETY: the loader runs on the boot processor only.
unsafe impl Sync for UefiConsole {}
unsafe impl Send for UefiConsole {}

impl UefiConsole {
    pub const fn new(out: *mut SimpleTextOutputProtocol) -> Self {
        Self {
            out,
            exited: AtomicBool::new(false),
        }
    }

    /// Boot services are gone; `ConOut` must not be touched again.
    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        if self.out.is_null() || self.exited.load(Ordering::Acquire) {
            return;
        }
        // SAFETY: checked above; the firmware owns the protocol.
        unsafe { ((*self.out).clear_screen)(self.out) };
    }

    fn flush(&self, buf: &mut [u16; CHUNK + 4], len: usize) {
        buf[len] = 0;
        // SAFETY: NUL-terminated and the protocol is live (checked by caller).
        unsafe { ((*self.out).output_string)(self.out, buf.as_ptr()) };
    }
}

impl Console for UefiConsole {
    fn write_str(&self, s: &str) {
        if self.out.is_null() || self.exited.load(Ordering::Acquire) {
            return;
        }
        let mut buf = [0u16; CHUNK + 4];
        let mut len = 0;
        for ch in s.chars() {
            if ch == '\n' {
                buf[len] = u16::from(b'\r');
                len += 1;
            }
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                buf[len] = *unit;
                len += 1;
            }
            if len >= CHUNK {
                self.flush(&mut buf, len);
                len = 0;
            }
        }
        if len > 0 {
            self.flush(&mut buf, len);
        }
    }
}
