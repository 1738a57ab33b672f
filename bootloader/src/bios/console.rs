//! VGA text mode plus COM1
//!
//! Everything is mirrored to the serial port so headless machines and
//! emulators still show the log. Serial writes poll with a bounded wait
//! and give up quietly when no UART answers.

use spin::Mutex;

use laos_core::platform::Console;

use crate::cpu::{inb, outb};

const VGA_BUFFER: usize = 0xB8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;
const ATTRIBUTE: u16 = 0x07 << 8;

const COM1: u16 = 0x3F8;
const COM1_LSR: u16 = COM1 + 5;
const LSR_DATA_READY: u8 = 0x01;
const LSR_TX_EMPTY: u8 = 0x20;

struct Screen {
    row: usize,
    col: usize,
}

impl Screen {
    fn cell(&self, row: usize, col: usize) -> *mut u16 {
        (VGA_BUFFER as *mut u16).wrapping_add(row * WIDTH + col)
    }

    fn clear(&mut self) {
        for i in 0..WIDTH * HEIGHT {
            // SAFETY: inside the text buffer.
            unsafe { self.cell(0, 0).add(i).write_volatile(ATTRIBUTE | u16::from(b' ')) };
        }
        self.row = 0;
        self.col = 0;
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < HEIGHT {
            self.row += 1;
            return;
        }
        // SAFETY: all indices stay inside the text buffer.
        unsafe {
            for i in 0..WIDTH * (HEIGHT - 1) {
                let below = self.cell(0, 0).add(i + WIDTH).read_volatile();
                self.cell(0, 0).add(i).write_volatile(below);
            }
            for col in 0..WIDTH {
                self.cell(HEIGHT - 1, col).write_volatile(ATTRIBUTE | u16::from(b' '));
            }
        }
    }

    fn put(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            byte => {
                let glyph = if byte.is_ascii() && !byte.is_ascii_control() {
                    byte
                } else {
                    b'?'
                };
                // SAFETY: row and col are kept in range.
                unsafe { self.cell(self.row, self.col).write_volatile(ATTRIBUTE | u16::from(glyph)) };
                self.col += 1;
                if self.col == WIDTH {
                    self.newline();
                }
            }
        }
    }
}

/// Write byte to COM1. Bounded wait, gives up after ~100 spins.
fn serial_putc(b: u8) {
    for _ in 0..100 {
        // SAFETY: COM1 registers; reads of LSR have no side effects.
        unsafe {
            if inb(COM1_LSR) & LSR_TX_EMPTY != 0 {
                outb(COM1, b);
                return;
            }
        }
        core::hint::spin_loop();
    }
}

/// A byte waiting on COM1, if any.
pub fn serial_getc() -> Option<u8> {
    // SAFETY: COM1 registers.
    unsafe { (inb(COM1_LSR) & LSR_DATA_READY != 0).then(|| inb(COM1)) }
}

/// 115200 8N1, FIFOs on, interrupts off.
fn serial_init() {
    // SAFETY: standard 16550 programming sequence.
    unsafe {
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x80);
        outb(COM1, 0x01);
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03);
        outb(COM1 + 2, 0xC7);
        outb(COM1 + 4, 0x0B);
    }
}

pub struct BiosConsole {
    screen: Mutex<Screen>,
}

impl BiosConsole {
    const fn new() -> Self {
        Self {
            screen: Mutex::new(Screen { row: 0, col: 0 }),
        }
    }

    /// Program the UART and blank the screen.
    pub fn init(&self) {
        serial_init();
        self.screen.lock().clear();
    }
}

impl Console for BiosConsole {
    fn write_str(&self, s: &str) {
        // A nested write (logger inside a write) goes to serial only.
        let mut screen = self.screen.try_lock();
        for byte in s.bytes() {
            if byte == b'\n' {
                serial_putc(b'\r');
            }
            serial_putc(byte);
            if let Some(screen) = screen.as_mut() {
                screen.put(byte);
            }
        }
    }
}

pub static CONSOLE: BiosConsole = BiosConsole::new();
