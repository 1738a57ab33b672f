//! Calls into real-mode BIOS services
//!
//! The loader runs in flat 32-bit protected mode. A small thunk copied to
//! low memory drops to real mode, issues the interrupt and comes back.
//! Registers travel through a fixed block below the thunk.
//!
//! ```text
//! 0x0D00  real-mode stack top
//! 0x0E00  register block (Regs)
//! 0x0E40  disk address packet
//! 0x0F00  scratch (E820 entry, EDD parameters)
//! 0x1000  thunk
//! 0x2000  bounce buffer, 32 KiB
//! ```

use core::ptr;

use spin::Mutex;

pub const REGS_ADDR: usize = 0x0E00;
pub const DAP_ADDR: usize = 0x0E40;
pub const SCRATCH_ADDR: usize = 0x0F00;
pub const THUNK_ADDR: usize = 0x1000;
pub const BOUNCE_ADDR: usize = 0x2000;
pub const BOUNCE_SIZE: usize = 0x8000;

/// Everything up to here belongs to the loader while it runs.
pub const LOW_AREA_END: u64 = (BOUNCE_ADDR + BOUNCE_SIZE) as u64;

const FLAG_CARRY: u32 = 1 << 0;
const FLAG_ZERO: u32 = 1 << 6;

static THUNK: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/thunk.bin"));

/// Serialises use of the fixed low-memory blocks.
static BIOS_LOCK: Mutex<()> = Mutex::new(());

/// Register image exchanged with the thunk.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Regs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eflags: u32,
    pub ds: u16,
    pub es: u16,
}

impl Regs {
    pub fn carry(&self) -> bool {
        self.eflags & FLAG_CARRY != 0
    }

    pub fn zero(&self) -> bool {
        self.eflags & FLAG_ZERO != 0
    }

    /// AH of the returned EAX, the usual BIOS status byte.
    pub fn ah(&self) -> u8 {
        (self.eax >> 8) as u8
    }
}

/// Copy the thunk into place.
///
/// # Safety
/// The low 64 KiB must be free for the loader's use.
pub unsafe fn install() {
    ptr::copy_nonoverlapping(THUNK.as_ptr(), THUNK_ADDR as *mut u8, THUNK.len());
}

/// Issue `int vector` with `regs` and read the results back into it.
///
/// # Safety
/// [`install`] must have run; the service must not clobber the thunk
/// or the loader image.
pub unsafe fn call_bios(vector: u8, regs: &mut Regs) {
    let _guard = BIOS_LOCK.lock();
    invoke(vector, regs);
}

unsafe fn invoke(vector: u8, regs: &mut Regs) {
    ptr::write_volatile(REGS_ADDR as *mut Regs, *regs);
    let thunk: extern "C" fn(u32) = core::mem::transmute(THUNK_ADDR);
    thunk(u32::from(vector));
    *regs = ptr::read_volatile(REGS_ADDR as *const Regs);
}

/// Run `f` with the low-memory blocks held, for callers that stage data
/// in the scratch or bounce areas around a BIOS call.
pub fn with_low_memory<R>(f: impl FnOnce(&mut LowMemory) -> R) -> R {
    let _guard = BIOS_LOCK.lock();
    f(&mut LowMemory { _private: () })
}

/// Access to the staging areas while the lock is held.
pub struct LowMemory {
    _private: (),
}

impl LowMemory {
    /// Like [`call_bios`] for a caller that already holds the lock.
    ///
    /// # Safety
    /// As for [`call_bios`].
    pub unsafe fn call(&mut self, vector: u8, regs: &mut Regs) {
        invoke(vector, regs);
    }

    pub fn scratch(&mut self) -> &mut [u8; 0x100] {
        // SAFETY: the lock gives exclusive use of the scratch block.
        unsafe { &mut *(SCRATCH_ADDR as *mut [u8; 0x100]) }
    }

    pub fn dap(&mut self) -> &mut [u8; 0x10] {
        // SAFETY: as above.
        unsafe { &mut *(DAP_ADDR as *mut [u8; 0x10]) }
    }

    pub fn bounce(&mut self) -> &mut [u8; BOUNCE_SIZE] {
        // SAFETY: as above.
        unsafe { &mut *(BOUNCE_ADDR as *mut [u8; BOUNCE_SIZE]) }
    }
}

/// Real-mode segment of a low linear address.
pub const fn segment(addr: usize) -> u16 {
    (addr >> 4) as u16
}

/// Offset of a low linear address within [`segment`].
pub const fn offset(addr: usize) -> u16 {
    (addr & 0xF) as u16
}
