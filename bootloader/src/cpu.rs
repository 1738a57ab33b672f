//! Port I/O, CPUID bits and the final halt

use core::arch::asm;

#[cfg(target_arch = "x86")]
use core::arch::x86::__cpuid;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::__cpuid;

/// # Safety
/// Port reads can have device side effects.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags));
    value
}

/// # Safety
/// Port writes program hardware.
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

/// EDX of the extended feature leaf, zero when the CPU lacks it.
fn extended_features() -> u32 {
    // SAFETY: CPUID is available on every CPU this loader runs on.
    let max = unsafe { __cpuid(0x8000_0000) }.eax;
    if max < 0x8000_0001 {
        return 0;
    }
    // SAFETY: as above, leaf checked.
    unsafe { __cpuid(0x8000_0001) }.edx
}

/// 1 GiB pages (CPUID 8000_0001h EDX bit 26).
pub fn has_huge_pages() -> bool {
    extended_features() & (1 << 26) != 0
}

/// Execute-disable (CPUID 8000_0001h EDX bit 20).
pub fn has_no_execute() -> bool {
    extended_features() & (1 << 20) != 0
}

pub fn halt() -> ! {
    loop {
        // SAFETY: nothing is left to run.
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
