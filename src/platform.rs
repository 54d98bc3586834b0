//! Target shims: halting and interrupt-free sections.
//!
//! On the microcontroller these map onto `cortex-m`; on the host they reduce
//! to a panic and a plain call so the same code runs under `cargo test`.

use core::fmt::Display;

/// Stop the firmware. Never returns.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn halt(reason: &dyn Display) -> ! {
    let _ = reason;
    cortex_m::asm::udf()
}

/// Stop the firmware. Never returns.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn halt(reason: &dyn Display) -> ! {
    panic!("firmware halted: {reason}")
}

/// Run `f` with interrupts disabled.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn free<R>(f: impl FnOnce() -> R) -> R {
    cortex_m::interrupt::free(|_| f())
}

/// Run `f` with interrupts disabled.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn free<R>(f: impl FnOnce() -> R) -> R {
    f()
}
