// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fail-stop reporting.
//!
//! Nothing the runtime can detect at run time is recoverable: an interrupt
//! with no handler, a clock that never comes up, a tick rate SysTick can't
//! produce. All of these end up in [`die`], which leaves a note for the
//! debugger and stops the processor.
//!
//! On the target this module defines the following binary interface to
//! debuggers:
//!
//! - `beat_rt::fail::RUNTIME_HAS_FAILED` is a `bool`. It is zero (false)
//!   once `.bss` has been initialized, and set to one (true) when `die` is
//!   reached (either explicitly or as a result of a `panic!`).
//!
//! - `beat_rt::fail::RUNTIME_EPITAPH` is an array of `u8`. `die` writes as
//!   much of the failure reason into it (as UTF-8) as fits, truncating if the
//!   buffer fills. For printing, trim off any trailing NUL bytes.
//!
//! On a hosted target `die` panics instead, with the message prefixed by
//! `runtime halted: `, so that tests can watch the system stop.

use core::fmt::{Display, Write};

#[cfg(target_os = "none")]
use core::sync::atomic::Ordering;

/// Flag that gets set to `true` by all failure reporting functions.
#[cfg(target_os = "none")]
#[used]
static mut RUNTIME_HAS_FAILED: bool = false;

pub const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that stopped the runtime, padded with NULs.
#[cfg(target_os = "none")]
#[used]
static mut RUNTIME_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: we only reach this with interrupts that could race us either
    // disabled or also headed here, and the flag below lets exactly one
    // caller through.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(RUNTIME_HAS_FAILED), true)
    };
    if previous_fail {
        // Failing while failing; writing more would only make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only the single execution that set the flag gets here.
    unsafe { &mut *core::ptr::addr_of_mut!(RUNTIME_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    cortex_m::interrupt::disable();
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    crate::arch::halt()
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    // Run the message through the same truncation the target applies, so
    // tests see what a debugger would.
    let mut buf = [0u8; EPITAPH_LEN];
    let mut writer = Eulogist { dest: &mut buf };
    write!(writer, "{msg}").ok();
    let len = buf.iter().position(|&b| b == 0).unwrap_or(EPITAPH_LEN);
    panic!("runtime halted: {}", String::from_utf8_lossy(&buf[..len]))
}

/// Writes into a fixed buffer, silently dropping whatever doesn't fit.
struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eulogist_truncates() {
        let mut buf = [0u8; 8];
        let mut w = Eulogist { dest: &mut buf };
        write!(w, "clock: {}", 12345).unwrap();
        write!(w, "more").unwrap();
        assert_eq!(&buf, b"clock: 1");
    }

    #[test]
    #[should_panic(expected = "runtime halted: tick rate 0")]
    fn die_reports_message() {
        die(format_args!("tick rate {}", 0))
    }

    #[test]
    fn die_truncates_long_messages() {
        let long = "x".repeat(EPITAPH_LEN * 2);
        let err = std::panic::catch_unwind(|| die(&long)).unwrap_err();
        let msg = err.downcast_ref::<String>().unwrap();
        assert_eq!(msg.len(), "runtime halted: ".len() + EPITAPH_LEN);
    }
}
