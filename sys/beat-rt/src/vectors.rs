// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The exception and interrupt vector table.
//!
//! The M-profile vector table is an array of words: the initial stack
//! pointer, the reset handler, 14 more architectural exception slots (five of
//! them reserved and required to be zero), then one slot per device
//! interrupt. [`VectorTable`] has exactly that layout, and is built in a
//! `const` context so that the application can place it in flash:
//!
//! ```ignore
//! extern "C" {
//!     static _stack_top: u32;
//! }
//!
//! #[link_section = ".vector_table"]
//! #[used]
//! static VECTORS: DeviceVectorTable = VectorTable::new(
//!     unsafe { core::ptr::addr_of!(_stack_top) },
//!     beat_rt::startup::Reset,
//! )
//! .with_interrupt(Interrupt::Tim2, on_tim2);
//! ```
//!
//! Every slot that isn't explicitly given a handler goes to [`trap`], which
//! records what happened and halts. The SysTick slot comes pre-wired to the
//! beat scheduler's tick handler.

use core::fmt;

use crate::arch;
use crate::beat;
use crate::device::{Interrupt, IRQ_COUNT};
use crate::fail;

/// Interrupt and exception handler.
pub type Handler = unsafe extern "C" fn();

/// Reset handler; never returns.
pub type ResetHandler = unsafe extern "C" fn() -> !;

/// Number of architectural slots, including the initial stack pointer and
/// reset.
pub const EXCEPTION_SLOTS: usize = 16;

/// Architectural exceptions that can be given a handler. Discriminants are
/// vector numbers; reserved numbers have no variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Exception {
    Nmi = 2,
    HardFault = 3,
    MemManage = 4,
    BusFault = 5,
    UsageFault = 6,
    SvCall = 11,
    DebugMonitor = 12,
    PendSv = 14,
    SysTick = 15,
}

impl Exception {
    pub fn from_number(n: usize) -> Option<Self> {
        Some(match n {
            2 => Exception::Nmi,
            3 => Exception::HardFault,
            4 => Exception::MemManage,
            5 => Exception::BusFault,
            6 => Exception::UsageFault,
            11 => Exception::SvCall,
            12 => Exception::DebugMonitor,
            14 => Exception::PendSv,
            15 => Exception::SysTick,
            _ => return None,
        })
    }
}

/// Anything that can be taken through the table (other than reset).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Vector {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl Vector {
    /// Position in the table, as reported in IPSR.
    pub const fn number(self) -> usize {
        match self {
            Vector::Exception(e) => e as usize,
            Vector::Interrupt(i) => EXCEPTION_SLOTS + i.irqn(),
        }
    }

    pub fn from_number(n: usize) -> Option<Self> {
        match n.checked_sub(EXCEPTION_SLOTS) {
            Some(irqn) => Interrupt::from_irqn(irqn).map(Vector::Interrupt),
            None => Exception::from_number(n).map(Vector::Exception),
        }
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vector::Exception(e) => write!(f, "exception {e:?}"),
            Vector::Interrupt(i) => write!(f, "IRQ {} ({i:?})", i.irqn()),
        }
    }
}

/// Vector table with `IRQS` device interrupt slots.
#[repr(C)]
pub struct VectorTable<const IRQS: usize> {
    initial_stack: *const u32,
    reset: ResetHandler,
    /// Slots 2 through 15. `None` encodes as zero, which is what reserved
    /// slots must contain.
    exceptions: [Option<Handler>; EXCEPTION_SLOTS - 2],
    interrupts: [Option<Handler>; IRQS],
}

/// The table for the STM32F103.
pub type DeviceVectorTable = VectorTable<IRQ_COUNT>;

static_assertions::const_assert_eq!(
    core::mem::size_of::<DeviceVectorTable>(),
    core::mem::size_of::<usize>() * (EXCEPTION_SLOTS + IRQ_COUNT)
);

// Safety: the table is immutable after construction and the stack pointer
// it holds is only ever read by the hardware.
unsafe impl<const IRQS: usize> Sync for VectorTable<IRQS> {}

const RESERVED: [usize; 5] = [7, 8, 9, 10, 13];

impl<const IRQS: usize> VectorTable<IRQS> {
    /// A table with every slot sent to [`trap`], except SysTick, which drives
    /// the beat counter.
    pub const fn new(initial_stack: *const u32, reset: ResetHandler) -> Self {
        let mut exceptions: [Option<Handler>; EXCEPTION_SLOTS - 2] =
            [Some(trap as Handler); EXCEPTION_SLOTS - 2];
        let mut i = 0;
        while i < RESERVED.len() {
            exceptions[RESERVED[i] - 2] = None;
            i += 1;
        }
        exceptions[Exception::SysTick as usize - 2] =
            Some(beat::tick_isr as Handler);

        Self {
            initial_stack,
            reset,
            exceptions,
            interrupts: [Some(trap as Handler); IRQS],
        }
    }

    pub const fn with_exception(
        mut self,
        exception: Exception,
        handler: Handler,
    ) -> Self {
        self.exceptions[exception as usize - 2] = Some(handler);
        self
    }

    /// Installs `handler` for `irq`. Using an interrupt beyond `IRQS` fails
    /// const evaluation.
    pub const fn with_interrupt(
        mut self,
        irq: Interrupt,
        handler: Handler,
    ) -> Self {
        self.interrupts[irq.irqn()] = Some(handler);
        self
    }

    pub fn initial_stack(&self) -> *const u32 {
        self.initial_stack
    }

    pub fn reset_handler(&self) -> ResetHandler {
        self.reset
    }

    /// The handler the hardware would run for `vector`; `None` only for
    /// interrupts beyond this table's size.
    pub fn handler(&self, vector: Vector) -> Option<Handler> {
        match vector {
            Vector::Exception(e) => self.exceptions[e as usize - 2],
            Vector::Interrupt(i) => {
                self.interrupts.get(i.irqn()).copied().flatten()
            }
        }
    }

    /// Raw contents of slot `n` as the hardware sees them, `0` for reserved
    /// slots.
    pub fn slot(&self, n: usize) -> Option<usize> {
        match n {
            0 => Some(self.initial_stack as usize),
            1 => Some(self.reset as usize),
            n if n < EXCEPTION_SLOTS => {
                Some(self.exceptions[n - 2].map_or(0, |h| h as usize))
            }
            _ => self
                .interrupts
                .get(n - EXCEPTION_SLOTS)
                .map(|h| h.map_or(0, |h| h as usize)),
        }
    }

    pub const fn len(&self) -> usize {
        EXCEPTION_SLOTS + IRQS
    }

    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Reported when a vector nobody claimed is taken.
struct Unhandled(Option<Vector>);

impl fmt::Display for Unhandled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "unhandled {v}"),
            None => f.write_str("unhandled exception"),
        }
    }
}

/// Default handler for every slot without one. Records the vector in the
/// failure epitaph and halts; there is no way back.
pub unsafe extern "C" fn trap() {
    unhandled()
}

pub(crate) fn unhandled() -> ! {
    fail::die(Unhandled(arch::active_vector()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;

    const STACK: *const u32 = 0x2000_5000 as *const u32;

    unsafe extern "C" fn fake_reset() -> ! {
        panic!("reset")
    }

    unsafe extern "C" fn on_tim2() {}
    unsafe extern "C" fn on_nmi() {}

    static TABLE: DeviceVectorTable = VectorTable::new(STACK, fake_reset)
        .with_interrupt(Interrupt::Tim2, on_tim2)
        .with_exception(Exception::Nmi, on_nmi);

    #[test]
    fn layout() {
        assert_eq!(TABLE.len(), 59);
        assert_eq!(TABLE.slot(0), Some(0x2000_5000));
        assert_eq!(TABLE.slot(1), Some(fake_reset as usize));
        for n in RESERVED {
            assert_eq!(TABLE.slot(n), Some(0), "slot {n}");
        }
        assert_eq!(TABLE.slot(15), Some(beat::tick_isr as usize));
        assert_eq!(TABLE.slot(16 + 28), Some(on_tim2 as usize));
        assert_eq!(TABLE.slot(59), None);

        // The table is the slots, in order, and nothing else.
        let words = unsafe {
            core::slice::from_raw_parts(
                &TABLE as *const DeviceVectorTable as *const usize,
                TABLE.len(),
            )
        };
        for (n, word) in words.iter().enumerate() {
            assert_eq!(Some(*word), TABLE.slot(n), "slot {n}");
        }
    }

    #[test]
    fn unclaimed_slots_trap() {
        for n in 2..TABLE.len() {
            let Some(v) = Vector::from_number(n) else {
                assert!(RESERVED.contains(&n));
                continue;
            };
            let expected = match v {
                Vector::Exception(Exception::SysTick) => {
                    beat::tick_isr as usize
                }
                Vector::Exception(Exception::Nmi) => on_nmi as usize,
                Vector::Interrupt(Interrupt::Tim2) => on_tim2 as usize,
                _ => trap as usize,
            };
            let installed = TABLE.handler(v).map(|h| h as usize);
            assert_eq!(installed, Some(expected), "{v}");
        }
    }

    #[test]
    fn vector_numbers() {
        assert_eq!(Vector::Exception(Exception::HardFault).number(), 3);
        assert_eq!(Vector::Interrupt(Interrupt::Wwdg).number(), 16);
        assert_eq!(
            Vector::from_number(46),
            Some(Vector::Interrupt(Interrupt::Tim4))
        );
        assert_eq!(Vector::from_number(0), None);
        assert_eq!(Vector::from_number(1), None);
        assert_eq!(Vector::from_number(13), None);
        assert_eq!(Vector::from_number(59), None);
    }

    #[test]
    fn overridden_handler_runs() {
        unsafe { arch::dispatch(&TABLE, Vector::Interrupt(Interrupt::Tim2)) };
        assert_eq!(arch::active_vector(), None);
    }

    #[test]
    fn systick_slot_advances_beat() {
        let before = beat::now();
        let systick = Vector::Exception(Exception::SysTick);
        unsafe { arch::dispatch(&TABLE, systick) };
        assert_eq!(beat::now(), before + 1);
    }

    #[test]
    #[should_panic(expected = "unhandled IRQ 30 (Tim4)")]
    fn unhandled_interrupt_halts() {
        unsafe { arch::dispatch(&TABLE, Vector::Interrupt(Interrupt::Tim4)) };
    }

    #[test]
    fn unhandled_exception_leaves_table_alone() {
        let before: Vec<_> = (0..TABLE.len()).map(|n| TABLE.slot(n)).collect();
        let result = std::panic::catch_unwind(|| unsafe {
            arch::dispatch(&TABLE, Vector::Exception(Exception::HardFault))
        });
        let msg = result.unwrap_err();
        let msg = msg.downcast_ref::<String>().unwrap();
        assert!(msg.contains("unhandled exception HardFault"), "{msg}");

        let after: Vec<_> = (0..TABLE.len()).map(|n| TABLE.slot(n)).collect();
        assert_eq!(before, after);
    }
}
