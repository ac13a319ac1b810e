// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side stand-ins for the hardware.
//!
//! Simulated state is per-thread, so each test gets a freshly reset machine.
//! Time is measured in core clock cycles and only moves when the code under
//! test sleeps ([`wait_for_event`]) or a test burns cycles explicitly
//! ([`burn_cycles`]); SysTick interrupts are delivered synchronously at the
//! point where time crosses a tick boundary.

use std::cell::{Cell, RefCell};

use crate::clock::{
    self, ClockRegisters, ClockSource, ACR_LATENCY, ACR_PRFTBE, CFGR_PLLMUL,
    CFGR_PLLSRC, CFGR_PLLXTPRE, CFGR_SW, CFGR_SWS, CFGR_SWS_SHIFT, CR_HSEBYP,
    CR_HSEON, CR_HSERDY, CR_HSION, CR_HSIRDY, CR_PLLON, CR_PLLRDY,
};
use crate::vectors::{Vector, VectorTable};

const CR_READY_FLAGS: u32 = CR_HSIRDY | CR_HSERDY | CR_PLLRDY;
const CFGR_PLL_FIELDS: u32 = CFGR_PLLSRC | CFGR_PLLXTPRE | CFGR_PLLMUL;

/// Reset value of RCC_CR: HSI on and ready, trim at its midpoint.
const CR_RESET: u32 = 0x0000_0083;
/// Reset value of FLASH_ACR: zero wait states, prefetch enabled and active.
const ACR_RESET: u32 = 0x0000_0030;

/// Polls before HSE reports ready, unless told otherwise.
const DEFAULT_HSE_STARTUP: u32 = 3;
/// Polls before the PLL reports lock, unless told otherwise.
const DEFAULT_PLL_LOCK: u32 = 5;

/// A point where SYSCLK or the flash latency changed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SysclkChange {
    pub sysclk_hz: u32,
    pub wait_states: u8,
}

/// Simulated RCC and flash interface.
///
/// Beyond modelling oscillator start-up and the delayed SYSCLK switch, the
/// fake panics when software does something the real part would punish:
///
/// - changing PLL source or multiplier while the PLL is on;
/// - turning off the oscillator (or PLL) that currently drives SYSCLK;
/// - touching HSEBYP while HSE is on;
/// - running SYSCLK faster than the programmed flash wait states allow,
///   whether by switching sources or by lowering the latency.
pub struct FakeRcc {
    cr: Cell<u32>,
    cfgr: Cell<u32>,
    cir: Cell<u32>,
    acr: Cell<u32>,
    hse_startup: Option<u32>,
    pll_lock: Option<u32>,
    hse_countdown: Cell<u32>,
    pll_countdown: Cell<u32>,
    history: RefCell<Vec<SysclkChange>>,
}

impl FakeRcc {
    pub fn at_reset() -> Self {
        Self {
            cr: Cell::new(CR_RESET),
            cfgr: Cell::new(0),
            cir: Cell::new(0),
            acr: Cell::new(ACR_RESET),
            hse_startup: Some(DEFAULT_HSE_STARTUP),
            pll_lock: Some(DEFAULT_PLL_LOCK),
            hse_countdown: Cell::new(0),
            pll_countdown: Cell::new(0),
            history: RefCell::new(Vec::new()),
        }
    }

    /// Number of CR reads after HSEON before HSERDY appears; `None` means
    /// the crystal never starts.
    pub fn with_hse_startup(mut self, polls: Option<u32>) -> Self {
        self.hse_startup = polls;
        self
    }

    /// Number of CR reads after PLLON before PLLRDY appears; `None` means
    /// the PLL never locks.
    pub fn with_pll_lock(mut self, polls: Option<u32>) -> Self {
        self.pll_lock = polls;
        self
    }

    pub fn cir(&self) -> u32 {
        self.cir.get()
    }

    /// Every SYSCLK switch and flash latency write, oldest first.
    pub fn history(&self) -> Vec<SysclkChange> {
        self.history.borrow().clone()
    }

    fn active_source(&self) -> ClockSource {
        ClockSource::from_cfgr(self.cfgr.get())
    }

    fn sysclk_hz(&self) -> u32 {
        let cfgr = self.cfgr.get();
        ClockSource::from_cfgr(cfgr).sysclk_hz(cfgr)
    }

    fn wait_states(&self) -> u8 {
        (self.acr.get() & ACR_LATENCY) as u8
    }

    fn check_flash(&self, what: &str) {
        let (hz, ws) = (self.sysclk_hz(), self.wait_states());
        if !clock::wait_states_sufficient(ws, hz) {
            panic!("{what}: SYSCLK {hz} Hz with {ws} flash wait states");
        }
        self.history.borrow_mut().push(SysclkChange {
            sysclk_hz: hz,
            wait_states: ws,
        });
    }

    /// Lets oscillators make progress; called on every CR read, since that's
    /// how software polls them.
    fn step_oscillators(&self) {
        let mut cr = self.cr.get();

        if cr & CR_HSEON != 0
            && cr & CR_HSERDY == 0
            && self.hse_startup.is_some()
        {
            match self.hse_countdown.get() {
                0 => cr |= CR_HSERDY,
                n => self.hse_countdown.set(n - 1),
            }
        }

        let pll_input_ready = if self.cfgr.get() & CFGR_PLLSRC != 0 {
            cr & CR_HSERDY != 0
        } else {
            cr & CR_HSIRDY != 0
        };
        if cr & CR_PLLON != 0
            && cr & CR_PLLRDY == 0
            && pll_input_ready
            && self.pll_lock.is_some()
        {
            match self.pll_countdown.get() {
                0 => cr |= CR_PLLRDY,
                n => self.pll_countdown.set(n - 1),
            }
        }

        self.cr.set(cr);
    }

    fn source_ready(&self, sw: u32) -> bool {
        let cr = self.cr.get();
        match sw {
            0b00 => cr & CR_HSIRDY != 0,
            0b01 => cr & CR_HSERDY != 0,
            0b10 => cr & CR_PLLRDY != 0,
            _ => false,
        }
    }
}

impl ClockRegisters for FakeRcc {
    fn cr(&self) -> u32 {
        self.step_oscillators();
        self.cr.get()
    }

    fn set_cr(&mut self, value: u32) {
        let old = self.cr.get();
        let turned_on = value & !old;
        let turned_off = old & !value;
        let active = self.active_source();

        if turned_off & CR_HSION != 0 && active == ClockSource::Internal {
            panic!("HSI turned off while driving SYSCLK");
        }
        if turned_off & CR_HSEON != 0 && active.uses_external() {
            panic!("HSE turned off while driving SYSCLK");
        }
        if turned_off & CR_PLLON != 0 && active.is_pll() {
            panic!("PLL turned off while driving SYSCLK");
        }
        if (turned_on | turned_off) & CR_HSEBYP != 0 && old & CR_HSEON != 0 {
            panic!("HSEBYP written with HSE enabled");
        }

        let mut cr = (value & !CR_READY_FLAGS) | (old & CR_READY_FLAGS);
        if value & CR_HSION == 0 {
            cr &= !CR_HSIRDY;
        } else if turned_on & CR_HSION != 0 {
            cr |= CR_HSIRDY;
        }
        if value & CR_HSEON == 0 {
            cr &= !CR_HSERDY;
        } else if turned_on & CR_HSEON != 0 {
            self.hse_countdown.set(self.hse_startup.unwrap_or(0));
        }
        if value & CR_PLLON == 0 {
            cr &= !CR_PLLRDY;
        } else if turned_on & CR_PLLON != 0 {
            self.pll_countdown.set(self.pll_lock.unwrap_or(0));
        }
        self.cr.set(cr);
    }

    fn cfgr(&self) -> u32 {
        let cfgr = self.cfgr.get();
        let sw = cfgr & CFGR_SW;
        let sws = (cfgr & CFGR_SWS) >> CFGR_SWS_SHIFT;
        if sw != sws && self.source_ready(sw) {
            self.cfgr.set((cfgr & !CFGR_SWS) | (sw << CFGR_SWS_SHIFT));
            self.check_flash("SYSCLK switch");
        }
        self.cfgr.get()
    }

    fn set_cfgr(&mut self, value: u32) {
        let old = self.cfgr.get();
        if self.cr.get() & CR_PLLON != 0 && (old ^ value) & CFGR_PLL_FIELDS != 0
        {
            panic!("PLL reconfigured while enabled");
        }
        self.cfgr.set((value & !CFGR_SWS) | (old & CFGR_SWS));
    }

    fn set_cir(&mut self, value: u32) {
        self.cir.set(value);
    }

    fn flash_acr(&self) -> u32 {
        self.acr.get()
    }

    fn set_flash_acr(&mut self, value: u32) {
        // Only latency and the prefetch enable are writable here.
        let keep = self.acr.get() & !(ACR_LATENCY | ACR_PRFTBE);
        self.acr.set(keep | (value & (ACR_LATENCY | ACR_PRFTBE)));
        self.check_flash("flash latency write");
    }
}

/// The clock tree registers of the simulated machine, fresh from reset. Like
/// the real ones, they can be taken once per machine.
pub fn take_clock_registers() -> Option<FakeRcc> {
    if CLOCK_REGISTERS_TAKEN.with(|t| t.replace(true)) {
        None
    } else {
        Some(FakeRcc::at_reset())
    }
}

struct SysTick {
    cycles: u64,
    reload: Option<u32>,
    next_tick: u64,
    spurious_wakeups: u32,
}

thread_local! {
    static SYSTICK: RefCell<SysTick> = const {
        RefCell::new(SysTick {
            cycles: 0,
            reload: None,
            next_tick: 0,
            spurious_wakeups: 0,
        })
    };
    static ACTIVE_VECTOR: Cell<Option<Vector>> = const { Cell::new(None) };
    static CLOCK_REGISTERS_TAKEN: Cell<bool> = const { Cell::new(false) };
}

/// Starts the simulated SysTick: one interrupt every `reload` cycles,
/// starting `reload` cycles from now.
pub fn arm_tick(reload: u32) {
    SYSTICK.with(|s| {
        let mut s = s.borrow_mut();
        s.reload = Some(reload);
        s.next_tick = s.cycles + u64::from(reload);
    });
}

/// Sleeps until the next event. Queued spurious wakeups are consumed first
/// and return without time passing; otherwise time jumps to the next tick,
/// which is delivered before returning.
pub fn wait_for_event() {
    let fire = SYSTICK.with(|s| {
        let mut s = s.borrow_mut();
        if s.spurious_wakeups > 0 {
            s.spurious_wakeups -= 1;
            return false;
        }
        let Some(reload) = s.reload else {
            panic!("WFE with no tick armed would sleep forever");
        };
        s.cycles = s.next_tick;
        s.next_tick += u64::from(reload);
        true
    });
    if fire {
        crate::beat::tick_isr();
    }
}

/// Lets `cycles` core cycles pass, delivering any ticks that fall due.
pub fn burn_cycles(cycles: u64) {
    let ticks = SYSTICK.with(|s| {
        let mut s = s.borrow_mut();
        s.cycles += cycles;
        let mut ticks = 0;
        if let Some(reload) = s.reload {
            while s.next_tick <= s.cycles {
                s.next_tick += u64::from(reload);
                ticks += 1;
            }
        }
        ticks
    });
    for _ in 0..ticks {
        crate::beat::tick_isr();
    }
}

/// Makes the next `n` calls to [`wait_for_event`] return without an event.
pub fn queue_spurious_wakeups(n: u32) {
    SYSTICK.with(|s| s.borrow_mut().spurious_wakeups += n);
}

/// Core cycles elapsed on this thread's simulated machine.
pub fn cycles() -> u64 {
    SYSTICK.with(|s| s.borrow().cycles)
}

/// The reload value SysTick was last armed with.
pub fn tick_reload() -> Option<u32> {
    SYSTICK.with(|s| s.borrow().reload)
}

/// Vector currently being serviced, if any.
pub fn active_vector() -> Option<Vector> {
    ACTIVE_VECTOR.with(Cell::get)
}

/// Takes the exception `vector` through `table`, the way the NVIC would.
///
/// # Safety
///
/// This runs whatever handler is installed, with the same obligations as
/// the hardware doing so.
pub unsafe fn dispatch<const IRQS: usize>(
    table: &VectorTable<IRQS>,
    vector: Vector,
) {
    let Some(handler) = table.handler(vector) else {
        panic!("vector {} is reserved", vector.number());
    };
    let outer = ACTIVE_VECTOR.with(|a| a.replace(Some(vector)));
    // On the host `fail::die` unwinds, which can't cross the C ABI of
    // `trap`; go around it.
    if handler as usize == crate::vectors::trap as usize {
        crate::vectors::unhandled();
    }
    unsafe { handler() };
    ACTIVE_VECTOR.with(|a| a.set(outer));
}
