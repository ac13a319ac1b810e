// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The beat scheduler.
//!
//! SysTick is set to interrupt at the rate the application asks for, and the
//! interrupt does nothing but add one to a 64-bit beat counter. The main
//! loop reads the counter, hands the value to the application's `step`, then
//! sleeps until the counter moves. If `step` takes longer than a beat, the
//! beats that went by are not replayed: the next `step` simply sees a bigger
//! number. The values `step` sees therefore always increase, but may skip.
//!
//! The counter is split across two `AtomicU32`s because ARMv7-M has no 64-bit
//! atomics. There is exactly one writer (the tick interrupt, which can't be
//! preempted by the reader), so the writer gets away with plain loads and
//! stores; the reader, which *can* be preempted by the writer, re-reads the
//! high word to detect a carry that happened in the middle of its read.

use core::fmt;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::app::Application;
use crate::arch;
use crate::clock::{ClockRegisters, ClockTree, DerivedClocks};
use crate::fail;
use crate::trace::Trace;

/// SysTick's reload register is 24 bits wide and holds the period minus one.
pub const SYSTICK_MAX_PERIOD: u32 = 1 << 24;

/// A 64-bit count of beats. `words[0]` is the least significant part,
/// `words[1]` the most significant.
pub struct BeatCounter {
    words: [AtomicU32; 2],
}

impl BeatCounter {
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    const fn starting_at(beat: u64) -> Self {
        Self {
            words: [
                AtomicU32::new(beat as u32),
                AtomicU32::new((beat >> 32) as u32),
            ],
        }
    }

    /// Current count. Safe to call from any context.
    pub fn now(&self) -> u64 {
        loop {
            let hi = self.words[1].load(Ordering::Acquire);
            let lo = self.words[0].load(Ordering::Acquire);
            if self.words[1].load(Ordering::Acquire) == hi {
                return u64::from(hi) << 32 | u64::from(lo);
            }
        }
    }

    /// Adds one. Must only be called by the single writer.
    fn advance(&self) {
        let lo = self.words[0].load(Ordering::Relaxed);
        match lo.checked_add(1) {
            Some(lo) => self.words[0].store(lo, Ordering::Release),
            None => {
                // The high word goes first: a reader that sees the wrapped
                // low word is then guaranteed to see the high word change.
                let hi = self.words[1].load(Ordering::Relaxed);
                self.words[1].store(hi.wrapping_add(1), Ordering::Release);
                self.words[0].store(0, Ordering::Release);
            }
        }
    }
}

impl Default for BeatCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
static BEATS: BeatCounter = BeatCounter::new();

#[cfg(target_os = "none")]
fn counter() -> &'static BeatCounter {
    &BEATS
}

// Every simulated machine (one per thread) keeps its own count.
#[cfg(not(target_os = "none"))]
fn counter() -> &'static BeatCounter {
    thread_local! {
        static BEATS: &'static BeatCounter =
            Box::leak(Box::new(BeatCounter::new()));
    }
    BEATS.with(|b| *b)
}

/// SysTick handler; installed in every vector table by default.
pub extern "C" fn tick_isr() {
    counter().advance();
}

/// Beats counted since the tick was armed.
pub fn now() -> u64 {
    counter().now()
}

/// Sleeps until the beat counter differs from `current`, and returns the new
/// value.
///
/// Wakeups that aren't ticks are absorbed by re-checking the counter. A tick
/// landing between the check and the `WFE` isn't lost either: returning from
/// the interrupt sets the event register, so the `WFE` falls straight through.
pub fn wait_for_change(current: u64) -> u64 {
    loop {
        let beat = now();
        if beat != current {
            return beat;
        }
        arch::wait_for_event();
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TickError {
    /// Fewer than two core cycles per beat.
    RateTooHigh { core_hz: u32, rate: u32 },
    /// More core cycles per beat than SysTick can count.
    RateTooLow { core_hz: u32, rate: u32 },
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickError::RateTooHigh { core_hz, rate } => write!(
                f,
                "tick: {rate} beats/s is too fast for a {core_hz} Hz core"
            ),
            TickError::RateTooLow { core_hz, rate } => write!(
                f,
                "tick: {rate} beats/s is too slow for a {core_hz} Hz core"
            ),
        }
    }
}

/// Core cycles per beat for `rate` beats per second.
pub fn tick_reload(core_hz: u32, rate: NonZeroU32) -> Result<u32, TickError> {
    let reload = core_hz / rate.get();
    if reload < 2 {
        Err(TickError::RateTooHigh {
            core_hz,
            rate: rate.get(),
        })
    } else if reload > SYSTICK_MAX_PERIOD {
        Err(TickError::RateTooLow {
            core_hz,
            rate: rate.get(),
        })
    } else {
        Ok(reload)
    }
}

/// A running beat. Exists only once SysTick has been armed.
pub struct Scheduler {
    reload: u32,
    rate: NonZeroU32,
}

impl Scheduler {
    /// Arms SysTick for `rate` beats per second of `clocks.core_hz`.
    pub fn arm(
        clocks: DerivedClocks,
        rate: NonZeroU32,
    ) -> Result<Self, TickError> {
        let reload = tick_reload(clocks.core_hz, rate)?;
        arch::arm_tick(reload);
        trace!(Trace::TickArmed {
            reload,
            rate: rate.get()
        });
        Ok(Self { reload, rate })
    }

    /// Core cycles between beats.
    pub fn reload(&self) -> u32 {
        self.reload
    }

    pub fn rate(&self) -> NonZeroU32 {
        self.rate
    }

    /// The beats as the main loop observes them: the current count first,
    /// then each new value of the counter after sleeping for it.
    pub fn beats(&self) -> Beats {
        Beats { last: None }
    }

    /// Calls `step` once per observed beat, forever.
    pub fn run(self, mut step: impl FnMut(u64)) -> ! {
        let mut beats = self.beats();
        loop {
            step(beats.next_beat());
        }
    }
}

/// Iterator over observed beats; never ends.
pub struct Beats {
    last: Option<u64>,
}

impl Beats {
    pub fn next_beat(&mut self) -> u64 {
        let beat = match self.last {
            None => now(),
            Some(last) => {
                let beat = wait_for_change(last);
                let skipped = beat.wrapping_sub(last).saturating_sub(1);
                if skipped != 0 {
                    trace!(Trace::BeatsSkipped(skipped));
                }
                beat
            }
        };
        self.last = Some(beat);
        beat
    }
}

impl Iterator for Beats {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_beat())
    }
}

/// Brings an application up against `clocks`: `setup`, then `init` for the
/// rate, then the tick. After this the clock tree can no longer be changed.
pub fn launch<A: Application, R: ClockRegisters>(
    app: &mut A,
    mut clocks: ClockTree<R>,
) -> Result<Scheduler, TickError> {
    app.setup(&mut clocks);
    let rate = app.init();
    Scheduler::arm(clocks.freeze(), rate)
}

/// Application entry point used by [`entry!`](crate::entry).
pub fn main<A: Application>(mut app: A) -> ! {
    let Some(regs) = arch::take_clock_registers() else {
        fail::die("clock: registers taken before the runtime started")
    };
    let clocks = ClockTree::new(regs);
    let scheduler = match launch(&mut app, clocks) {
        Ok(s) => s,
        Err(e) => fail::die(e),
    };
    scheduler.run(|beat| app.step(beat))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hz(core_hz: u32) -> DerivedClocks {
        DerivedClocks {
            core_hz,
            apb1_hz: core_hz,
            apb2_hz: core_hz,
        }
    }

    fn rate(r: u32) -> NonZeroU32 {
        NonZeroU32::new(r).unwrap()
    }

    #[test]
    fn counter_carries_into_high_word() {
        let c = BeatCounter::starting_at(u64::from(u32::MAX) - 1);
        c.advance();
        assert_eq!(c.now(), u64::from(u32::MAX));
        c.advance();
        assert_eq!(c.now(), 1 << 32);
        c.advance();
        assert_eq!(c.now(), (1 << 32) + 1);
    }

    #[test]
    fn reload_is_cycles_per_beat() {
        assert_eq!(tick_reload(8_000_000, rate(1000)), Ok(8000));
        assert_eq!(tick_reload(72_000_000, rate(1024)), Ok(70312));
        assert_eq!(tick_reload(8_000_000, rate(4_000_000)), Ok(2));
        assert_eq!(tick_reload(16_000_000, rate(1)), Ok(16_000_000));
    }

    #[test]
    fn reload_must_fit_systick() {
        assert_eq!(
            tick_reload(72_000_000, rate(1)),
            Err(TickError::RateTooLow {
                core_hz: 72_000_000,
                rate: 1
            })
        );
        assert_eq!(
            tick_reload(8_000_000, rate(8_000_000)),
            Err(TickError::RateTooHigh {
                core_hz: 8_000_000,
                rate: 8_000_000
            })
        );
        assert!(tick_reload(8_000_000, rate(u32::MAX)).is_err());
    }

    #[test]
    fn arm_programs_reload() {
        let s = Scheduler::arm(hz(8_000_000), rate(1000)).unwrap();
        assert_eq!(s.reload(), 8000);
        assert_eq!(arch::tick_reload(), Some(8000));
    }

    #[test]
    fn arm_rejects_bad_rate_without_touching_systick() {
        assert!(Scheduler::arm(hz(72_000_000), rate(2)).is_err());
        assert_eq!(arch::tick_reload(), None);
    }

    #[test]
    fn each_beat_costs_one_period() {
        let s = Scheduler::arm(hz(8_000_000), rate(1000)).unwrap();
        let start = arch::cycles();
        let seen: Vec<u64> = s.beats().take(5).collect();
        assert_eq!(seen, [0, 1, 2, 3, 4]);
        assert_eq!(arch::cycles() - start, 4 * 8000);
    }

    #[test]
    fn spurious_wakeups_do_not_repeat_beats() {
        let s = Scheduler::arm(hz(8_000_000), rate(1000)).unwrap();
        let mut beats = s.beats();
        assert_eq!(beats.next_beat(), 0);
        arch::queue_spurious_wakeups(7);
        assert_eq!(beats.next_beat(), 1);
        assert_eq!(beats.next_beat(), 2);
    }

    #[test]
    fn overrun_skips_ahead() {
        let s = Scheduler::arm(hz(8_000_000), rate(1000)).unwrap();
        let mut beats = s.beats();
        assert_eq!(beats.next_beat(), 0);
        // A step that takes three and a half periods.
        arch::burn_cycles(3 * 8000 + 4000);
        assert_eq!(beats.next_beat(), 3);
        assert_eq!(beats.next_beat(), 4);
    }

    #[test]
    fn wait_for_change_returns_at_once_if_moved() {
        Scheduler::arm(hz(8_000_000), rate(1000)).unwrap();
        arch::burn_cycles(8000);
        let before = arch::cycles();
        assert_eq!(wait_for_change(0), 1);
        assert_eq!(arch::cycles(), before);
    }
}
