// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer of runtime events.
//!
//! The runtime has no console, so notable events (clock transitions, the
//! tick being armed, beats skipped by a slow `step`) are recorded into a
//! static ring buffer that can be read out of a halted target with GDB:
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print beat_rt::trace::RINGBUF
//! ```
//!
//! Each entry carries the source line that recorded it, a generation number
//! that increments every time the slot is reused, and a count. Recording the
//! same payload from the same line twice in a row bumps the count instead of
//! consuming a new slot, so a poll loop that keeps logging the same thing
//! doesn't wipe out the history.
//!
//! Payloads must be `Copy + PartialEq`.

use core::cell::RefCell;
use critical_section::Mutex;

use crate::clock::{ClockError, ClockSource};

/// Number of entries kept in [`RINGBUF`].
pub const TRACE_ENTRIES: usize = 32;

/// Events recorded by the runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    ClockSwitch { from: ClockSource, to: ClockSource },
    FlashWaitStates(u8),
    PllLocked { multiplier: u8 },
    ClocksDerived { core_hz: u32, apb1_hz: u32 },
    ClockFault(ClockError),
    TickArmed { reload: u32, rate: u32 },
    /// The main loop observed a jump of more than one beat; the payload is
    /// the number of beats that `step` never saw.
    BeatsSkipped(u64),
}

#[derive(Copy, Clone, Debug)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // `None` is treated as an out-of-range index so that the first entry
        // lands in slot 0 and nothing gets merged into it.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        // No remainder here: usize::MAX has to wrap to 0, and the M3 would
        // rather compare than divide.
        let next = last.wrapping_add(1);
        let ndx = if next >= N { 0 } else { next };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Recorded entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let split = self.last.map_or(0, |l| (l + 1).min(N));
        let (newer, older) = self.buffer.split_at(split);
        older.iter().chain(newer).filter(|e| e.count != 0)
    }
}

/// The runtime's event log.
#[used]
pub static RINGBUF: Mutex<RefCell<Ringbuf<Trace, TRACE_ENTRIES>>> =
    Mutex::new(RefCell::new(Ringbuf::new(Trace::None)));

pub fn record(line: u16, event: Trace) {
    critical_section::with(|cs| RINGBUF.borrow_ref_mut(cs).entry(line, event));
}

/// Records an event in [`RINGBUF`], tagged with the calling line.
macro_rules! trace {
    ($event:expr) => {
        $crate::trace::record(line!() as u16, $event)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_lands_in_slot_zero() {
        let mut ring = Ringbuf::<u32, 4>::new(0);
        ring.entry(10, 7);
        assert_eq!(ring.last, Some(0));
        assert_eq!(ring.buffer[0].payload, 7);
        assert_eq!(ring.buffer[0].count, 1);
        assert_eq!(ring.buffer[0].generation, 1);
    }

    #[test]
    fn repeats_from_the_same_line_are_counted() {
        let mut ring = Ringbuf::<u32, 4>::new(0);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(11, 7);
        assert_eq!(ring.buffer[0].count, 3);
        assert_eq!(ring.buffer[1].line, 11);
        assert_eq!(ring.last, Some(1));
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut ring = Ringbuf::<u32, 3>::new(0);
        for i in 0..5 {
            ring.entry(1, i);
        }
        assert_eq!(ring.last, Some(1));
        assert_eq!(ring.buffer[0].payload, 3);
        assert_eq!(ring.buffer[0].generation, 2);
        assert_eq!(ring.buffer[2].generation, 1);

        let order: Vec<u32> = ring.entries().map(|e| e.payload).collect();
        assert_eq!(order, [2, 3, 4]);
    }

    #[test]
    fn entries_skip_unused_slots() {
        let mut ring = Ringbuf::<Trace, 8>::new(Trace::None);
        ring.entry(1, Trace::FlashWaitStates(2));
        ring.entry(2, Trace::BeatsSkipped(3));
        let seen: Vec<Trace> = ring.entries().map(|e| e.payload).collect();
        assert_eq!(seen, [Trace::FlashWaitStates(2), Trace::BeatsSkipped(3)]);
    }
}
