// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What the runtime expects of an application.

use core::num::NonZeroU32;

use crate::clock::{ClockRegisters, ClockTree};

/// An application driven by the beat scheduler.
///
/// The runtime calls `setup` once, then `init` once, then `step` once per
/// observed beat for as long as the system runs.
pub trait Application {
    /// One-time board bring-up. This is the only place the clock tree can be
    /// reconfigured; it is frozen as soon as `setup` returns.
    fn setup<R: ClockRegisters>(&mut self, clocks: &mut ClockTree<R>);

    /// Returns the beat rate, in beats per second.
    fn init(&mut self) -> NonZeroU32;

    /// Runs one beat's worth of work. `beat` is strictly greater than the
    /// value passed to the previous call, but may have skipped ahead if the
    /// previous call took longer than a beat. Must not block indefinitely.
    fn step(&mut self, beat: u64);
}

/// Names the application the runtime should start.
///
/// ```ignore
/// beat_rt::entry!(Blinky::new());
/// ```
///
/// The expression is evaluated after RAM has been initialized and every init
/// callback has run.
#[macro_export]
macro_rules! entry {
    ($app:expr) => {
        #[export_name = "__beat_rt_main"]
        pub fn __beat_rt_main() {
            $crate::beat::main($app)
        }
    };
}
