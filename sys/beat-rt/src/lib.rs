// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small runtime for single-core Cortex-M applications.
//!
//! The runtime takes the processor from reset to a fixed-rate cooperative
//! loop:
//!
//! - [`vectors`] describes the exception/interrupt table the hardware reads
//!   on reset and on every exception.
//! - [`startup`] prepares RAM (zeroing `.bss`, loading `.data`), runs
//!   registered init callbacks and hands control to the application.
//! - [`clock`] moves the clock tree between the board's known frequencies
//!   without ever running flash faster than its wait states allow.
//! - [`beat`] turns SysTick into a monotonic beat counter and drives the
//!   application's `step` once per observed beat.
//!
//! Applications implement [`app::Application`] and name themselves with
//! [`entry!`].
//!
//! On a hosted target every hardware access is replaced by a simulation (see
//! [`arch`]), which is what the test suite runs against.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod trace;

pub mod app;
pub mod arch;
pub mod beat;
pub mod clock;
pub mod device;
pub mod fail;
pub mod startup;
pub mod vectors;

pub use app::Application;
pub use clock::{ClockFrequency, ClockTree, DerivedClocks};
