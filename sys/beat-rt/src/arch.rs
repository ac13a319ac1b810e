// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus every register access and special instruction the runtime needs
//! shows up right here in the `arch` module, tailored for the current
//! target. On the STM32 that means the real peripherals; on a hosted target
//! it means a per-thread simulation of the RCC, the flash controller and
//! SysTick, which is what the tests run against.
//!
//! Both modules define `take_clock_registers`, `arm_tick`, `wait_for_event`
//! and `active_vector`.

cfg_if::cfg_if! {
    if #[cfg(all(armv7m, target_os = "none"))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("bare-metal support is only implemented for ARMv7-M");
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
