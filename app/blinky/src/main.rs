// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blinks the LED on a "blue pill" (STM32F103C8) board.
//!
//! The clock tree is raised to 72 MHz, the beat runs at 1024 beats per
//! second, and the LED spends 128 beats on and 128 beats off, so it flashes
//! four times a second.
//!
//! Built for the host, this runs two simulated seconds against the runtime's
//! fakes and prints every LED transition.

#![cfg_attr(target_os = "none", no_std, no_main)]

use core::num::NonZeroU32;

use beat_rt::clock::ClockRegisters;
use beat_rt::{Application, ClockFrequency, ClockTree, DerivedClocks};

const BEATS_PER_SECOND: NonZeroU32 = match NonZeroU32::new(1024) {
    Some(rate) => rate,
    None => panic!(),
};
/// Beats the LED spends in each state.
const DUTY: u64 = 128;

struct Blinky {
    led: Led,
    lit: bool,
}

impl Blinky {
    fn new() -> Self {
        Self {
            led: Led::new(),
            lit: false,
        }
    }
}

impl Application for Blinky {
    fn setup<R: ClockRegisters>(&mut self, clocks: &mut ClockTree<R>) {
        let derived = clocks.configure(ClockFrequency::Mhz72);
        self.led.init(derived);
    }

    fn init(&mut self) -> NonZeroU32 {
        BEATS_PER_SECOND
    }

    fn step(&mut self, beat: u64) {
        let lit = (beat / DUTY) % 2 == 0;
        if lit != self.lit {
            self.lit = lit;
            self.led.set(beat, lit);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use beat_rt::vectors::{DeviceVectorTable, VectorTable};
        use stm32f1::stm32f103 as device;

        /// The LED on PC13. It's wired to 3V3, so it lights when the pin is
        /// driven low.
        struct Led;

        const LED_PIN: u32 = 13;

        impl Led {
            fn new() -> Self {
                Led
            }

            fn gpioc() -> &'static device::gpioa::RegisterBlock {
                // Safety: fixed peripheral address; this is the only user.
                unsafe { &*device::GPIOC::ptr() }
            }

            /// Configures the pin as a 2 MHz push-pull output, LED off.
            fn init(&mut self, _clocks: DerivedClocks) {
                let gpioc = Self::gpioc();
                gpioc.bsrr.write(|w| unsafe { w.bits(1 << LED_PIN) });
                let shift = (LED_PIN - 8) * 4;
                gpioc.crh.modify(|r, w| unsafe {
                    w.bits(r.bits() & !(0xF << shift) | (0b0010 << shift))
                });
            }

            fn set(&mut self, _beat: u64, lit: bool) {
                let bit = if lit { LED_PIN + 16 } else { LED_PIN };
                Self::gpioc().bsrr.write(|w| unsafe { w.bits(1 << bit) });
            }
        }

        /// GPIOC has to be clocked before `setup` can touch it.
        unsafe extern "C" fn enable_gpioc() {
            // Safety: fixed peripheral address, and nothing else is running
            // this early.
            let rcc = unsafe { &*device::RCC::ptr() };
            rcc.apb2enr.modify(|_, w| w.iopcen().set_bit());
        }
        beat_rt::init_callback!(enable_gpioc);

        extern "C" {
            static _stack_top: u32;
        }

        #[link_section = ".vector_table"]
        #[used]
        static VECTORS: DeviceVectorTable = VectorTable::new(
            unsafe { core::ptr::addr_of!(_stack_top) },
            beat_rt::startup::Reset,
        );

        beat_rt::entry!(Blinky::new());
    } else {
        use beat_rt::{arch, beat, fail};

        /// Prints what the LED would be doing.
        struct Led {
            clocks: Option<DerivedClocks>,
        }

        impl Led {
            fn new() -> Self {
                Led { clocks: None }
            }

            fn init(&mut self, clocks: DerivedClocks) {
                self.clocks = Some(clocks);
                println!("led: PC13 configured, off");
            }

            fn set(&mut self, beat: u64, lit: bool) {
                let ms = beat * 1000 / u64::from(BEATS_PER_SECOND.get());
                let cycles = arch::cycles();
                println!(
                    "beat {beat:>5} ({ms:>4} ms, cycle {cycles:>9}): led {}",
                    if lit { "on" } else { "off" },
                );
            }
        }

        const SIMULATED_SECONDS: u64 = 2;

        fn main() {
            let Some(regs) = arch::take_clock_registers() else {
                fail::die("clock: registers already taken")
            };
            println!("board: {}", beat_rt::clock::BOARD);

            let mut app = Blinky::new();
            let scheduler = beat::launch(&mut app, ClockTree::new(regs))
                .unwrap_or_else(|e| fail::die(e));

            if let Some(c) = app.led.clocks {
                println!(
                    "clocks: core {} Hz, APB1 {} Hz, APB2 {} Hz; \
                     {} cycles per beat",
                    c.core_hz, c.apb1_hz, c.apb2_hz, scheduler.reload(),
                );
            }

            let end = SIMULATED_SECONDS * u64::from(BEATS_PER_SECOND.get());
            for beat in scheduler.beats().take_while(|&b| b < end) {
                app.step(beat);
            }
        }
    }
}
