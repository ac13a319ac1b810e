// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cortex-M3 / STM32F103 support.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use stm32f1::stm32f103 as device;

use crate::clock::{ClockRegisters, ClockTree, ReadyPolicy};
use crate::vectors::Vector;

/// The RCC and flash interface registers.
///
/// This is a zero-sized handle; the registers themselves are reached through
/// the PAC's fixed addresses. Outside the reset sequence the only way to get
/// one is [`take_clock_registers`], which succeeds once.
pub struct Rcc {
    _private: (),
}

impl Rcc {
    fn rcc() -> &'static device::rcc::RegisterBlock {
        // Safety: the PAC pointer is the peripheral's fixed address, valid
        // for the life of the program.
        unsafe { &*device::RCC::ptr() }
    }

    fn flash() -> &'static device::flash::RegisterBlock {
        // Safety: as above.
        unsafe { &*device::FLASH::ptr() }
    }
}

impl ClockRegisters for Rcc {
    fn cr(&self) -> u32 {
        Self::rcc().cr.read().bits()
    }

    fn set_cr(&mut self, value: u32) {
        Self::rcc().cr.write(|w| unsafe { w.bits(value) });
    }

    fn cfgr(&self) -> u32 {
        Self::rcc().cfgr.read().bits()
    }

    fn set_cfgr(&mut self, value: u32) {
        Self::rcc().cfgr.write(|w| unsafe { w.bits(value) });
    }

    fn set_cir(&mut self, value: u32) {
        Self::rcc().cir.write(|w| unsafe { w.bits(value) });
    }

    fn flash_acr(&self) -> u32 {
        Self::flash().acr.read().bits()
    }

    fn set_flash_acr(&mut self, value: u32) {
        Self::flash().acr.write(|w| unsafe { w.bits(value) });
        // Make sure the new latency is in force before anything that depends
        // on it (i.e. the SYSCLK switch) is issued.
        cortex_m::asm::dmb();
    }
}

static CLOCK_REGISTERS_TAKEN: AtomicBool = AtomicBool::new(false);

/// Hands out the clock tree registers, the first time only. `beat::main`
/// takes them before the application runs.
pub fn take_clock_registers() -> Option<Rcc> {
    if CLOCK_REGISTERS_TAKEN.swap(true, Ordering::AcqRel) {
        None
    } else {
        Some(Rcc { _private: () })
    }
}

/// The first thing run out of reset, before RAM is set up: put the clock
/// tree back to its reset state (a warm reset or a debugger may have left it
/// elsewhere) and point VTOR at our table.
///
/// This must not touch anything in `.data` or `.bss`, which rules out the
/// taken flag; the handle made here is dropped before RAM is set up.
pub fn system_init() {
    let rcc = Rcc { _private: () };
    let mut clocks = ClockTree::with_policy(rcc, ReadyPolicy::Unbounded);
    // Unbounded polls can't fail.
    let _ = clocks.restore_reset_state();

    extern "C" {
        static __vector_table: u32;
    }
    // Safety: only the address of the linker-provided symbol is taken, and
    // VTOR is written before any exception is enabled.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        scb.vtor
            .write(core::ptr::addr_of!(__vector_table) as u32);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Starts SysTick from the processor clock with its interrupt enabled,
/// firing every `reload` cycles.
pub fn arm_tick(reload: u32) {
    // Safety: SysTick belongs to the beat scheduler, which is the only caller.
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    unsafe {
        syst.rvr.write(reload - 1);
        syst.cvr.write(0);
        syst.csr.modify(|v| v | 0b111);
    }
}

pub fn wait_for_event() {
    cortex_m::asm::wfe();
}

/// Identifies the exception being serviced from the bottom 9 bits of IPSR.
pub fn active_vector() -> Option<Vector> {
    // Safety: we're just reading the PSR.
    let ipsr = unsafe {
        let mut ipsr: u32;
        asm!(
            "mrs {}, IPSR",
            out(reg) ipsr,
            options(pure, nomem, preserves_flags, nostack),
        );
        ipsr & 0x1FF
    };
    Vector::from_number(ipsr as usize)
}

pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}
