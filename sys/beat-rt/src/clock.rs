// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock tree management for the STM32F1 RCC.
//!
//! SYSCLK can come from one of four places: the internal RC oscillator
//! (HSI), the external crystal (HSE), or the PLL fed from either of them.
//! The PLL's source and multiplier may only be changed while it is off, and
//! it may only be turned off while it isn't driving SYSCLK; the flash, for
//! its part, returns garbage if SYSCLK is faster than its programmed wait
//! states allow. [`ClockTree`] therefore always moves between frequencies by
//! way of the internal oscillator:
//!
//! 1. switch SYSCLK to HSI and wait for the switch to take;
//! 2. turn the PLL off and wait for it to stop;
//! 3. program the flash wait states the target needs;
//! 4. bring up HSE if needed, then program PLL source, multiplier and bus
//!    prescalers;
//! 5. turn the PLL on and wait for lock;
//! 6. switch SYSCLK to the target source and wait for the switch to take;
//! 7. recompute the derived bus clocks from what the registers now say.
//!
//! Every SYSCLK switch is additionally checked against the state machine
//! (anything may go to HSI, HSI may go anywhere) and against the wait states
//! currently in the flash controller.
//!
//! The set of reachable frequencies comes from the board configuration; see
//! `boards/*.toml` and `build.rs`.

use core::fmt;

use crate::fail;
use crate::trace::Trace;

include!(concat!(env!("OUT_DIR"), "/clock_table.rs"));

pub(crate) const CR_HSION: u32 = 1 << 0;
pub(crate) const CR_HSIRDY: u32 = 1 << 1;
pub(crate) const CR_HSEON: u32 = 1 << 16;
pub(crate) const CR_HSERDY: u32 = 1 << 17;
pub(crate) const CR_HSEBYP: u32 = 1 << 18;
pub(crate) const CR_CSSON: u32 = 1 << 19;
pub(crate) const CR_PLLON: u32 = 1 << 24;
pub(crate) const CR_PLLRDY: u32 = 1 << 25;

pub(crate) const CFGR_SW: u32 = 0b11;
pub(crate) const CFGR_SWS_SHIFT: u32 = 2;
pub(crate) const CFGR_SWS: u32 = 0b11 << CFGR_SWS_SHIFT;
const CFGR_HPRE_SHIFT: u32 = 4;
const CFGR_HPRE: u32 = 0b1111 << CFGR_HPRE_SHIFT;
const CFGR_PPRE1_SHIFT: u32 = 8;
const CFGR_PPRE1: u32 = 0b111 << CFGR_PPRE1_SHIFT;
const CFGR_PPRE2_SHIFT: u32 = 11;
const CFGR_PPRE2: u32 = 0b111 << CFGR_PPRE2_SHIFT;
pub(crate) const CFGR_PLLSRC: u32 = 1 << 16;
pub(crate) const CFGR_PLLXTPRE: u32 = 1 << 17;
const CFGR_PLLMUL_SHIFT: u32 = 18;
pub(crate) const CFGR_PLLMUL: u32 = 0b1111 << CFGR_PLLMUL_SHIFT;

/// Writing this to CIR disables every clock interrupt and clears any that
/// are pending.
pub(crate) const CIR_DISABLE_AND_CLEAR: u32 = 0x009F_0000;

pub(crate) const ACR_LATENCY: u32 = 0b111;
pub(crate) const ACR_PRFTBE: u32 = 1 << 4;

/// HPRE encodings: 0xxx is /1, then /2 through /512 skipping /32.
const AHB_DIVISORS: [u32; 16] =
    [1, 1, 1, 1, 1, 1, 1, 1, 2, 4, 8, 16, 64, 128, 256, 512];

/// PPRE1/PPRE2 encodings: 0xx is /1, then /2 through /16.
const APB_DIVISORS: [u32; 8] = [1, 1, 1, 1, 2, 4, 8, 16];

/// Register-level access to the RCC and the flash access control register.
///
/// On the target this is a thin wrapper over the peripheral; on the host it
/// is a simulation that enforces the hardware's rules (see
/// `arch::FakeRcc`).
pub trait ClockRegisters {
    fn cr(&self) -> u32;
    fn set_cr(&mut self, value: u32);
    fn cfgr(&self) -> u32;
    fn set_cfgr(&mut self, value: u32);
    fn set_cir(&mut self, value: u32);
    fn flash_acr(&self) -> u32;
    fn set_flash_acr(&mut self, value: u32);
}

/// Where SYSCLK comes from. These are also the states of the clock tree's
/// state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ClockSource {
    Internal,
    External,
    PllFromInternal,
    PllFromExternal,
}

impl ClockSource {
    /// Legal edges: anything may fall back to the internal oscillator, and
    /// the internal oscillator may move anywhere.
    pub const fn may_switch_to(self, next: ClockSource) -> bool {
        matches!(
            (self, next),
            (_, ClockSource::Internal) | (ClockSource::Internal, _)
        )
    }

    pub const fn is_pll(self) -> bool {
        matches!(
            self,
            ClockSource::PllFromInternal | ClockSource::PllFromExternal
        )
    }

    pub const fn uses_external(self) -> bool {
        matches!(self, ClockSource::External | ClockSource::PllFromExternal)
    }

    const fn sw_bits(self) -> u32 {
        match self {
            ClockSource::Internal => 0b00,
            ClockSource::External => 0b01,
            ClockSource::PllFromInternal | ClockSource::PllFromExternal => {
                0b10
            }
        }
    }

    /// Decodes the *active* source from CFGR (SWS, and PLLSRC when SWS says
    /// PLL). The reserved SWS encoding reads as the internal oscillator,
    /// which is what the hardware falls back to.
    pub fn from_cfgr(cfgr: u32) -> Self {
        match (cfgr & CFGR_SWS) >> CFGR_SWS_SHIFT {
            0b01 => ClockSource::External,
            0b10 if cfgr & CFGR_PLLSRC != 0 => ClockSource::PllFromExternal,
            0b10 => ClockSource::PllFromInternal,
            _ => ClockSource::Internal,
        }
    }

    /// SYSCLK this source produces given the PLL fields in `cfgr`.
    pub fn sysclk_hz(self, cfgr: u32) -> u32 {
        match self {
            ClockSource::Internal => INTERNAL_OSC_HZ,
            ClockSource::External => EXTERNAL_OSC_HZ,
            ClockSource::PllFromInternal => {
                (INTERNAL_OSC_HZ / 2) * pll_multiplier(cfgr)
            }
            ClockSource::PllFromExternal => {
                let input = if cfgr & CFGR_PLLXTPRE != 0 {
                    EXTERNAL_OSC_HZ / 2
                } else {
                    EXTERNAL_OSC_HZ
                };
                input * pll_multiplier(cfgr)
            }
        }
    }
}

/// PLLMUL holds the multiplier minus two; the top two encodings both mean 16.
fn pll_multiplier(cfgr: u32) -> u32 {
    (((cfgr & CFGR_PLLMUL) >> CFGR_PLLMUL_SHIFT) + 2).min(16)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AhbPrescaler {
    Div1,
    Div2,
    Div4,
    Div8,
    Div16,
    Div64,
    Div128,
    Div256,
    Div512,
}

impl AhbPrescaler {
    const fn bits(self) -> u32 {
        match self {
            AhbPrescaler::Div1 => 0b0000,
            AhbPrescaler::Div2 => 0b1000,
            AhbPrescaler::Div4 => 0b1001,
            AhbPrescaler::Div8 => 0b1010,
            AhbPrescaler::Div16 => 0b1011,
            AhbPrescaler::Div64 => 0b1100,
            AhbPrescaler::Div128 => 0b1101,
            AhbPrescaler::Div256 => 0b1110,
            AhbPrescaler::Div512 => 0b1111,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b1111 {
            0b1000 => AhbPrescaler::Div2,
            0b1001 => AhbPrescaler::Div4,
            0b1010 => AhbPrescaler::Div8,
            0b1011 => AhbPrescaler::Div16,
            0b1100 => AhbPrescaler::Div64,
            0b1101 => AhbPrescaler::Div128,
            0b1110 => AhbPrescaler::Div256,
            0b1111 => AhbPrescaler::Div512,
            _ => AhbPrescaler::Div1,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApbPrescaler {
    Div1,
    Div2,
    Div4,
    Div8,
    Div16,
}

impl ApbPrescaler {
    const fn bits(self) -> u32 {
        match self {
            ApbPrescaler::Div1 => 0b000,
            ApbPrescaler::Div2 => 0b100,
            ApbPrescaler::Div4 => 0b101,
            ApbPrescaler::Div8 => 0b110,
            ApbPrescaler::Div16 => 0b111,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b111 {
            0b100 => ApbPrescaler::Div2,
            0b101 => ApbPrescaler::Div4,
            0b110 => ApbPrescaler::Div8,
            0b111 => ApbPrescaler::Div16,
            _ => ApbPrescaler::Div1,
        }
    }
}

/// One complete clock tree setting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockConfiguration {
    pub source: ClockSource,
    /// `Some` exactly when `source` is one of the PLL sources.
    pub pll_multiplier: Option<u8>,
    pub ahb: AhbPrescaler,
    pub apb1: ApbPrescaler,
    pub apb2: ApbPrescaler,
    pub flash_wait_states: u8,
}

/// Frequencies seen by the core and the two peripheral buses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DerivedClocks {
    pub core_hz: u32,
    pub apb1_hz: u32,
    pub apb2_hz: u32,
}

impl DerivedClocks {
    /// Works the clock tree forward from a CFGR value.
    pub fn from_registers(cfgr: u32) -> Self {
        let sysclk = ClockSource::from_cfgr(cfgr).sysclk_hz(cfgr);
        let core_hz = sysclk
            / AHB_DIVISORS[((cfgr & CFGR_HPRE) >> CFGR_HPRE_SHIFT) as usize];
        let apb1_hz = core_hz
            / APB_DIVISORS[((cfgr & CFGR_PPRE1) >> CFGR_PPRE1_SHIFT) as usize];
        let apb2_hz = core_hz
            / APB_DIVISORS[((cfgr & CFGR_PPRE2) >> CFGR_PPRE2_SHIFT) as usize];
        Self {
            core_hz,
            apb1_hz,
            apb2_hz,
        }
    }

    /// Clock fed to TIM2-4: doubled whenever APB1 is divided down.
    pub fn apb1_timer_hz(&self) -> u32 {
        if self.apb1_hz == self.core_hz {
            self.apb1_hz
        } else {
            self.apb1_hz * 2
        }
    }

    /// Clock fed to TIM1, by the same rule as [`Self::apb1_timer_hz`].
    pub fn apb2_timer_hz(&self) -> u32 {
        if self.apb2_hz == self.core_hz {
            self.apb2_hz
        } else {
            self.apb2_hz * 2
        }
    }
}

/// How long to wait for a ready flag before giving up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadyPolicy {
    /// Spin until the flag shows up, however long that takes.
    Unbounded,
    /// Give up after reading the flag this many times.
    Bounded { polls: u32 },
}

/// Hardware conditions the clock tree waits on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadyFlag {
    InternalOscillator,
    ExternalOscillator,
    PllLock,
    PllStopped,
    Switch(ClockSource),
    FlashLatency,
}

impl fmt::Display for ReadyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyFlag::InternalOscillator => f.write_str("HSIRDY"),
            ReadyFlag::ExternalOscillator => f.write_str("HSERDY"),
            ReadyFlag::PllLock => f.write_str("PLLRDY"),
            ReadyFlag::PllStopped => f.write_str("PLL shutdown"),
            ReadyFlag::Switch(s) => write!(f, "SYSCLK switch to {s:?}"),
            ReadyFlag::FlashLatency => f.write_str("flash LATENCY"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClockError {
    /// A bounded ready poll ran out.
    NotReady(ReadyFlag),
    /// The requested SYSCLK switch is not an edge of the state machine.
    IllegalTransition { from: ClockSource, to: ClockSource },
    /// The flash is programmed with too few wait states for the SYSCLK that
    /// was about to take effect.
    WaitStatesInsufficient { sysclk_hz: u32, wait_states: u8 },
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::NotReady(flag) => {
                write!(f, "clock: {flag} never became ready")
            }
            ClockError::IllegalTransition { from, to } => {
                write!(f, "clock: illegal switch from {from:?} to {to:?}")
            }
            ClockError::WaitStatesInsufficient {
                sysclk_hz,
                wait_states,
            } => write!(
                f,
                "clock: {wait_states} flash wait states too few for \
                 {sysclk_hz} Hz"
            ),
        }
    }
}

/// Smallest number of flash wait states that can sustain `sysclk_hz`, or
/// `None` if no setting can.
pub fn min_wait_states(sysclk_hz: u32) -> Option<u8> {
    FLASH_WAIT_STATE_LIMITS_HZ
        .iter()
        .position(|&max| sysclk_hz <= max)
        .map(|n| n as u8)
}

pub fn wait_states_sufficient(wait_states: u8, sysclk_hz: u32) -> bool {
    min_wait_states(sysclk_hz).is_some_and(|min| wait_states >= min)
}

/// Owner of the clock tree registers.
///
/// Holding a `ClockTree` is what entitles code to change frequencies. The
/// beat scheduler consumes it (see [`ClockTree::freeze`]) when it arms its
/// tick, since the tick's reload value is only valid for the core clock it
/// was computed from.
pub struct ClockTree<R: ClockRegisters> {
    regs: R,
    policy: ReadyPolicy,
    clocks: DerivedClocks,
}

impl<R: ClockRegisters> ClockTree<R> {
    pub fn new(regs: R) -> Self {
        Self::with_policy(regs, DEFAULT_READY_POLICY)
    }

    pub fn with_policy(regs: R, policy: ReadyPolicy) -> Self {
        let clocks = DerivedClocks::from_registers(regs.cfgr());
        Self {
            regs,
            policy,
            clocks,
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// Currently active SYSCLK source.
    pub fn source(&self) -> ClockSource {
        ClockSource::from_cfgr(self.regs.cfgr())
    }

    pub fn clocks(&self) -> DerivedClocks {
        self.clocks
    }

    pub fn flash_wait_states(&self) -> u8 {
        (self.regs.flash_acr() & ACR_LATENCY) as u8
    }

    /// Reads the current setting back out of the registers.
    pub fn configuration(&self) -> ClockConfiguration {
        let cfgr = self.regs.cfgr();
        let source = ClockSource::from_cfgr(cfgr);
        ClockConfiguration {
            source,
            pll_multiplier: if source.is_pll() {
                Some(pll_multiplier(cfgr) as u8)
            } else {
                None
            },
            ahb: AhbPrescaler::from_bits(cfgr >> CFGR_HPRE_SHIFT),
            apb1: ApbPrescaler::from_bits(cfgr >> CFGR_PPRE1_SHIFT),
            apb2: ApbPrescaler::from_bits(cfgr >> CFGR_PPRE2_SHIFT),
            flash_wait_states: self.flash_wait_states(),
        }
    }

    /// Puts the clock tree back the way reset left it: HSI driving SYSCLK,
    /// PLL, HSE and the security system off, every prescaler at /1, clock
    /// interrupts disabled.
    ///
    /// This runs from the reset handler before RAM is initialized, so it
    /// must not touch statics (no tracing here).
    pub fn restore_reset_state(&mut self) -> Result<(), ClockError> {
        self.enter_internal()?;
        self.disable_pll()?;

        // HSEBYP can only be written once HSE is off.
        let cr = self.regs.cr() & !(CR_HSEON | CR_CSSON);
        self.regs.set_cr(cr);
        self.regs.set_cr(cr & !CR_HSEBYP);

        self.regs.set_cfgr(0);
        self.regs.set_cir(CIR_DISABLE_AND_CLEAR);
        self.clocks = DerivedClocks::from_registers(self.regs.cfgr());
        Ok(())
    }

    /// Moves the clock tree to `target`, halting the system if the hardware
    /// doesn't cooperate.
    pub fn configure(&mut self, target: ClockFrequency) -> DerivedClocks {
        match self.try_configure(target) {
            Ok(clocks) => clocks,
            Err(e) => fail::die(e),
        }
    }

    /// Moves the clock tree to `target`.
    ///
    /// On failure the tree is left in whatever safe state the sequence had
    /// reached (SYSCLK on the internal oscillator if the failure came after
    /// step 1), and [`Self::clocks`] describes that state.
    pub fn try_configure(
        &mut self,
        target: ClockFrequency,
    ) -> Result<DerivedClocks, ClockError> {
        let result = self.transition(&target.configuration());
        self.clocks = DerivedClocks::from_registers(self.regs.cfgr());
        match result {
            Ok(()) => {
                trace!(Trace::ClocksDerived {
                    core_hz: self.clocks.core_hz,
                    apb1_hz: self.clocks.apb1_hz,
                });
                Ok(self.clocks)
            }
            Err(e) => {
                trace!(Trace::ClockFault(e));
                Err(e)
            }
        }
    }

    /// Gives up control of the clock tree, returning the final frequencies.
    pub fn freeze(self) -> DerivedClocks {
        self.clocks
    }

    fn transition(
        &mut self,
        setting: &ClockConfiguration,
    ) -> Result<(), ClockError> {
        let from = self.source();
        self.enter_internal()?;
        if from != ClockSource::Internal {
            trace!(Trace::ClockSwitch {
                from,
                to: ClockSource::Internal
            });
        }

        self.disable_pll()?;

        self.set_flash_wait_states(setting.flash_wait_states)?;
        trace!(Trace::FlashWaitStates(setting.flash_wait_states));

        if setting.source.uses_external() {
            self.enable_external()?;
        }
        self.program(setting);

        if let Some(multiplier) = setting.pll_multiplier {
            self.enable_pll()?;
            trace!(Trace::PllLocked { multiplier });
        }

        if setting.source != ClockSource::Internal {
            self.switch_to(setting.source)?;
            trace!(Trace::ClockSwitch {
                from: ClockSource::Internal,
                to: setting.source,
            });
        }
        Ok(())
    }

    fn enter_internal(&mut self) -> Result<(), ClockError> {
        let cr = self.regs.cr();
        if cr & CR_HSION == 0 {
            self.regs.set_cr(cr | CR_HSION);
        }
        self.wait_until(ReadyFlag::InternalOscillator, |r| {
            r.cr() & CR_HSIRDY != 0
        })?;
        if self.source() != ClockSource::Internal {
            self.switch_to(ClockSource::Internal)?;
        }
        Ok(())
    }

    fn disable_pll(&mut self) -> Result<(), ClockError> {
        let cr = self.regs.cr();
        if cr & CR_PLLON != 0 {
            self.regs.set_cr(cr & !CR_PLLON);
        }
        self.wait_until(ReadyFlag::PllStopped, |r| r.cr() & CR_PLLRDY == 0)
    }

    fn enable_external(&mut self) -> Result<(), ClockError> {
        let cr = self.regs.cr();
        if cr & CR_HSEON == 0 {
            self.regs.set_cr(cr | CR_HSEON);
        }
        self.wait_until(ReadyFlag::ExternalOscillator, |r| {
            r.cr() & CR_HSERDY != 0
        })
    }

    fn enable_pll(&mut self) -> Result<(), ClockError> {
        let cr = self.regs.cr();
        self.regs.set_cr(cr | CR_PLLON);
        self.wait_until(ReadyFlag::PllLock, |r| r.cr() & CR_PLLRDY != 0)
    }

    fn set_flash_wait_states(
        &mut self,
        wait_states: u8,
    ) -> Result<(), ClockError> {
        let sysclk_hz = self.source().sysclk_hz(self.regs.cfgr());
        if !wait_states_sufficient(wait_states, sysclk_hz) {
            return Err(ClockError::WaitStatesInsufficient {
                sysclk_hz,
                wait_states,
            });
        }

        let ws = u32::from(wait_states) & ACR_LATENCY;
        let acr = self.regs.flash_acr();
        self.regs
            .set_flash_acr((acr & !ACR_LATENCY) | ACR_PRFTBE | ws);
        self.wait_until(ReadyFlag::FlashLatency, |r| {
            r.flash_acr() & ACR_LATENCY == ws
        })
    }

    /// Programs PLL and prescaler fields. Only called with the PLL off and
    /// SYSCLK on the internal oscillator.
    fn program(&mut self, setting: &ClockConfiguration) {
        let mut cfgr = self.regs.cfgr()
            & !(CFGR_HPRE
                | CFGR_PPRE1
                | CFGR_PPRE2
                | CFGR_PLLSRC
                | CFGR_PLLXTPRE
                | CFGR_PLLMUL);
        cfgr |= setting.ahb.bits() << CFGR_HPRE_SHIFT;
        cfgr |= setting.apb1.bits() << CFGR_PPRE1_SHIFT;
        cfgr |= setting.apb2.bits() << CFGR_PPRE2_SHIFT;
        if let Some(m) = setting.pll_multiplier {
            cfgr |= (u32::from(m.clamp(2, 16)) - 2) << CFGR_PLLMUL_SHIFT;
            if setting.source == ClockSource::PllFromExternal {
                cfgr |= CFGR_PLLSRC;
            }
        }
        self.regs.set_cfgr(cfgr);
    }

    fn switch_to(&mut self, next: ClockSource) -> Result<(), ClockError> {
        let from = self.source();
        if !from.may_switch_to(next) {
            return Err(ClockError::IllegalTransition { from, to: next });
        }

        let cfgr = self.regs.cfgr();
        let sysclk_hz = next.sysclk_hz(cfgr);
        let wait_states = self.flash_wait_states();
        if !wait_states_sufficient(wait_states, sysclk_hz) {
            return Err(ClockError::WaitStatesInsufficient {
                sysclk_hz,
                wait_states,
            });
        }

        self.regs.set_cfgr((cfgr & !CFGR_SW) | next.sw_bits());
        self.wait_until(ReadyFlag::Switch(next), |r| {
            ClockSource::from_cfgr(r.cfgr()) == next
        })
    }

    fn wait_until(
        &self,
        flag: ReadyFlag,
        ready: impl Fn(&R) -> bool,
    ) -> Result<(), ClockError> {
        match self.policy {
            ReadyPolicy::Unbounded => {
                while !ready(&self.regs) {
                    // spin
                }
                Ok(())
            }
            ReadyPolicy::Bounded { polls } => {
                if (0..polls).any(|_| ready(&self.regs)) {
                    Ok(())
                } else {
                    Err(ClockError::NotReady(flag))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::FakeRcc;

    fn tree() -> ClockTree<FakeRcc> {
        ClockTree::new(FakeRcc::at_reset())
    }

    #[test]
    fn reset_state_runs_from_internal_oscillator() {
        assert_eq!(BOARD, "bluepill");
        let tree = tree();
        assert_eq!(tree.source(), ClockSource::Internal);
        assert_eq!(
            tree.clocks(),
            DerivedClocks {
                core_hz: INTERNAL_OSC_HZ,
                apb1_hz: INTERNAL_OSC_HZ,
                apb2_hz: INTERNAL_OSC_HZ,
            }
        );
    }

    #[test]
    fn every_frequency_is_reachable_from_reset() {
        for f in ClockFrequency::ALL {
            let mut tree = tree();
            let clocks = tree.configure(f);
            assert_eq!(clocks.core_hz, f.hz(), "{f:?}");
            assert_eq!(clocks, f.expected_clocks(), "{f:?}");
            assert_eq!(tree.configuration(), f.configuration(), "{f:?}");
        }
    }

    #[test]
    fn bus_clocks_match_board_table() {
        let mut tree = tree();
        let c = tree.configure(ClockFrequency::Mhz72);
        assert_eq!(
            (c.core_hz, c.apb1_hz, c.apb2_hz),
            (72_000_000, 36_000_000, 72_000_000)
        );
        assert_eq!(c.apb1_timer_hz(), 72_000_000);
        assert_eq!(c.apb2_timer_hz(), 72_000_000);

        let c = tree.configure(ClockFrequency::Mhz40);
        assert_eq!(c.apb1_hz, 20_000_000);

        let c = tree.configure(ClockFrequency::Mhz32);
        assert_eq!(c.apb1_hz, 32_000_000);
        assert_eq!(c.apb1_timer_hz(), 32_000_000);
    }

    #[test]
    fn wait_states_cover_every_target() {
        for f in ClockFrequency::ALL {
            let mut tree = tree();
            tree.configure(f);
            let min = min_wait_states(f.hz()).unwrap();
            assert!(tree.flash_wait_states() >= min, "{f:?}");
        }
    }

    #[test]
    fn any_frequency_reaches_any_other() {
        // The fake panics if the PLL is reprogrammed while running or if the
        // flash is ever slower than SYSCLK needs.
        for from in ClockFrequency::ALL {
            for to in ClockFrequency::ALL {
                let mut tree = tree();
                tree.configure(from);
                let clocks = tree.configure(to);
                assert_eq!(clocks.core_hz, to.hz(), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn transitions_pass_through_internal_oscillator() {
        let mut tree = tree();
        tree.configure(ClockFrequency::Mhz72);
        tree.configure(ClockFrequency::Mhz16);

        let sysclks: Vec<u32> = tree
            .registers()
            .history()
            .iter()
            .map(|c| c.sysclk_hz)
            .collect();
        let down = sysclks
            .windows(2)
            .position(|w| w == [72_000_000, INTERNAL_OSC_HZ]);
        assert!(down.is_some(), "{sysclks:?}");
        assert_eq!(sysclks.last(), Some(&16_000_000));
    }

    #[test]
    fn lowering_frequency_lowers_wait_states_after_switch() {
        let mut tree = tree();
        tree.configure(ClockFrequency::Mhz72);
        assert_eq!(tree.flash_wait_states(), 2);
        tree.configure(ClockFrequency::Mhz8);
        assert_eq!(tree.flash_wait_states(), 0);
        assert_eq!(tree.source(), ClockSource::Internal);
        assert_eq!(tree.registers().cr() & CR_PLLON, 0);
    }

    #[test]
    fn bounded_policy_reports_pll_that_never_locks() {
        let rcc = FakeRcc::at_reset().with_pll_lock(None);
        let mut tree =
            ClockTree::with_policy(rcc, ReadyPolicy::Bounded { polls: 100 });
        assert_eq!(
            tree.try_configure(ClockFrequency::Mhz72),
            Err(ClockError::NotReady(ReadyFlag::PllLock))
        );
        assert_eq!(tree.source(), ClockSource::Internal);
        assert_eq!(tree.clocks().core_hz, INTERNAL_OSC_HZ);
    }

    #[test]
    fn bounded_policy_reports_missing_crystal() {
        let rcc = FakeRcc::at_reset().with_hse_startup(None);
        let mut tree =
            ClockTree::with_policy(rcc, ReadyPolicy::Bounded { polls: 100 });
        assert_eq!(
            tree.try_configure(ClockFrequency::Mhz48),
            Err(ClockError::NotReady(ReadyFlag::ExternalOscillator))
        );
        assert_eq!(tree.source(), ClockSource::Internal);
    }

    #[test]
    fn slow_lock_within_bound_succeeds() {
        let rcc = FakeRcc::at_reset().with_pll_lock(Some(50));
        let mut tree =
            ClockTree::with_policy(rcc, ReadyPolicy::Bounded { polls: 100 });
        assert!(tree.try_configure(ClockFrequency::Mhz72).is_ok());
    }

    #[test]
    #[should_panic(expected = "PLLRDY never became ready")]
    fn configure_is_fail_stop() {
        let rcc = FakeRcc::at_reset().with_pll_lock(None);
        let mut tree =
            ClockTree::with_policy(rcc, ReadyPolicy::Bounded { polls: 10 });
        tree.configure(ClockFrequency::Mhz64);
    }

    #[test]
    fn switch_refuses_insufficient_wait_states() {
        let mut tree = tree();
        let setting = ClockFrequency::Mhz72.configuration();
        tree.enable_external().unwrap();
        tree.program(&setting);
        tree.enable_pll().unwrap();
        assert_eq!(
            tree.switch_to(ClockSource::PllFromExternal),
            Err(ClockError::WaitStatesInsufficient {
                sysclk_hz: 72_000_000,
                wait_states: 0,
            })
        );
        assert_eq!(tree.source(), ClockSource::Internal);
    }

    #[test]
    fn switch_refuses_edges_that_skip_internal() {
        let mut tree = tree();
        tree.configure(ClockFrequency::Mhz72);
        assert_eq!(
            tree.switch_to(ClockSource::External),
            Err(ClockError::IllegalTransition {
                from: ClockSource::PllFromExternal,
                to: ClockSource::External,
            })
        );
    }

    #[test]
    fn state_machine_edges() {
        use ClockSource::*;
        let all = [Internal, External, PllFromInternal, PllFromExternal];
        for from in all {
            for to in all {
                let legal = from == Internal || to == Internal;
                assert_eq!(from.may_switch_to(to), legal, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn restore_reset_state_undoes_configure() {
        let mut tree = tree();
        tree.configure(ClockFrequency::Mhz56);
        tree.restore_reset_state().unwrap();
        assert_eq!(tree.source(), ClockSource::Internal);
        assert_eq!(tree.registers().cfgr(), 0);
        assert_eq!(tree.registers().cr() & (CR_PLLON | CR_HSEON), 0);
        assert_eq!(tree.registers().cir(), CIR_DISABLE_AND_CLEAR);
        assert_eq!(tree.clocks().core_hz, INTERNAL_OSC_HZ);
    }

    #[test]
    fn divisor_tables_decode() {
        // HSI/2 x 16 (both top PLLMUL encodings), AHB /512, APB1 /16, APB2 /2.
        let sws_pll = 0b10 << CFGR_SWS_SHIFT;
        for mul in [0b1110, 0b1111] {
            let cfgr = sws_pll
                | (mul << CFGR_PLLMUL_SHIFT)
                | (0b1111 << CFGR_HPRE_SHIFT)
                | (0b111 << CFGR_PPRE1_SHIFT)
                | (0b100 << CFGR_PPRE2_SHIFT);
            let c = DerivedClocks::from_registers(cfgr);
            let sysclk = INTERNAL_OSC_HZ / 2 * 16;
            assert_eq!(c.core_hz, sysclk / 512);
            assert_eq!(c.apb1_hz, sysclk / 512 / 16);
            assert_eq!(c.apb2_hz, sysclk / 512 / 2);
            assert_eq!(c.apb2_timer_hz(), c.apb2_hz * 2);
        }

        // 0xxx HPRE encodings are all /1.
        let c = DerivedClocks::from_registers(0b0111 << CFGR_HPRE_SHIFT);
        assert_eq!(c.core_hz, INTERNAL_OSC_HZ);
    }

    #[test]
    fn external_prediv_halves_pll_input() {
        let cfgr = (0b10 << CFGR_SWS_SHIFT)
            | CFGR_PLLSRC
            | CFGR_PLLXTPRE
            | (7 << CFGR_PLLMUL_SHIFT);
        assert_eq!(
            ClockSource::from_cfgr(cfgr).sysclk_hz(cfgr),
            EXTERNAL_OSC_HZ / 2 * 9
        );
    }

    #[test]
    fn wait_state_bands() {
        assert_eq!(min_wait_states(8_000_000), Some(0));
        assert_eq!(min_wait_states(24_000_000), Some(0));
        assert_eq!(min_wait_states(24_000_001), Some(1));
        assert_eq!(min_wait_states(72_000_000), Some(2));
        assert_eq!(min_wait_states(80_000_000), None);
        assert!(!wait_states_sufficient(7, 80_000_000));
    }
}
