// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! STM32F103 interrupt numbering (RM0008 table 63, connectivity-line
//! entries excluded).

/// Number of device interrupt lines following the 16 architectural
/// exception slots.
pub const IRQ_COUNT: usize = 43;

/// Device interrupt lines, numbered as IRQn (vector number minus 16).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Interrupt {
    Wwdg = 0,
    Pvd = 1,
    Tamper = 2,
    Rtc = 3,
    Flash = 4,
    Rcc = 5,
    Exti0 = 6,
    Exti1 = 7,
    Exti2 = 8,
    Exti3 = 9,
    Exti4 = 10,
    Dma1Channel1 = 11,
    Dma1Channel2 = 12,
    Dma1Channel3 = 13,
    Dma1Channel4 = 14,
    Dma1Channel5 = 15,
    Dma1Channel6 = 16,
    Dma1Channel7 = 17,
    Adc1_2 = 18,
    UsbHpCanTx = 19,
    UsbLpCanRx0 = 20,
    CanRx1 = 21,
    CanSce = 22,
    Exti9_5 = 23,
    Tim1Brk = 24,
    Tim1Up = 25,
    Tim1TrgCom = 26,
    Tim1Cc = 27,
    Tim2 = 28,
    Tim3 = 29,
    Tim4 = 30,
    I2c1Ev = 31,
    I2c1Er = 32,
    I2c2Ev = 33,
    I2c2Er = 34,
    Spi1 = 35,
    Spi2 = 36,
    Usart1 = 37,
    Usart2 = 38,
    Usart3 = 39,
    Exti15_10 = 40,
    RtcAlarm = 41,
    UsbWakeup = 42,
}

impl Interrupt {
    /// Every interrupt, indexed by IRQ number.
    pub const ALL: [Interrupt; IRQ_COUNT] = {
        use Interrupt::*;
        [
            Wwdg,
            Pvd,
            Tamper,
            Rtc,
            Flash,
            Rcc,
            Exti0,
            Exti1,
            Exti2,
            Exti3,
            Exti4,
            Dma1Channel1,
            Dma1Channel2,
            Dma1Channel3,
            Dma1Channel4,
            Dma1Channel5,
            Dma1Channel6,
            Dma1Channel7,
            Adc1_2,
            UsbHpCanTx,
            UsbLpCanRx0,
            CanRx1,
            CanSce,
            Exti9_5,
            Tim1Brk,
            Tim1Up,
            Tim1TrgCom,
            Tim1Cc,
            Tim2,
            Tim3,
            Tim4,
            I2c1Ev,
            I2c1Er,
            I2c2Ev,
            I2c2Er,
            Spi1,
            Spi2,
            Usart1,
            Usart2,
            Usart3,
            Exti15_10,
            RtcAlarm,
            UsbWakeup,
        ]
    };

    pub const fn irqn(self) -> usize {
        self as usize
    }

    pub fn from_irqn(irqn: usize) -> Option<Self> {
        Self::ALL.get(irqn).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_irqn() {
        for (n, irq) in Interrupt::ALL.iter().enumerate() {
            assert_eq!(irq.irqn(), n);
        }
        assert_eq!(Interrupt::from_irqn(30), Some(Interrupt::Tim4));
        assert_eq!(Interrupt::from_irqn(IRQ_COUNT), None);
    }
}
