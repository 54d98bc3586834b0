//! Bit-banged serial transmitter for log output.
//!
//! Bytes are queued from the foreground and clocked out, 8N1 LSB first, from
//! timeslots. It shares the scheduler with the sensor driver, so log traffic
//! never disturbs 1-Wire timing.

use crate::config::UartConfig;
use crate::error::UartError;
use crate::platform;
use crate::timeslot::{SlotContext, TimeslotTask, WorkOutcome};
use arrayvec::ArrayString;
use core::fmt;
use embedded_hal::digital::OutputPin;
use heapless::Deque;

pub const BUFFER_LEN: usize = 128;

/// Time reserved after each byte on top of the frame itself.
const BYTE_MARGIN_US: u32 = 500;
const FRAME_BITS: u32 = 10;

pub struct SwUartTransmitter<P> {
    pin: P,
    queue: Deque<u8, BUFFER_LEN>,
    bit_period_us: u32,
    slot_length_us: u32,
}

impl<P: OutputPin> SwUartTransmitter<P> {
    /// Take the TX pin and drive it to the idle (mark) level.
    pub fn new(mut pin: P, config: &UartConfig) -> Self {
        let _ = pin.set_high();
        let baud = config.baud_rate.max(1);
        Self {
            pin,
            queue: Deque::new(),
            bit_period_us: (1_000_000 + baud / 2) / baud,
            slot_length_us: config.slot_length_us,
        }
    }

    pub fn bit_period_us(&self) -> u32 {
        self.bit_period_us
    }

    pub fn pending(&self) -> usize {
        platform::free(|| self.queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn free_space(&self) -> usize {
        BUFFER_LEN - self.pending()
    }

    /// Queue as much of `bytes` as fits. Returns how many were taken.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        platform::free(|| {
            let mut accepted = 0;
            for &byte in bytes {
                if self.queue.push_back(byte).is_err() {
                    break;
                }
                accepted += 1;
            }
            accepted
        })
    }

    /// Queue all of `bytes` or nothing.
    pub fn write_all(&mut self, bytes: &[u8]) -> nb::Result<(), UartError> {
        if bytes.len() > BUFFER_LEN {
            return Err(nb::Error::Other(UartError::LineTooLong {
                len: bytes.len(),
                capacity: BUFFER_LEN,
            }));
        }
        if self.free_space() < bytes.len() {
            return Err(nb::Error::WouldBlock);
        }
        self.write(bytes);
        Ok(())
    }

    /// Format one line terminated by CR LF and queue it whole.
    pub fn write_line(&mut self, args: fmt::Arguments<'_>) -> nb::Result<(), UartError> {
        let mut line = ArrayString::<BUFFER_LEN>::new();
        fmt::write(&mut line, args).map_err(|_| nb::Error::Other(UartError::Format))?;
        line.try_push_str("\r\n")
            .map_err(|_| nb::Error::Other(UartError::Format))?;
        self.write_all(line.as_bytes())
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }

    fn send_frame(&mut self, byte: u8, ctx: &SlotContext<'_>) {
        let mut ticks = ctx.ticks();
        let _ = self.pin.set_low();
        for bit in 0..8 {
            ticks += self.bit_period_us;
            ctx.spin_until(ticks);
            let _ = if byte & (1 << bit) != 0 {
                self.pin.set_high()
            } else {
                self.pin.set_low()
            };
        }
        ticks += self.bit_period_us;
        ctx.spin_until(ticks);
        let _ = self.pin.set_high();
        ticks += self.bit_period_us;
        ctx.spin_until(ticks);
    }
}

impl<P: OutputPin> fmt::Write for SwUartTransmitter<P> {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        match self.write_all(text.as_bytes()) {
            Ok(()) => Ok(()),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl<P: OutputPin> TimeslotTask for SwUartTransmitter<P> {
    fn init(&mut self) -> bool {
        false
    }

    fn do_work(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome {
        loop {
            if self.is_empty() {
                return WorkOutcome::Completed;
            }
            if !ctx.is_enough_time(FRAME_BITS * self.bit_period_us + BYTE_MARGIN_US) {
                return WorkOutcome::NeedMoreTime;
            }
            let Some(byte) = platform::free(|| self.queue.pop_front()) else {
                return WorkOutcome::Completed;
            };
            self.send_frame(byte, ctx);
        }
    }

    fn requested_duration(&self) -> u32 {
        self.slot_length_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPin;

    fn transmitter() -> SwUartTransmitter<SimPin> {
        SwUartTransmitter::new(SimPin::new(), &UartConfig::default())
    }

    #[test]
    fn test_bit_period_is_rounded() {
        assert_eq!(transmitter().bit_period_us(), 9);
        let config = UartConfig {
            baud_rate: 9_600,
            ..UartConfig::default()
        };
        assert_eq!(SwUartTransmitter::new(SimPin::new(), &config).bit_period_us(), 104);
    }

    #[test]
    fn test_write_accepts_what_fits() {
        let mut uart = transmitter();
        assert_eq!(uart.write(&[0x41; 100]), 100);
        assert_eq!(uart.write(&[0x42; 100]), 28);
        assert_eq!(uart.free_space(), 0);
    }

    #[test]
    fn test_write_line_is_all_or_nothing() {
        // "T=25\r\n" needs six bytes; leave five free.
        let mut uart = transmitter();
        assert_eq!(uart.write(&[0; BUFFER_LEN - 5]), BUFFER_LEN - 5);

        assert_eq!(uart.write_line(format_args!("T={}", 25)), Err(nb::Error::WouldBlock));
        assert_eq!(uart.pending(), BUFFER_LEN - 5);

        let mut uart = transmitter();
        uart.write(&[0; BUFFER_LEN - 6]);
        uart.write_line(format_args!("T={}", 25)).unwrap();
        assert_eq!(uart.free_space(), 0);

        let mut uart = transmitter();
        uart.write_line(format_args!("T={}", 25)).unwrap();
        assert_eq!(uart.pending(), 6);
    }

    #[test]
    fn test_oversized_line_is_rejected() {
        let mut uart = transmitter();
        let result = uart.write_all(&[0; BUFFER_LEN + 1]);
        assert_eq!(
            result,
            Err(nb::Error::Other(UartError::LineTooLong {
                len: 129,
                capacity: 128
            }))
        );
    }

    #[test]
    fn test_nothing_queued_means_no_slot() {
        let mut uart = transmitter();
        assert!(!uart.init());
        assert_eq!(uart.requested_duration(), 3_000);
    }
}
