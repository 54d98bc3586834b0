use super::bits::{BitBuffer, BUFFER_BITS};
use super::physical::PhysicalBus;
use super::read_write::ReadWriteSequence;
use super::reset::ResetSequence;
use crate::fault::{self, ContractViolation};
use crate::timeslot::{SlotContext, WorkOutcome};
use embedded_hal::digital::{InputPin, OutputPin};
use tracing::trace;

/// One bus operation: an optional reset, then a mixed read/write transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTransaction {
    reset: bool,
    write_data: BitBuffer,
    write_mask: BitBuffer,
    length: usize,
}

impl BusTransaction {
    pub const fn new(reset: bool) -> Self {
        Self {
            reset,
            write_data: BitBuffer::new(),
            write_mask: BitBuffer::new(),
            length: 0,
        }
    }

    pub fn from_parts(reset: bool, write_data: BitBuffer, write_mask: BitBuffer, length: usize) -> Self {
        assert!(length <= BUFFER_BITS, "transaction of {length} bits exceeds buffer");
        Self {
            reset,
            write_data,
            write_mask,
            length,
        }
    }

    #[must_use]
    pub fn write_bit(mut self, value: bool) -> Self {
        self.write_data.set(self.length, value);
        self.write_mask.set_one(self.length);
        self.length += 1;
        self
    }

    /// Append `value`, LSB first.
    #[must_use]
    pub fn write_byte(self, value: u8) -> Self {
        (0..8).fold(self, |tx, bit| tx.write_bit(value & (1 << bit) != 0))
    }

    #[must_use]
    pub fn write_u64(self, value: u64) -> Self {
        value
            .to_le_bytes()
            .into_iter()
            .fold(self, BusTransaction::write_byte)
    }

    /// Append `count` read slots.
    #[must_use]
    pub fn read_bits(mut self, count: usize) -> Self {
        assert!(self.length + count <= BUFFER_BITS, "transaction exceeds buffer");
        self.length += count;
        self
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn has_reset(&self) -> bool {
        self.reset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPhase {
    Idle,
    Reset,
    ResetThenTransfer,
    Transfer,
}

/// Resumable 1-Wire master on one line.
#[derive(Debug)]
pub struct OneWireBus<P> {
    line: PhysicalBus<P>,
    reset: ResetSequence,
    transfer: ReadWriteSequence,
    phase: BusPhase,
}

impl<P: OutputPin + InputPin> OneWireBus<P> {
    pub fn new(pin: P) -> Self {
        Self {
            line: PhysicalBus::new(pin),
            reset: ResetSequence::new(),
            transfer: ReadWriteSequence::new(),
            phase: BusPhase::Idle,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == BusPhase::Idle
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    /// Reset only, used to probe for presence.
    pub fn reset(&mut self) {
        self.ensure_idle();
        self.reset.start();
        self.phase = BusPhase::Reset;
    }

    pub fn transact(&mut self, tx: BusTransaction) {
        self.ensure_idle();
        trace!(bits = tx.length, reset = tx.reset, "bus transaction");
        if tx.reset {
            self.reset.start();
            self.phase = BusPhase::ResetThenTransfer;
        } else {
            self.phase = BusPhase::Transfer;
        }
        self.transfer.start(tx.write_data, tx.write_mask, tx.length);
    }

    /// Transfer of up to 16 bits given as plain words.
    pub fn read_write_word(&mut self, reset: bool, data: u16, mask: u16, bits: usize) {
        let [data_lo, data_hi] = data.to_le_bytes();
        let [mask_lo, mask_hi] = mask.to_le_bytes();
        let mut write_data = BitBuffer::from_byte(data_lo);
        write_data.set_byte(1, data_hi);
        let mut write_mask = BitBuffer::from_byte(mask_lo);
        write_mask.set_byte(1, mask_hi);
        self.transact(BusTransaction::from_parts(reset, write_data, write_mask, bits));
    }

    pub fn read(&mut self, reset: bool, bits: usize) {
        self.transact(BusTransaction::new(reset).read_bits(bits));
    }

    /// Presence result of the most recent reset.
    pub fn is_slave_present(&self) -> bool {
        self.reset.is_slave_present()
    }

    pub fn received(&self) -> &BitBuffer {
        self.transfer.received()
    }

    /// Length in bits of the most recent transfer.
    pub fn transferred_bits(&self) -> usize {
        self.transfer.len()
    }

    pub fn line(&self) -> &PhysicalBus<P> {
        &self.line
    }

    pub fn do_work(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome {
        loop {
            match self.phase {
                BusPhase::Idle => return WorkOutcome::Completed,
                BusPhase::Reset | BusPhase::ResetThenTransfer => {
                    let outcome = self.reset.do_work(&mut self.line, ctx);
                    if outcome != WorkOutcome::Completed {
                        return outcome;
                    }
                    if self.phase == BusPhase::ResetThenTransfer {
                        self.phase = BusPhase::Transfer;
                        continue;
                    }
                    self.phase = BusPhase::Idle;
                    return outcome;
                }
                BusPhase::Transfer => {
                    let outcome = self.transfer.do_work(&mut self.line, ctx);
                    if outcome == WorkOutcome::Completed {
                        self.phase = BusPhase::Idle;
                    }
                    return outcome;
                }
            }
        }
    }

    fn ensure_idle(&self) {
        if !self.is_ready() {
            fault::contract_violation(ContractViolation::BusBusy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_lays_out_bits_lsb_first() {
        let tx = BusTransaction::new(true)
            .write_byte(0x55)
            .write_u64(0x0102_0304_0506_0708)
            .write_byte(0xBE)
            .read_bits(16);

        assert!(tx.has_reset());
        assert_eq!(tx.len(), 96);
        assert_eq!(tx.write_data.byte(0), 0x55);
        assert_eq!(tx.write_data.load_u64(1), 0x0102_0304_0506_0708);
        assert_eq!(tx.write_data.byte(9), 0xBE);
        assert_eq!(tx.write_mask.byte(9), 0xFF);
        assert_eq!(tx.write_mask.byte(10), 0x00);
        assert_eq!(tx.write_mask.byte(11), 0x00);
    }

    #[test]
    fn test_single_bit_write_then_read() {
        let tx = BusTransaction::new(false).write_bit(true).read_bits(2);

        assert_eq!(tx.len(), 3);
        assert_eq!(tx.write_mask.byte(0), 0x01);
        assert_eq!(tx.write_data.byte(0), 0x01);
    }

    #[test]
    #[should_panic(expected = "exceeds buffer")]
    fn test_oversized_transaction_panics() {
        let _ = BusTransaction::new(false).read_bits(BUFFER_BITS + 1);
    }
}
