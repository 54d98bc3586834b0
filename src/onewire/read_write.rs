use super::bits::{BitBuffer, BUFFER_BITS};
use super::physical::PhysicalBus;
use crate::timeslot::{SlotContext, WorkOutcome};
use embedded_hal::digital::{InputPin, OutputPin};

const WRITE0_LOW_US: u32 = 80;
const WRITE1_LOW_US: u32 = 2;
const READ_INIT_US: u32 = 2;
const READ_SAMPLE_US: u32 = 4;
const SLOT_MAX_US: u32 = 120;
const SLOT_MIN_US: u32 = 60;
const RECOVERY_US: u32 = 2;
const SAFETY_MARGIN_US: u32 = 50;

/// Longest single bit: a read slot plus recovery.
pub const BIT_WORST_CASE_US: u32 = SLOT_MAX_US + RECOVERY_US;

/// Slot time required before a bit may start.
pub const BIT_BUDGET_US: u32 = BIT_WORST_CASE_US + SAFETY_MARGIN_US;

/// Drives or samples one bit per time slot.
///
/// Bits whose mask bit is set are written from the write data; all others are
/// read slots, and the sampled level lands at the same index of the received
/// buffer.
#[derive(Debug, Default)]
pub struct ReadWriteSequence {
    running: bool,
    bit_index: usize,
    length: usize,
    write_data: BitBuffer,
    write_mask: BitBuffer,
    read_data: BitBuffer,
}

impl ReadWriteSequence {
    pub const fn new() -> Self {
        Self {
            running: false,
            bit_index: 0,
            length: 0,
            write_data: BitBuffer::new(),
            write_mask: BitBuffer::new(),
            read_data: BitBuffer::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.running
    }

    pub fn start(&mut self, write_data: BitBuffer, write_mask: BitBuffer, length: usize) {
        debug_assert!(self.is_ready(), "transfer started while running");
        assert!(length <= BUFFER_BITS, "transfer of {length} bits exceeds buffer");
        self.bit_index = 0;
        self.length = length;
        self.write_data = write_data;
        self.write_mask = write_mask;
        self.read_data.clear();
        self.running = true;
    }

    pub fn received(&self) -> &BitBuffer {
        &self.read_data
    }

    /// Length of the last started transfer, in bits.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bits already on the wire in the current transfer.
    pub fn position(&self) -> usize {
        self.bit_index
    }

    pub fn do_work<P: OutputPin + InputPin>(
        &mut self,
        line: &mut PhysicalBus<P>,
        ctx: &SlotContext<'_>,
    ) -> WorkOutcome {
        if !self.running {
            return WorkOutcome::Completed;
        }

        while self.bit_index < self.length {
            if !ctx.is_enough_time(BIT_BUDGET_US) {
                return WorkOutcome::NeedMoreTime;
            }

            let index = self.bit_index;
            if self.write_mask.is_one(index) {
                let one = self.write_data.is_one(index);
                line.pull_down();
                ctx.spin_delay(if one { WRITE1_LOW_US } else { WRITE0_LOW_US });
                line.release();
                ctx.spin_delay(if one { SLOT_MIN_US } else { RECOVERY_US });
            } else {
                line.pull_down();
                ctx.spin_delay(READ_INIT_US);
                line.release();
                ctx.spin_delay(READ_SAMPLE_US);
                if line.read() {
                    self.read_data.set_one(index);
                }
                ctx.spin_delay(SLOT_MAX_US - READ_SAMPLE_US - READ_INIT_US);
                ctx.spin_delay(RECOVERY_US);
            }
            self.bit_index += 1;
        }

        self.running = false;
        WorkOutcome::Completed
    }
}
