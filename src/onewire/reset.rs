use super::physical::PhysicalBus;
use crate::timeslot::{SlotContext, WorkOutcome};
use embedded_hal::digital::{InputPin, OutputPin};

pub const RESET_LOW_US: u32 = 480;
pub const RESET_HIGH_US: u32 = 480;
pub const PRESENCE_SAMPLE_US: u32 = 90;
const SAFETY_MARGIN_US: u32 = 200;

/// Slot time a reset needs before it may start.
pub const RESET_BUDGET_US: u32 = RESET_LOW_US + RESET_HIGH_US + SAFETY_MARGIN_US;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    Begin,
    ResetPulse,
    WaitPresence,
    Delay,
}

/// Reset pulse followed by presence detection.
#[derive(Debug)]
pub struct ResetSequence {
    state: ResetState,
    slave_present: bool,
}

impl Default for ResetSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetSequence {
    pub const fn new() -> Self {
        Self {
            state: ResetState::Idle,
            slave_present: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ResetState::Idle
    }

    pub fn start(&mut self) {
        debug_assert!(self.is_ready(), "reset started while running");
        self.state = ResetState::Begin;
    }

    /// Result of the last completed reset.
    pub fn is_slave_present(&self) -> bool {
        self.slave_present
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    pub fn do_work<P: OutputPin + InputPin>(
        &mut self,
        line: &mut PhysicalBus<P>,
        ctx: &SlotContext<'_>,
    ) -> WorkOutcome {
        match self.state {
            ResetState::Idle => WorkOutcome::Completed,
            ResetState::Begin => {
                // The whole reset must fit, it cannot be split across slots.
                if !ctx.is_enough_time(RESET_BUDGET_US) {
                    return WorkOutcome::NeedMoreTime;
                }
                line.pull_down();
                self.state = ResetState::ResetPulse;
                ctx.wait_from_now(RESET_LOW_US)
            }
            ResetState::ResetPulse => {
                line.release();
                self.state = ResetState::WaitPresence;
                ctx.wait_from_now(PRESENCE_SAMPLE_US)
            }
            ResetState::WaitPresence => {
                self.slave_present = !line.read();
                self.state = ResetState::Delay;
                ctx.wait_from_now(RESET_HIGH_US - PRESENCE_SAMPLE_US)
            }
            ResetState::Delay => {
                self.state = ResetState::Idle;
                WorkOutcome::Completed
            }
        }
    }
}
