//! Unrecoverable contract violations.
//!
//! A violation means the scheduler/task contract is broken and no caller can
//! safely continue: it is logged and the firmware halts.

use crate::config::CapacityPolicy;
use crate::error::CapacityError;
use crate::platform;
use crate::scheduler::{RadioSignal, SchedulerState, TaskId};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("radio signal {0:?} arrived with no current task")]
    SignalWithoutTask(RadioSignal),
    #[error("unexpected radio signal type {0}")]
    UnexpectedSignal(u8),
    #[error("scheduler in state {actual:?}, expected {expected:?}")]
    UnexpectedState {
        expected: SchedulerState,
        actual: SchedulerState,
    },
    #[error("timeslot overrun: {elapsed_us} us elapsed of {length_us} us granted")]
    SlotOverrun { length_us: u32, elapsed_us: u32 },
    #[error("1-Wire bus started while a transaction is in flight")]
    BusBusy,
    #[error("task {0} is not of the expected kind")]
    TaskMismatch(TaskId),
    #[error("capacity exceeded: {0}")]
    Capacity(CapacityError),
}

/// Log `violation` and halt.
pub fn contract_violation(violation: ContractViolation) -> ! {
    error!(%violation, "contract violation, halting");
    platform::halt(&violation)
}

/// Apply `policy` to a table overflow: warn and carry on, or halt.
pub fn capacity_exceeded(policy: CapacityPolicy, overflow: CapacityError) {
    match policy {
        CapacityPolicy::LogAndIgnore => warn!(%overflow, "entry dropped"),
        CapacityPolicy::Fault => contract_violation(ContractViolation::Capacity(overflow)),
    }
}
