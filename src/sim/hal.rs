use super::SimClock;
use crate::error::RadioError;
use crate::scheduler::{TimeslotHal, TimeslotRequest};
use crate::timeslot::SlotClock;
use tracing::trace;

/// Radio-stack facing hardware of the scheduler, backed by [`SimClock`].
///
/// Requests, the compare channel and the millisecond timer are only
/// recorded here; [`super::SimRadio`] acts on them.
#[derive(Debug)]
pub struct SimHal {
    clock: SimClock,
    request: Option<TimeslotRequest>,
    compare: Option<u32>,
    long_timer_ms: Option<u32>,
    reject_requests: u32,
    last_request_failed: bool,
}

impl SimHal {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            request: None,
            compare: None,
            long_timer_ms: None,
            reject_requests: 0,
            last_request_failed: false,
        }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Refuse the next `count` timeslot requests.
    pub fn reject_requests(&mut self, count: u32) {
        self.reject_requests = count;
    }

    pub fn take_request(&mut self) -> Option<TimeslotRequest> {
        self.request.take()
    }

    /// Queue a request on behalf of the radio stack, as after an end-and-request.
    pub fn queue_request(&mut self, request: TimeslotRequest) {
        self.request = Some(request);
    }

    pub fn compare(&self) -> Option<u32> {
        self.compare
    }

    pub fn take_compare(&mut self) -> Option<u32> {
        self.compare.take()
    }

    pub fn take_long_timer(&mut self) -> Option<u32> {
        self.long_timer_ms.take()
    }

    pub fn take_request_failure(&mut self) -> bool {
        core::mem::take(&mut self.last_request_failed)
    }
}

impl SlotClock for SimHal {
    fn now(&self) -> u32 {
        self.clock.slot_ticks()
    }

    fn spin_until(&self, ticks: u32) {
        self.clock.advance_to_tick(ticks);
    }
}

impl TimeslotHal for SimHal {
    fn request_timeslot(&mut self, request: TimeslotRequest) -> Result<(), RadioError> {
        if self.reject_requests > 0 {
            self.reject_requests -= 1;
            self.last_request_failed = true;
            return Err(RadioError::Rejected(8));
        }
        trace!(?request, "timeslot request recorded");
        self.request = Some(request);
        Ok(())
    }

    fn arm_compare(&mut self, ticks: u32) {
        self.compare = Some(ticks);
    }

    fn disarm_compare(&mut self) {
        self.compare = None;
    }

    fn start_long_timer(&mut self, duration_ms: u32) {
        self.long_timer_ms = Some(duration_ms);
    }
}
