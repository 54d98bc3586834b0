use super::{SimClock, SimHal};
use crate::advertiser::Advertiser;
use crate::node::SensorNode;
use crate::power_rail::PowerRailClient;
use crate::scheduler::{EventSender, RadioSignal, SchedulerEvent, SignalAction, TimeslotScheduler};
use crate::timeslot::TimeslotTask;
use embedded_hal::digital::{InputPin, OutputPin};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Upper bound for [`SimRadio::run_until_idle`].
pub const MAX_STEPS: usize = 100_000;

/// Delay between a request and the start of the granted slot.
const GRANT_LATENCY_US: u64 = 150;

/// Anything the simulated radio can hand timeslots to.
pub trait TimeslotSession {
    fn sim_hal(&mut self) -> &mut SimHal;

    /// Slot callback, interrupt context on target.
    fn signal(&mut self, signal: RadioSignal) -> SignalAction;

    /// One pass of the idle loop.
    fn idle(&mut self);
}

impl<T: TimeslotTask> TimeslotSession for TimeslotScheduler<'_, T, SimHal> {
    fn sim_hal(&mut self) -> &mut SimHal {
        self.hal_mut()
    }

    fn signal(&mut self, signal: RadioSignal) -> SignalAction {
        self.on_radio_signal(signal)
    }

    fn idle(&mut self) {
        self.poll();
    }
}

impl<W, R, U, A> TimeslotSession for SensorNode<'_, W, R, U, SimHal, A>
where
    W: OutputPin + InputPin,
    R: PowerRailClient,
    U: OutputPin,
    A: Advertiser,
{
    fn sim_hal(&mut self) -> &mut SimHal {
        self.scheduler_mut().hal_mut()
    }

    fn signal(&mut self, signal: RadioSignal) -> SignalAction {
        self.on_radio_signal(signal)
    }

    fn idle(&mut self) {
        self.poll();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RadioStats {
    pub slots_granted: u32,
    pub requests_blocked: u32,
    pub extensions_granted: u32,
    pub extensions_denied: u32,
    pub timer_events: u32,
}

/// The radio stack's side of the timeslot protocol.
pub struct SimRadio<'q> {
    clock: SimClock,
    events: EventSender<'q>,
    deny_next: u32,
    deny_every: Option<u32>,
    block_next: u32,
    extension_requests: u32,
    stats: RadioStats,
}

impl<'q> SimRadio<'q> {
    pub fn new(clock: SimClock, events: EventSender<'q>) -> Self {
        Self {
            clock,
            events,
            deny_next: 0,
            deny_every: None,
            block_next: 0,
            extension_requests: 0,
            stats: RadioStats::default(),
        }
    }

    /// Deny the next `count` extension requests.
    pub fn deny_extensions(&mut self, count: u32) {
        self.deny_next = count;
    }

    /// Deny every `period`-th extension request; zero turns this off.
    pub fn deny_every(&mut self, period: u32) {
        self.deny_every = (period > 0).then_some(period);
    }

    /// Answer the next `count` requests with a blocked event instead of a slot.
    pub fn block_requests(&mut self, count: u32) {
        self.block_next = count;
    }

    pub fn stats(&self) -> &RadioStats {
        &self.stats
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Run one idle pass and serve whatever it asked for. Returns `false`
    /// once nothing is requested or pending.
    pub fn step<S: TimeslotSession>(&mut self, session: &mut S) -> bool {
        session.idle();

        if let Some(request) = session.sim_hal().take_request() {
            self.clock.advance(GRANT_LATENCY_US);
            if self.block_next > 0 {
                self.block_next -= 1;
                self.stats.requests_blocked += 1;
                self.post(SchedulerEvent::RequestBlocked);
                return true;
            }
            trace!(length_us = request.length_us, "granting timeslot");
            self.run_slot(session);
            return true;
        }

        if let Some(duration_ms) = session.sim_hal().take_long_timer() {
            self.clock.advance(u64::from(duration_ms) * 1_000);
            self.stats.timer_events += 1;
            self.post(SchedulerEvent::LongWaitElapsed);
            return true;
        }

        session.sim_hal().take_request_failure()
    }

    /// Step until the session goes quiet. Returns the number of steps taken.
    pub fn run_until_idle<S: TimeslotSession>(&mut self, session: &mut S) -> usize {
        for steps in 0..MAX_STEPS {
            if !self.step(session) {
                return steps;
            }
        }
        warn!(steps = MAX_STEPS, "session did not go idle");
        MAX_STEPS
    }

    fn run_slot<S: TimeslotSession>(&mut self, session: &mut S) {
        self.clock.start_slot();
        self.stats.slots_granted += 1;

        let mut signal = RadioSignal::Start;
        loop {
            match session.signal(signal) {
                SignalAction::End => return,
                SignalAction::None => {
                    let Some(ticks) = session.sim_hal().take_compare() else {
                        warn!("slot left open without a compare armed");
                        return;
                    };
                    self.clock.advance_to_tick(ticks);
                    signal = RadioSignal::Timer0;
                }
                SignalAction::Extend { length_us } => {
                    if self.should_deny() {
                        debug!(length_us, "extension denied");
                        self.stats.extensions_denied += 1;
                        signal = RadioSignal::ExtendFailed;
                    } else {
                        self.stats.extensions_granted += 1;
                        signal = RadioSignal::ExtendSucceeded;
                    }
                }
                SignalAction::RequestAndEnd(request) => {
                    session.sim_hal().queue_request(request);
                    return;
                }
            }
        }
    }

    fn should_deny(&mut self) -> bool {
        self.extension_requests += 1;
        if self.deny_next > 0 {
            self.deny_next -= 1;
            return true;
        }
        self.deny_every
            .is_some_and(|period| self.extension_requests % period == 0)
    }

    fn post(&mut self, event: SchedulerEvent) {
        if self.events.enqueue(event).is_err() {
            warn!(?event, "scheduler event queue full");
        }
    }
}
