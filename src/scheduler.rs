//! Cooperative timeslot scheduler.
//!
//! The radio stack owns the high-precision timer and lends it out in
//! timeslots. This scheduler asks for a slot whenever a registered task has
//! work pending, then drives that task from the radio signal callback until
//! the task completes, waits, or runs out of time.
//!
//! Two execution contexts touch the scheduler:
//!
//! - the radio signal callback ([`TimeslotScheduler::on_radio_signal`]),
//!   which runs at the highest interrupt priority while a slot is active;
//! - the idle loop ([`TimeslotScheduler::poll`]), which requests new slots.
//!
//! Everything else raised from interrupt context (long-wait timer expiry,
//! radio session events) is posted through a single-producer/single-consumer
//! [`EventQueue`] and only applied by `poll`, so the foreground is the sole
//! owner of the state those events change.

use crate::config::SchedulerConfig;
use crate::error::{CapacityError, RadioError};
use crate::fault::{self, ContractViolation};
use crate::timeslot::{SlotClock, SlotContext, TimeslotTask, WorkOutcome};
use heapless::spsc::{Consumer, Producer, Queue};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, trace, warn};

pub const MAX_TASKS: usize = 3;
pub const EVENT_QUEUE_SIZE: usize = 8;

/// Largest "earliest possible" timeout the radio stack accepts.
pub const EARLIEST_TIMEOUT_MAX_US: u32 = 128_000_000;

/// The compare interrupt fires this much later than `until - active_wait_limit`
/// so the residual spin is shorter than the limit but never negative.
const COMPARE_LATENCY_US: u32 = 4;

const_assert!(MAX_TASKS <= u8::MAX as usize);
const_assert!(EVENT_QUEUE_SIZE >= 2);

pub type EventQueue = Queue<SchedulerEvent, EVENT_QUEUE_SIZE>;
pub type EventSender<'q> = Producer<'q, SchedulerEvent, EVENT_QUEUE_SIZE>;
pub type EventReceiver<'q> = Consumer<'q, SchedulerEvent, EVENT_QUEUE_SIZE>;

/// Stable handle of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(u8);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(fmt, "T{:03}", self.0)
    }
}

/// Signals delivered by the radio stack to the slot callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioSignal {
    Start,
    Timer0,
    Radio,
    ExtendFailed,
    ExtendSucceeded,
    Unknown(u8),
}

impl RadioSignal {
    /// Map the radio stack's raw signal number.
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RadioSignal::Start,
            1 => RadioSignal::Timer0,
            2 => RadioSignal::Radio,
            3 => RadioSignal::ExtendFailed,
            4 => RadioSignal::ExtendSucceeded,
            other => RadioSignal::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeslotRequest {
    pub length_us: u32,
    pub timeout_us: u32,
}

/// What the slot callback tells the radio stack to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Keep the slot; the compare interrupt is armed.
    None,
    End,
    Extend { length_us: u32 },
    /// End this slot and queue `request` for a fresh one.
    RequestAndEnd(TimeslotRequest),
}

/// Events raised outside the slot callback, applied by [`TimeslotScheduler::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    LongWaitElapsed,
    RequestBlocked,
    RequestCanceled,
    SessionIdle,
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// No slot held or requested.
    Ready,
    TimeslotRequested,
    ExtendRequested,
    /// Slot held, waiting for the compare interrupt.
    ShortWaiting,
    /// Slot ended, waiting for the millisecond timer.
    LongWaiting,
}

/// Hardware the scheduler needs besides the slot clock.
pub trait TimeslotHal: SlotClock {
    fn request_timeslot(&mut self, request: TimeslotRequest) -> Result<(), RadioError>;

    /// Raise a `Timer0` signal when the slot clock reaches `ticks`.
    fn arm_compare(&mut self, ticks: u32);

    fn disarm_compare(&mut self);

    /// Post [`SchedulerEvent::LongWaitElapsed`] after `duration_ms`.
    fn start_long_timer(&mut self, duration_ms: u32);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub slots_requested: u32,
    pub slots_granted: u32,
    pub request_failures: u32,
    pub extensions_requested: u32,
    pub extensions_denied: u32,
    pub short_waits_armed: u32,
    pub long_waits: u32,
    pub tasks_completed: u32,
}

#[derive(Debug)]
struct TaskSlot<T> {
    task: T,
    /// Requested slot length; zero means nothing pending.
    pending: u32,
}

pub struct TimeslotScheduler<'q, T, H> {
    tasks: Vec<TaskSlot<T>, MAX_TASKS>,
    current: Option<usize>,
    state: SchedulerState,
    timeslot_length: u32,
    requested_length: u32,
    short_wait_end: u32,
    events: EventReceiver<'q>,
    hal: H,
    config: SchedulerConfig,
    stats: SchedulerStats,
}

impl<'q, T: TimeslotTask, H: TimeslotHal> TimeslotScheduler<'q, T, H> {
    pub fn new(hal: H, events: EventReceiver<'q>, config: SchedulerConfig) -> Self {
        Self {
            tasks: Vec::new(),
            current: None,
            state: SchedulerState::Ready,
            timeslot_length: 0,
            requested_length: 0,
            short_wait_end: 0,
            events,
            hal,
            config,
            stats: SchedulerStats::default(),
        }
    }

    /// Register a task. Registration order is selection priority.
    pub fn add_task(&mut self, task: T) -> Result<TaskId, CapacityError> {
        let id = TaskId(self.tasks.len() as u8);
        if self
            .tasks
            .push(TaskSlot { task, pending: 0 })
            .is_err()
        {
            let overflow = CapacityError::TaskTable { capacity: MAX_TASKS };
            fault::capacity_exceeded(self.config.capacity_policy, overflow);
            return Err(overflow);
        }
        debug!(task = %id, "task registered");
        Ok(id)
    }

    /// Run every task's one-time init, in registration order.
    pub fn init(&mut self) {
        for (index, slot) in self.tasks.iter_mut().enumerate() {
            if slot.task.init() {
                slot.pending = slot.task.requested_duration();
                debug!(task = index, duration_us = slot.pending, "task requested timeslot at init");
            }
        }
    }

    /// Mark `id` as wanting a slot of its current requested duration.
    pub fn request_timeslot(&mut self, id: TaskId) {
        let Some(slot) = self.tasks.get_mut(id.index()) else {
            warn!(task = %id, "timeslot requested for unknown task");
            return;
        };
        slot.pending = slot.task.requested_duration();
        debug!(task = %id, duration_us = slot.pending, "timeslot requested");
    }

    /// Idle-loop entry point: apply queued events, then ask the radio stack
    /// for a slot if a task is waiting for one.
    pub fn poll(&mut self) {
        while let Some(event) = self.events.dequeue() {
            self.handle_event(event);
        }

        if self.state != SchedulerState::Ready {
            return;
        }
        if self.current.is_none() && !self.select_next_task() {
            return;
        }

        let request = self.build_request();
        match self.hal.request_timeslot(request) {
            Ok(()) => {
                self.stats.slots_requested += 1;
                debug!(length_us = request.length_us, "timeslot request sent");
            }
            Err(err) => {
                self.stats.request_failures += 1;
                self.requested_length = 0;
                self.set_state(SchedulerState::Ready);
                warn!(%err, "timeslot request failed, retrying on next idle pass");
            }
        }
    }

    /// Radio slot callback. Runs in interrupt context while a slot is active.
    pub fn on_radio_signal(&mut self, signal: RadioSignal) -> SignalAction {
        match signal {
            RadioSignal::Start => {
                self.expect_current(signal);
                self.expect_state(SchedulerState::TimeslotRequested);
                self.timeslot_length = self.requested_length;
                self.requested_length = 0;
                self.stats.slots_granted += 1;
                trace!(length_us = self.timeslot_length, "timeslot started");
                let action = self.run_task();
                self.check_slot_bounds();
                action
            }
            RadioSignal::Timer0 => {
                self.expect_current(signal);
                self.expect_state(SchedulerState::ShortWaiting);
                let action = self.run_task();
                self.check_slot_bounds();
                action
            }
            RadioSignal::ExtendSucceeded => {
                self.expect_current(signal);
                self.expect_state(SchedulerState::ExtendRequested);
                self.timeslot_length += self.requested_length;
                self.requested_length = 0;
                trace!(length_us = self.timeslot_length, "timeslot extended");
                let action = self.run_task();
                self.check_slot_bounds();
                action
            }
            RadioSignal::ExtendFailed => {
                self.expect_current(signal);
                self.expect_state(SchedulerState::ExtendRequested);
                self.stats.extensions_denied += 1;
                debug!("extension denied, requesting a fresh timeslot");
                let request = self.build_request();
                self.check_slot_bounds();
                SignalAction::RequestAndEnd(request)
            }
            RadioSignal::Radio => SignalAction::None,
            RadioSignal::Unknown(raw) => {
                fault::contract_violation(ContractViolation::UnexpectedSignal(raw))
            }
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Task currently holding (or waiting for) a slot.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current.map(|index| TaskId(index as u8))
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.tasks.get(id.index()).is_some_and(|slot| slot.pending > 0)
    }

    /// Granted length of the active slot, extensions included.
    pub fn timeslot_length(&self) -> u32 {
        self.timeslot_length
    }

    pub fn task(&self, id: TaskId) -> Option<&T> {
        self.tasks.get(id.index()).map(|slot| &slot.task)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut T> {
        self.tasks.get_mut(id.index()).map(|slot| &mut slot.task)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        trace!(?event, "scheduler event");
        match event {
            SchedulerEvent::LongWaitElapsed => {
                self.expect_state(SchedulerState::LongWaiting);
                self.set_state(SchedulerState::Ready);
            }
            SchedulerEvent::RequestBlocked | SchedulerEvent::RequestCanceled => {
                self.expect_state(SchedulerState::TimeslotRequested);
                self.set_state(SchedulerState::Ready);
            }
            SchedulerEvent::SessionIdle | SchedulerEvent::SessionClosed => {}
        }
    }

    /// Invoke the current task until it yields something other than a
    /// spin-able short wait.
    fn run_task(&mut self) -> SignalAction {
        let Some(index) = self.current else {
            fault::contract_violation(ContractViolation::UnexpectedState {
                expected: SchedulerState::TimeslotRequested,
                actual: self.state,
            })
        };

        // Finish the residual of an interrupted short wait.
        self.hal.spin_until(self.short_wait_end);
        self.short_wait_end = 0;

        loop {
            let invoked_at = self.hal.now();
            let outcome = {
                let ctx = SlotContext::new(
                    self.timeslot_length,
                    self.config.end_margin_us,
                    invoked_at,
                    &self.hal,
                );
                self.tasks[index].task.do_work(&ctx)
            };

            match outcome {
                WorkOutcome::Completed => {
                    self.tasks[index].pending = 0;
                    self.current = None;
                    self.stats.tasks_completed += 1;
                    self.set_state(SchedulerState::Ready);
                    self.hal.disarm_compare();
                    return SignalAction::End;
                }
                WorkOutcome::ShortWait { until } => {
                    self.tasks[index].pending = 0;
                    let now = self.hal.now();
                    if until <= now {
                        // Already late: resume right away.
                        continue;
                    }
                    if until - now <= self.config.active_wait_limit_us {
                        self.hal.spin_until(until);
                        continue;
                    }
                    let wake = until - self.config.active_wait_limit_us + COMPARE_LATENCY_US;
                    self.hal.arm_compare(wake);
                    self.short_wait_end = until;
                    self.stats.short_waits_armed += 1;
                    self.set_state(SchedulerState::ShortWaiting);
                    return SignalAction::None;
                }
                WorkOutcome::LongWait { duration_us } => {
                    let slot = &mut self.tasks[index];
                    slot.pending = slot.task.requested_duration();
                    self.stats.long_waits += 1;
                    self.set_state(SchedulerState::LongWaiting);
                    self.hal.start_long_timer(duration_us.div_ceil(1_000));
                    self.hal.disarm_compare();
                    return SignalAction::End;
                }
                WorkOutcome::NeedMoreTime => {
                    let slot = &mut self.tasks[index];
                    slot.pending = slot.task.requested_duration();
                    self.requested_length = slot.pending;
                    self.stats.extensions_requested += 1;
                    self.set_state(SchedulerState::ExtendRequested);
                    return SignalAction::Extend {
                        length_us: self.requested_length,
                    };
                }
            }
        }
    }

    /// First registered task with a pending request wins.
    fn select_next_task(&mut self) -> bool {
        self.current = self.tasks.iter().position(|slot| slot.pending > 0);
        if let Some(index) = self.current {
            trace!(task = index, "task selected");
        }
        self.current.is_some()
    }

    fn build_request(&mut self) -> TimeslotRequest {
        let pending = self.current.map_or(0, |index| self.tasks[index].pending);
        let request = TimeslotRequest {
            length_us: pending + self.config.end_margin_us,
            timeout_us: EARLIEST_TIMEOUT_MAX_US,
        };
        self.requested_length = request.length_us;
        self.set_state(SchedulerState::TimeslotRequested);
        request
    }

    fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "scheduler state");
            self.state = state;
        }
    }

    fn expect_state(&self, expected: SchedulerState) {
        if self.state != expected {
            fault::contract_violation(ContractViolation::UnexpectedState {
                expected,
                actual: self.state,
            });
        }
    }

    fn expect_current(&self, signal: RadioSignal) {
        if self.current.is_none() {
            fault::contract_violation(ContractViolation::SignalWithoutTask(signal));
        }
    }

    fn check_slot_bounds(&self) {
        let elapsed = self.hal.now();
        if elapsed >= self.timeslot_length {
            fault::contract_violation(ContractViolation::SlotOverrun {
                length_us: self.timeslot_length,
                elapsed_us: elapsed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct ScriptedHal {
        now: Cell<u32>,
        requests: std::vec::Vec<TimeslotRequest>,
        compare: Option<u32>,
        long_timer_ms: Option<u32>,
    }

    impl SlotClock for ScriptedHal {
        fn now(&self) -> u32 {
            self.now.get()
        }

        fn spin_until(&self, ticks: u32) {
            if ticks > self.now.get() {
                self.now.set(ticks);
            }
        }
    }

    impl TimeslotHal for ScriptedHal {
        fn request_timeslot(&mut self, request: TimeslotRequest) -> Result<(), RadioError> {
            self.requests.push(request);
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

    struct OneShot {
        outcome: WorkOutcome,
        calls: u32,
    }

    impl TimeslotTask for OneShot {
        fn init(&mut self) -> bool {
            true
        }

        fn do_work(&mut self, _ctx: &SlotContext<'_>) -> WorkOutcome {
            self.calls += 1;
            if self.calls == 1 {
                self.outcome
            } else {
                WorkOutcome::Completed
            }
        }

        fn requested_duration(&self) -> u32 {
            1_000
        }
    }

    fn one_shot(outcome: WorkOutcome) -> OneShot {
        OneShot { outcome, calls: 0 }
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(2).to_string(), "T002");
    }

    #[test]
    fn test_raw_signal_mapping() {
        assert_eq!(RadioSignal::from_raw(0), RadioSignal::Start);
        assert_eq!(RadioSignal::from_raw(4), RadioSignal::ExtendSucceeded);
        assert_eq!(RadioSignal::from_raw(9), RadioSignal::Unknown(9));
    }

    #[test]
    fn test_request_includes_end_margin() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler = TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());
        scheduler.add_task(one_shot(WorkOutcome::Completed)).unwrap();
        scheduler.init();

        scheduler.poll();

        assert_eq!(scheduler.state(), SchedulerState::TimeslotRequested);
        assert_eq!(scheduler.hal().requests[0].length_us, 1_200);
        assert_eq!(scheduler.hal().requests[0].timeout_us, EARLIEST_TIMEOUT_MAX_US);
    }

    #[test]
    fn test_short_wait_below_limit_is_spun() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler = TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());
        scheduler
            .add_task(one_shot(WorkOutcome::ShortWait { until: 25 }))
            .unwrap();
        scheduler.init();
        scheduler.poll();

        let action = scheduler.on_radio_signal(RadioSignal::Start);

        assert_eq!(action, SignalAction::End);
        assert_eq!(scheduler.hal().now(), 25);
        assert_eq!(scheduler.stats().short_waits_armed, 0);
    }

    #[test]
    fn test_short_wait_above_limit_arms_compare() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler = TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());
        scheduler
            .add_task(one_shot(WorkOutcome::ShortWait { until: 480 }))
            .unwrap();
        scheduler.init();
        scheduler.poll();

        let action = scheduler.on_radio_signal(RadioSignal::Start);

        assert_eq!(action, SignalAction::None);
        assert_eq!(scheduler.state(), SchedulerState::ShortWaiting);
        assert_eq!(scheduler.hal().compare, Some(480 - 30 + 4));

        // Compare fires early; the residual is spun to the exact end.
        scheduler.hal().spin_until(454);
        let action = scheduler.on_radio_signal(RadioSignal::Timer0);
        assert_eq!(action, SignalAction::End);
        assert_eq!(scheduler.hal().now(), 480);
    }

    #[test]
    fn test_long_wait_rounds_up_to_milliseconds() {
        let mut queue = EventQueue::new();
        let (mut tx, rx) = queue.split();
        let mut scheduler = TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());
        scheduler
            .add_task(one_shot(WorkOutcome::LongWait { duration_us: 375_001 }))
            .unwrap();
        scheduler.init();
        scheduler.poll();

        assert_eq!(scheduler.on_radio_signal(RadioSignal::Start), SignalAction::End);
        assert_eq!(scheduler.hal().long_timer_ms, Some(376));
        assert_eq!(scheduler.state(), SchedulerState::LongWaiting);

        // Nothing is requested until the timer event is consumed.
        scheduler.poll();
        assert_eq!(scheduler.hal().requests.len(), 1);

        tx.enqueue(SchedulerEvent::LongWaitElapsed).unwrap();
        scheduler.poll();
        assert_eq!(scheduler.hal().requests.len(), 2);
        assert_eq!(scheduler.state(), SchedulerState::TimeslotRequested);
    }

    #[test]
    fn test_blocked_request_is_retried() {
        let mut queue = EventQueue::new();
        let (mut tx, rx) = queue.split();
        let mut scheduler = TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());
        scheduler.add_task(one_shot(WorkOutcome::Completed)).unwrap();
        scheduler.init();
        scheduler.poll();

        tx.enqueue(SchedulerEvent::RequestBlocked).unwrap();
        scheduler.poll();

        assert_eq!(scheduler.hal().requests.len(), 2);
        assert_eq!(scheduler.current_task(), Some(TaskId(0)));
    }

    #[test]
    #[should_panic(expected = "no current task")]
    fn test_signal_without_task_halts() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler: TimeslotScheduler<'_, OneShot, _> =
            TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());

        scheduler.on_radio_signal(RadioSignal::Timer0);
    }

    #[test]
    #[should_panic(expected = "no current task")]
    fn test_extend_failed_without_task_halts() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler: TimeslotScheduler<'_, OneShot, _> =
            TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());

        scheduler.on_radio_signal(RadioSignal::ExtendFailed);
    }

    /// Ignores its budget and spins for `spin_us` regardless of the slot.
    struct Overrunning {
        spin_us: u32,
    }

    impl TimeslotTask for Overrunning {
        fn init(&mut self) -> bool {
            true
        }

        fn do_work(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome {
            ctx.spin_delay(self.spin_us);
            WorkOutcome::Completed
        }

        fn requested_duration(&self) -> u32 {
            1_000
        }
    }

    #[test]
    #[should_panic(expected = "timeslot overrun")]
    fn test_slot_overrun_halts() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler = TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());
        // 1 000 us asked for, 1 200 us granted with the end margin.
        scheduler.add_task(Overrunning { spin_us: 1_500 }).unwrap();
        scheduler.init();
        scheduler.poll();

        scheduler.on_radio_signal(RadioSignal::Start);
    }

    #[test]
    #[should_panic(expected = "unexpected radio signal type 7")]
    fn test_unknown_signal_halts() {
        let mut queue = EventQueue::new();
        let (_tx, rx) = queue.split();
        let mut scheduler: TimeslotScheduler<'_, OneShot, _> =
            TimeslotScheduler::new(ScriptedHal::default(), rx, SchedulerConfig::default());

        scheduler.on_radio_signal(RadioSignal::from_raw(7));
    }
}
