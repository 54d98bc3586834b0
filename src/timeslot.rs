//! The contract between the scheduler and everything it runs.
//!
//! All times are in microseconds. Within a timeslot "ticks" are measured from
//! the moment the slot started, exactly like the hardware timer the radio
//! stack resets at slot start.

/// Free-running microsecond counter of the current timeslot.
pub trait SlotClock {
    /// Microseconds elapsed since the current timeslot started.
    fn now(&self) -> u32;

    /// Busy-wait until [`SlotClock::now`] reaches `ticks`. Returns at once if it already has.
    fn spin_until(&self, ticks: u32);
}

/// What a task wants after one `do_work` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing left to do; the timeslot can be handed back.
    Completed,
    /// Resume at slot tick `until`, inside the current slot.
    ShortWait { until: u32 },
    /// End the slot and ask for a new one after `duration_us`.
    LongWait { duration_us: u32 },
    /// The remaining slot time is too short for the next indivisible step.
    NeedMoreTime,
}

/// Time budget handed to a task for one invocation.
pub struct SlotContext<'a> {
    budget: u32,
    invoked_at: u32,
    clock: &'a dyn SlotClock,
}

impl<'a> SlotContext<'a> {
    /// `slot_length` is the full granted length; `end_margin` of it is never handed out.
    pub fn new(slot_length: u32, end_margin: u32, invoked_at: u32, clock: &'a dyn SlotClock) -> Self {
        Self {
            budget: slot_length.saturating_sub(end_margin),
            invoked_at,
            clock,
        }
    }

    pub fn ticks(&self) -> u32 {
        self.clock.now()
    }

    /// Slot tick at which the task was invoked.
    pub fn invoked_at(&self) -> u32 {
        self.invoked_at
    }

    /// Usable time left, zero once the budget is spent.
    pub fn remaining(&self) -> u32 {
        self.budget.saturating_sub(self.clock.now())
    }

    pub fn is_enough_time(&self, duration: u32) -> bool {
        self.remaining() > duration
    }

    pub fn wait_from_now(&self, duration: u32) -> WorkOutcome {
        WorkOutcome::ShortWait {
            until: self.clock.now().saturating_add(duration),
        }
    }

    pub fn wait_from_invocation(&self, duration: u32) -> WorkOutcome {
        WorkOutcome::ShortWait {
            until: self.invoked_at.saturating_add(duration),
        }
    }

    pub fn long_wait(&self, duration_us: u32) -> WorkOutcome {
        WorkOutcome::LongWait { duration_us }
    }

    pub fn spin_delay(&self, duration: u32) {
        let end = self.clock.now().saturating_add(duration);
        self.clock.spin_until(end);
    }

    pub fn spin_until(&self, ticks: u32) {
        self.clock.spin_until(ticks);
    }
}

/// A unit of work the scheduler can run inside timeslots.
///
/// `do_work` may be called again immediately after it returns, within the same
/// slot, so every implementation is a resumable state machine.
pub trait TimeslotTask {
    /// One-time setup at boot, in registration order. Returns `true` if the
    /// task wants a timeslot right away.
    fn init(&mut self) -> bool;

    fn do_work(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome;

    /// Length of the next timeslot this task needs, queried when a slot is requested.
    fn requested_duration(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeClock(Cell<u32>);

    impl SlotClock for FakeClock {
        fn now(&self) -> u32 {
            self.0.get()
        }

        fn spin_until(&self, ticks: u32) {
            if ticks > self.0.get() {
                self.0.set(ticks);
            }
        }
    }

    #[test]
    fn test_budget_excludes_end_margin() {
        let clock = FakeClock(Cell::new(0));
        let ctx = SlotContext::new(2_000, 200, 0, &clock);

        assert_eq!(ctx.remaining(), 1_800);
        assert!(ctx.is_enough_time(1_799));
        assert!(!ctx.is_enough_time(1_800));
    }

    #[test]
    fn test_remaining_saturates_past_budget() {
        let clock = FakeClock(Cell::new(1_950));
        let ctx = SlotContext::new(2_000, 200, 0, &clock);

        assert_eq!(ctx.remaining(), 0);
        assert!(!ctx.is_enough_time(0));
    }

    #[test]
    fn test_waits_are_anchored_correctly() {
        let clock = FakeClock(Cell::new(100));
        let ctx = SlotContext::new(2_000, 200, 40, &clock);

        assert_eq!(ctx.wait_from_now(480), WorkOutcome::ShortWait { until: 580 });
        assert_eq!(ctx.wait_from_invocation(80), WorkOutcome::ShortWait { until: 120 });
        assert_eq!(ctx.long_wait(375_000), WorkOutcome::LongWait { duration_us: 375_000 });
    }

    #[test]
    fn test_spin_delay_advances_clock() {
        let clock = FakeClock(Cell::new(10));
        let ctx = SlotContext::new(2_000, 200, 10, &clock);

        ctx.spin_delay(60);
        assert_eq!(ctx.ticks(), 70);
        ctx.spin_until(50);
        assert_eq!(ctx.ticks(), 70);
    }
}
