//! Host-side models of the hardware the firmware talks to.
//!
//! Time is virtual: nothing sleeps. The slot clock advances when firmware
//! code spins on it and when [`SimRadio`] fast-forwards to the next compare
//! or timer event, so whole measurement cycles run in microseconds of wall
//! time and are fully deterministic.

mod hal;
mod radio;
mod wire;

pub use hal::SimHal;
pub use radio::{RadioStats, SimRadio, TimeslotSession, MAX_STEPS};
pub use wire::{SimDevice, SimOneWire};

use crate::advertiser::Advertiser;
use core::convert::Infallible;
use embedded_hal::digital::{ErrorType, OutputPin};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Default)]
struct ClockState {
    now: Cell<u64>,
    slot_start: Cell<u64>,
}

/// Shared virtual microsecond clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    state: Rc<ClockState>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute time since the simulation started.
    pub fn now_us(&self) -> u64 {
        self.state.now.get()
    }

    /// Time since the current timeslot started.
    pub fn slot_ticks(&self) -> u32 {
        (self.state.now.get() - self.state.slot_start.get()) as u32
    }

    pub fn start_slot(&self) {
        self.state.slot_start.set(self.state.now.get());
    }

    pub fn advance(&self, us: u64) {
        self.state.now.set(self.state.now.get() + us);
    }

    /// Move forward to slot tick `ticks`; never moves backwards.
    pub fn advance_to_tick(&self, ticks: u32) {
        let target = self.state.slot_start.get() + u64::from(ticks);
        if target > self.state.now.get() {
            self.state.now.set(target);
        }
    }
}

impl crate::timeslot::SlotClock for SimClock {
    fn now(&self) -> u32 {
        self.slot_ticks()
    }

    fn spin_until(&self, ticks: u32) {
        self.advance_to_tick(ticks);
    }
}

#[derive(Debug, Default)]
struct PinState {
    high: bool,
    edges: Vec<(u64, bool)>,
    clock: Option<SimClock>,
}

/// Push-pull output that records its level changes.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    state: Rc<RefCell<PinState>>,
}

impl SimPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp every edge with `clock`.
    pub fn with_clock(clock: SimClock) -> Self {
        let pin = Self::default();
        pin.state.borrow_mut().clock = Some(clock);
        pin
    }

    pub fn is_high(&self) -> bool {
        self.state.borrow().high
    }

    /// Level changes as `(time_us, level)`. Untimed pins report time 0.
    pub fn edges(&self) -> Vec<(u64, bool)> {
        self.state.borrow().edges.clone()
    }

    fn drive(&self, high: bool) {
        let mut state = self.state.borrow_mut();
        if state.high != high || state.edges.is_empty() {
            let at = state.clock.as_ref().map_or(0, SimClock::now_us);
            state.edges.push((at, high));
        }
        state.high = high;
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.drive(true);
        Ok(())
    }
}

/// One published advertisement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdvertisedFrame {
    pub primary: i32,
    pub secondary: i32,
    pub exponent: i8,
    pub millivolts: u16,
}

/// Advertiser that keeps every published frame.
#[derive(Debug, Default)]
pub struct RecordingAdvertiser {
    staged: AdvertisedFrame,
    frames: Vec<AdvertisedFrame>,
}

impl RecordingAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[AdvertisedFrame] {
        &self.frames
    }
}

impl Advertiser for RecordingAdvertiser {
    fn set_temperature(&mut self, primary: i32, secondary: i32, exponent: i8) {
        self.staged.primary = primary;
        self.staged.secondary = secondary;
        self.staged.exponent = exponent;
    }

    fn set_voltage(&mut self, millivolts: u16) {
        self.staged.millivolts = millivolts;
    }

    fn update(&mut self) {
        self.frames.push(self.staged);
    }
}
