//! Switchable supply branch shared by several consumers.
//!
//! High-current parts of the board sit behind a load switch. Each consumer
//! holds a handle; the switch is on while at least one handle is requested.

use crate::error::CapacityError;
use crate::platform;
use core::cell::{Cell, RefCell};
use embedded_hal::digital::OutputPin;
use tracing::trace;

pub const MAX_RAIL_HANDLES: usize = 16;

/// Consumer side of a power rail.
pub trait PowerRailClient {
    /// Mark this consumer active. Returns `true` only when the rail was off
    /// and has just been switched on.
    fn request(&mut self) -> bool;

    fn release(&mut self);
}

/// For drivers whose peripherals are always powered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRail;

impl PowerRailClient for NoRail {
    fn request(&mut self) -> bool {
        false
    }

    fn release(&mut self) {}
}

pub struct PowerRail<P> {
    enable: RefCell<P>,
    active: Cell<u16>,
    issued: Cell<u8>,
}

impl<P: OutputPin> PowerRail<P> {
    /// Take the enable pin and switch the rail off.
    pub fn new(mut enable: P) -> Self {
        let _ = enable.set_low();
        Self {
            enable: RefCell::new(enable),
            active: Cell::new(0),
            issued: Cell::new(0),
        }
    }

    pub fn handle(&self) -> Result<PowerRailHandle<'_, P>, CapacityError> {
        let id = self.issued.get();
        if usize::from(id) >= MAX_RAIL_HANDLES {
            return Err(CapacityError::RailHandles {
                capacity: MAX_RAIL_HANDLES,
            });
        }
        self.issued.set(id + 1);
        Ok(PowerRailHandle { rail: self, id })
    }

    pub fn is_on(&self) -> bool {
        self.active.get() != 0
    }

    fn request(&self, id: u8) -> bool {
        platform::free(|| {
            let was_on = self.is_on();
            self.active.set(self.active.get() | (1 << id));
            self.apply();
            !was_on
        })
    }

    fn release(&self, id: u8) {
        platform::free(|| {
            self.active.set(self.active.get() & !(1 << id));
            self.apply();
        });
    }

    fn apply(&self) {
        let Ok(mut pin) = self.enable.try_borrow_mut() else {
            return;
        };
        let _ = if self.is_on() {
            pin.set_high()
        } else {
            pin.set_low()
        };
        trace!(active = self.active.get(), "power rail updated");
    }
}

pub struct PowerRailHandle<'r, P> {
    rail: &'r PowerRail<P>,
    id: u8,
}

impl<P: OutputPin> PowerRailClient for PowerRailHandle<'_, P> {
    fn request(&mut self) -> bool {
        self.rail.request(self.id)
    }

    fn release(&mut self) {
        self.rail.release(self.id);
    }
}
