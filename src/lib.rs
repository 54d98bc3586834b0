//! # Thermonode
//!
//! Firmware core of a battery-powered wireless temperature sensor node. The
//! node bit-bangs a 1-Wire bus while the radio stack hands out exclusive
//! access to the high-precision timer in short, negotiated timeslots.
//!
//! ## Features
//!
//! - **Cooperative timeslot scheduling**: resumable tasks, slot extension,
//!   retry after a denied extension, long waits outside of a slot
//! - **1-Wire protocol engine**: reset/presence, per-bit read/write, ROM search
//! - **DS18B20 driver**: discovery, resolution setup, conversion, readout
//! - **Power rail sharing**: reference-counted supply branch switching
//! - **Software UART logger**: a second task sharing the same timeslots
//! - **Host simulation**: timer, radio and 1-Wire line models for tests
//! - **Embedded-friendly**: no heap allocations in the firmware path
//!
//! ## Quick Start
//!
//! ```rust
//! use thermonode::config::DriverConfig;
//! use thermonode::ds18b20::Ds18b20Driver;
//! use thermonode::power_rail::NoRail;
//! use thermonode::sim::{SimClock, SimDevice, SimOneWire};
//!
//! let clock = SimClock::new();
//! let wire = SimOneWire::new(clock.clone());
//! wire.attach(SimDevice::ds18b20(0x0000_0000_12AB, 0x0191));
//!
//! let driver = Ds18b20Driver::new(wire, NoRail, DriverConfig::default());
//! assert!(!driver.is_ready());
//! ```
//!
//! ## Architecture
//!
//! - [`scheduler`] - Timeslot negotiation and task dispatch
//! - [`timeslot`] - Task contract and per-invocation slot budget
//! - [`onewire`] - Bit buffer, CRC, line driver, sequences, bus, ROM search
//! - [`ds18b20`] - Temperature sensor driver task
//! - [`node`] - Process-wide context wiring the tasks together
//! - [`sim`] - Host-side hardware models

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod advertiser;
pub mod config;
pub mod ds18b20;
pub mod error;
pub mod fault;
pub mod node;
pub mod onewire;
pub mod platform;
pub mod power_rail;
pub mod scheduler;
pub mod sim;
pub mod sw_uart;
pub mod timeslot;

// Re-export main public types for convenience
pub use ds18b20::{Ds18b20Driver, SensorReading};
pub use node::SensorNode;
pub use scheduler::{TaskId, TimeslotScheduler};
pub use timeslot::{SlotContext, TimeslotTask, WorkOutcome};
