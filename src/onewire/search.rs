//! SEARCH ROM enumeration of every device on the bus.
//!
//! Each pass walks the 64 address bits. For every bit the devices answer with
//! the bit and its complement; the master then writes the direction it takes,
//! deselecting every device that disagrees. A `0 0` answer is a discrepancy:
//! both values exist further down the tree. The pass remembers the deepest
//! discrepancy where it went the `0` way, and the next pass takes the `1`
//! branch there, so N devices are found in N passes.

use super::bits::BitBuffer;
use super::bus::{BusTransaction, OneWireBus};
use super::crc::crc8;
use super::rom_command;
use crate::config::CapacityPolicy;
use crate::error::CapacityError;
use crate::fault;
use crate::timeslot::{SlotContext, WorkOutcome};
use embedded_hal::digital::{InputPin, OutputPin};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, info, warn};

pub const MAX_DEVICES: usize = 8;
pub const ADDRESS_BITS: usize = 64;

const_assert!(MAX_DEVICES > 0 && MAX_DEVICES <= u8::MAX as usize);

/// 64-bit ROM code: family byte, 48-bit serial, CRC byte (LSB first).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    /// Build an address with a valid CRC.
    pub fn from_parts(family: u8, serial: u64) -> Self {
        let body = u64::from(family) | ((serial & 0xFFFF_FFFF_FFFF) << 8);
        let crc = crc8(&body.to_le_bytes()[..7]);
        Self(body | (u64::from(crc) << 56))
    }

    pub fn family(self) -> u8 {
        self.0 as u8
    }

    pub fn serial(self) -> u64 {
        (self.0 >> 8) & 0xFFFF_FFFF_FFFF
    }

    pub fn crc(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn is_crc_valid(self) -> bool {
        let bytes = self.0.to_le_bytes();
        crc8(&bytes[..7]) == bytes[7]
    }
}

impl core::fmt::Display for DeviceAddress {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(fmt, "{:016X}", self.0)
    }
}

pub type DeviceList = Vec<DeviceAddress, MAX_DEVICES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchState {
    Idle,
    ResetCmd,
    Search,
}

#[derive(Debug)]
pub struct AddressDiscovery {
    state: SearchState,
    bit_index: usize,
    address: BitBuffer,
    last_discrepancy: Option<usize>,
    last_zero: Option<usize>,
    devices: DeviceList,
    passes: u32,
    dropped: u32,
    policy: CapacityPolicy,
}

impl AddressDiscovery {
    pub fn new(policy: CapacityPolicy) -> Self {
        Self {
            state: SearchState::Idle,
            bit_index: 0,
            address: BitBuffer::new(),
            last_discrepancy: None,
            last_zero: None,
            devices: Vec::new(),
            passes: 0,
            dropped: 0,
            policy,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SearchState::Idle
    }

    /// Forget previous results and issue the first reset.
    pub fn start<P: OutputPin + InputPin>(&mut self, bus: &mut OneWireBus<P>) {
        debug_assert!(self.is_ready(), "discovery started while running");
        self.bit_index = 0;
        self.address.clear();
        self.last_discrepancy = None;
        self.last_zero = None;
        self.devices.clear();
        self.passes = 0;
        self.dropped = 0;
        self.state = SearchState::ResetCmd;
        bus.reset();
    }

    pub fn devices(&self) -> &[DeviceAddress] {
        &self.devices
    }

    /// Search passes run by the last discovery.
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Valid addresses found after the device list was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn do_work<P: OutputPin + InputPin>(
        &mut self,
        bus: &mut OneWireBus<P>,
        ctx: &SlotContext<'_>,
    ) -> WorkOutcome {
        loop {
            if self.state == SearchState::Idle {
                return WorkOutcome::Completed;
            }

            let outcome = bus.do_work(ctx);
            if outcome != WorkOutcome::Completed {
                return outcome;
            }

            match self.state {
                SearchState::ResetCmd => {
                    if bus.is_slave_present() {
                        self.passes += 1;
                        bus.transact(
                            BusTransaction::new(false)
                                .write_byte(rom_command::SEARCH_ROM)
                                .read_bits(2),
                        );
                        self.state = SearchState::Search;
                    } else {
                        debug!("no presence pulse, bus is empty");
                        self.devices.clear();
                        self.state = SearchState::Idle;
                    }
                }
                SearchState::Search => self.on_response(bus),
                SearchState::Idle => {}
            }
        }
    }

    fn on_response<P: OutputPin + InputPin>(&mut self, bus: &mut OneWireBus<P>) {
        let length = bus.transferred_bits();
        let bit = bus.received().is_one(length - 2);
        let complement = bus.received().is_one(length - 1);
        let index = self.bit_index;

        match (bit, complement) {
            (true, false) => self.address.set_one(index),
            (false, true) => self.address.set_zero(index),
            (true, true) => {
                // Nobody answered; the bus changed under us.
                warn!(bit = index, "search aborted, no device responded");
                self.state = SearchState::Idle;
                return;
            }
            (false, false) => {
                let take_one = match self.last_discrepancy {
                    Some(last) if index < last => self.address.is_one(index),
                    Some(last) => index == last,
                    None => false,
                };
                self.address.set(index, take_one);
                if !take_one {
                    self.last_zero = Some(index);
                }
            }
        }

        if index + 1 == ADDRESS_BITS {
            self.finish_pass(bus);
        } else {
            let direction = self.address.is_one(index);
            bus.transact(BusTransaction::new(false).write_bit(direction).read_bits(2));
            self.bit_index += 1;
        }
    }

    fn finish_pass<P: OutputPin + InputPin>(&mut self, bus: &mut OneWireBus<P>) {
        let candidate = DeviceAddress(self.address.load_u64(0));
        let crc_ok = candidate.is_crc_valid();

        if crc_ok {
            if self.devices.push(candidate).is_ok() {
                info!(address = %candidate, "device discovered");
            } else {
                self.dropped += 1;
                fault::capacity_exceeded(
                    self.policy,
                    CapacityError::DeviceList {
                        capacity: MAX_DEVICES,
                    },
                );
            }
        } else {
            warn!(address = %candidate, "discarding address with bad CRC");
        }

        self.bit_index = 0;
        self.last_discrepancy = self.last_zero.take();
        if crc_ok && self.last_discrepancy.is_some() {
            bus.reset();
            self.state = SearchState::ResetCmd;
        } else {
            debug!(
                passes = self.passes,
                devices = self.devices.len(),
                "discovery finished"
            );
            self.state = SearchState::Idle;
        }
    }
}
