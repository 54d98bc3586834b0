//! DS18B20 temperature sensor driver.
//!
//! The driver is a [`TimeslotTask`]. After boot it enumerates the bus,
//! optionally writes the resolution into every sensor's EEPROM, and then
//! waits for [`Ds18b20Driver::start_conversion`]. A conversion is broadcast
//! to all sensors at once with SKIP ROM; the results are then read one
//! sensor at a time with MATCH ROM.
//!
//! Temperatures are fixed point with four decimals: `250625` is 25.0625 °C.

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::onewire::rom_command;
use crate::onewire::search::MAX_DEVICES;
use crate::onewire::{crc8, AddressDiscovery, BusTransaction, DeviceAddress, OneWireBus};
use crate::power_rail::PowerRailClient;
use crate::timeslot::{SlotContext, TimeslotTask, WorkOutcome};
use embedded_hal::digital::{InputPin, OutputPin};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const FAMILY_CODE: u8 = 0x28;

pub const SCRATCHPAD_LEN: usize = 9;
/// Scratchpad bytes read in the MATCH ROM transaction; the rest follow
/// without a reset.
const SCRATCHPAD_HEAD: usize = 2;

/// DS18B20 function commands, sent after a ROM command.
pub mod function_command {
    pub const CONVERT: u8 = 0x44;
    pub const WRITE_SCRATCHPAD: u8 = 0x4E;
    pub const READ_SCRATCHPAD: u8 = 0xBE;
    pub const COPY_SCRATCHPAD: u8 = 0x48;
    pub const RECALL_EEPROM: u8 = 0xB8;
    pub const READ_POWER_SUPPLY: u8 = 0xB4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Bits9 = 0,
    Bits10 = 1,
    Bits11 = 2,
    Bits12 = 3,
}

impl Resolution {
    /// Worst-case conversion time from the datasheet.
    pub const fn conversion_time_us(self) -> u32 {
        match self {
            Resolution::Bits9 => 94_000,
            Resolution::Bits10 => 188_000,
            Resolution::Bits11 => 375_000,
            Resolution::Bits12 => 750_000,
        }
    }

    /// Configuration register value; the low five bits read back as ones.
    pub const fn config_register(self) -> u8 {
        ((self as u8) << 5) | 0x1F
    }

    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            9 => Some(Resolution::Bits9),
            10 => Some(Resolution::Bits10),
            11 => Some(Resolution::Bits11),
            12 => Some(Resolution::Bits12),
            _ => None,
        }
    }
}

/// Last result of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub address: DeviceAddress,
    /// Degrees Celsius times 10 000.
    pub temperature: i32,
    /// Set only by a successful read in the current conversion cycle.
    pub valid: bool,
}

impl SensorReading {
    pub const fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            temperature: 0,
            valid: false,
        }
    }

    pub fn whole_degrees(&self) -> i32 {
        self.temperature / 10_000
    }

    /// Absolute fractional part in ten-thousandths.
    pub fn fraction(&self) -> u32 {
        (self.temperature % 10_000).unsigned_abs()
    }
}

/// Scale a raw scratchpad sample (1/16 °C per LSB) to ten-thousandths.
pub const fn decode_temperature(raw: i16) -> i32 {
    raw as i32 * 10_000 / 16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    Init,
    SearchRom,
    WriteScratchpad,
    WriteToEeprom,
    EepromSettle,
    Idle,
    BeforeConversion,
    StartConversion,
    Conversion,
    ReadResult,
    ReadScratchpadTail,
}

pub struct Ds18b20Driver<P, R> {
    bus: OneWireBus<P>,
    discovery: AddressDiscovery,
    rail: R,
    config: DriverConfig,
    state: DriverState,
    sensors: Vec<SensorReading, MAX_DEVICES>,
    current_sensor: usize,
    scratchpad: [u8; SCRATCHPAD_LEN],
    conversion_completed: bool,
}

impl<P, R> Ds18b20Driver<P, R>
where
    P: OutputPin + InputPin,
    R: PowerRailClient,
{
    pub fn new(pin: P, rail: R, config: DriverConfig) -> Self {
        Self {
            bus: OneWireBus::new(pin),
            discovery: AddressDiscovery::new(config.capacity_policy),
            rail,
            config,
            state: DriverState::Init,
            sensors: Vec::new(),
            current_sensor: 0,
            scratchpad: [0; SCRATCHPAD_LEN],
            conversion_completed: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == DriverState::Idle
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.sensors
    }

    pub fn sensors_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_conversion_completed(&self) -> bool {
        self.conversion_completed
    }

    /// Readings of the last finished conversion.
    pub fn latest_readings(&self) -> nb::Result<&[SensorReading], core::convert::Infallible> {
        if self.conversion_completed {
            Ok(&self.sensors)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    /// Begin a conversion cycle. The caller still has to request a timeslot.
    pub fn start_conversion(&mut self) -> Result<(), DriverError> {
        if !self.is_ready() {
            return Err(DriverError::Busy);
        }
        for reading in &mut self.sensors {
            reading.valid = false;
        }
        self.conversion_completed = false;
        self.state = DriverState::BeforeConversion;
        debug!(sensors = self.sensors.len(), "conversion scheduled");
        Ok(())
    }

    /// Enumerate the bus again on the next timeslot.
    pub fn start_discovery(&mut self) -> Result<(), DriverError> {
        if !self.is_ready() {
            return Err(DriverError::Busy);
        }
        self.conversion_completed = false;
        self.state = DriverState::Init;
        Ok(())
    }

    /// Search passes run by the last discovery.
    pub fn discovery_passes(&self) -> u32 {
        self.discovery.passes()
    }

    pub fn dropped_devices(&self) -> u32 {
        self.discovery.dropped()
    }

    pub fn bus(&self) -> &OneWireBus<P> {
        &self.bus
    }

    pub fn rail(&self) -> &R {
        &self.rail
    }

    fn update_rail(&mut self) {
        if self.is_ready() {
            self.rail.release();
        } else if self.rail.request() {
            debug!("sensor power rail switched on");
        }
    }

    fn step(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome {
        loop {
            if self.state == DriverState::SearchRom {
                let outcome = self.discovery.do_work(&mut self.bus, ctx);
                if outcome != WorkOutcome::Completed {
                    return outcome;
                }
                self.on_discovery_finished();
                continue;
            }

            let outcome = self.bus.do_work(ctx);
            if outcome != WorkOutcome::Completed {
                return outcome;
            }

            match self.state {
                DriverState::Init => {
                    self.discovery.start(&mut self.bus);
                    self.state = DriverState::SearchRom;
                }
                DriverState::SearchRom => {}
                DriverState::WriteScratchpad => {
                    self.state = DriverState::WriteToEeprom;
                    self.bus.transact(
                        BusTransaction::new(true)
                            .write_byte(rom_command::SKIP_ROM)
                            .write_byte(function_command::COPY_SCRATCHPAD),
                    );
                }
                DriverState::WriteToEeprom => {
                    self.state = DriverState::EepromSettle;
                    return ctx.long_wait(self.config.eeprom_settle_us);
                }
                DriverState::EepromSettle => {
                    info!(resolution = ?self.config.resolution, "sensors configured");
                    self.state = DriverState::Idle;
                }
                DriverState::Idle => return WorkOutcome::Completed,
                DriverState::BeforeConversion => {
                    if self.sensors.is_empty() {
                        self.state = DriverState::Idle;
                        self.conversion_completed = true;
                        return WorkOutcome::Completed;
                    }
                    self.state = DriverState::StartConversion;
                    self.bus.transact(
                        BusTransaction::new(true)
                            .write_byte(rom_command::SKIP_ROM)
                            .write_byte(function_command::CONVERT),
                    );
                }
                DriverState::StartConversion => {
                    self.state = DriverState::Conversion;
                    self.current_sensor = 0;
                    return ctx.long_wait(self.config.resolution.conversion_time_us());
                }
                DriverState::Conversion => {
                    self.state = DriverState::ReadResult;
                    self.read_result(self.current_sensor);
                }
                DriverState::ReadResult => {
                    if self.store_scratchpad_head() {
                        self.state = DriverState::ReadScratchpadTail;
                        self.bus.read(false, (SCRATCHPAD_LEN - SCRATCHPAD_HEAD) * 8);
                    } else if self.advance_sensor() {
                        return WorkOutcome::Completed;
                    }
                }
                DriverState::ReadScratchpadTail => {
                    self.store_result();
                    if self.advance_sensor() {
                        return WorkOutcome::Completed;
                    }
                }
            }
        }
    }

    /// Move on to the next sensor. Returns `true` once every sensor was read.
    fn advance_sensor(&mut self) -> bool {
        self.current_sensor += 1;
        if self.current_sensor < self.sensors.len() {
            self.state = DriverState::ReadResult;
            self.read_result(self.current_sensor);
            return false;
        }
        self.state = DriverState::Idle;
        self.conversion_completed = true;
        info!(sensors = self.sensors.len(), "conversion completed");
        true
    }

    fn on_discovery_finished(&mut self) {
        self.sensors.clear();
        for &address in self.discovery.devices() {
            // Both lists share MAX_DEVICES, this cannot overflow.
            let _ = self.sensors.push(SensorReading::new(address));
        }
        info!(sensors = self.sensors.len(), "bus enumerated");

        if !self.sensors.is_empty() && self.config.configure_sensors {
            self.state = DriverState::WriteScratchpad;
            // TH and TL alarm registers are unused and cleared.
            self.bus.transact(
                BusTransaction::new(true)
                    .write_byte(rom_command::SKIP_ROM)
                    .write_byte(function_command::WRITE_SCRATCHPAD)
                    .write_byte(0x00)
                    .write_byte(0x00)
                    .write_byte(self.config.resolution.config_register()),
            );
        } else {
            self.state = DriverState::Idle;
        }
    }

    fn read_result(&mut self, index: usize) {
        let address = self.sensors[index].address;
        self.bus.transact(
            BusTransaction::new(true)
                .write_byte(rom_command::MATCH_ROM)
                .write_u64(address.0)
                .write_byte(function_command::READ_SCRATCHPAD)
                .read_bits(16),
        );
    }

    /// Keep the temperature bytes of the MATCH ROM transaction. Returns
    /// `false` when nobody answered the reset.
    fn store_scratchpad_head(&mut self) -> bool {
        if !self.bus.is_slave_present() {
            let reading = &mut self.sensors[self.current_sensor];
            warn!(address = %reading.address, "sensor did not answer");
            reading.valid = false;
            return false;
        }
        let received = self.bus.received();
        let end = self.bus.transferred_bits() / 8;
        self.scratchpad[0] = received.byte(end - 2);
        self.scratchpad[1] = received.byte(end - 1);
        true
    }

    /// Complete the scratchpad and accept it only with a matching CRC. A
    /// sensor gone from a shared bus reads as all ones and fails here.
    fn store_result(&mut self) {
        let received = self.bus.received();
        for (index, byte) in self.scratchpad[SCRATCHPAD_HEAD..].iter_mut().enumerate() {
            *byte = received.byte(index);
        }

        let reading = &mut self.sensors[self.current_sensor];
        if crc8(&self.scratchpad) != 0 {
            warn!(address = %reading.address, "scratchpad CRC mismatch");
            reading.valid = false;
            return;
        }

        let raw = i16::from_le_bytes([self.scratchpad[0], self.scratchpad[1]]);
        reading.temperature = decode_temperature(raw);
        reading.valid = true;
        debug!(address = %reading.address, raw, "sensor read");
    }
}

impl<P, R> TimeslotTask for Ds18b20Driver<P, R>
where
    P: OutputPin + InputPin,
    R: PowerRailClient,
{
    fn init(&mut self) -> bool {
        true
    }

    fn do_work(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome {
        self.update_rail();
        let outcome = self.step(ctx);
        self.update_rail();
        outcome
    }

    fn requested_duration(&self) -> u32 {
        self.config.slot_length_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scales_by_sixteenths() {
        assert_eq!(decode_temperature(0x0191), 250_625);
        assert_eq!(decode_temperature(0x07D0), 1_250_000);
        assert_eq!(decode_temperature(0), 0);
        // -10.125 °C
        assert_eq!(decode_temperature(0xFF5E_u16 as i16), -101_250);
        // -55 °C
        assert_eq!(decode_temperature(0xFC90_u16 as i16), -550_000);
    }

    #[test]
    fn test_config_register() {
        assert_eq!(Resolution::Bits9.config_register(), 0x1F);
        assert_eq!(Resolution::Bits11.config_register(), 0x5F);
        assert_eq!(Resolution::Bits12.config_register(), 0x7F);
    }

    #[test]
    fn test_conversion_times() {
        assert_eq!(Resolution::Bits9.conversion_time_us(), 94_000);
        assert_eq!(Resolution::Bits12.conversion_time_us(), 750_000);
        assert_eq!(Resolution::from_bits(10), Some(Resolution::Bits10));
        assert_eq!(Resolution::from_bits(8), None);
    }

    #[test]
    fn test_reading_formatting_parts() {
        let reading = SensorReading {
            address: DeviceAddress(0),
            temperature: -101_250,
            valid: true,
        };
        assert_eq!(reading.whole_degrees(), -10);
        assert_eq!(reading.fraction(), 1_250);
    }
}
