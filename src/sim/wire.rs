//! Simulated open-drain 1-Wire line with DS18B20 slaves.
//!
//! The line is wired-AND: low while the master or any device pulls it. The
//! devices decode the master's pulses by their low time, the way real
//! silicon does: at least 400 µs is a reset, under 15 µs is a `1` (or a read
//! slot), anything in between is a `0`.

use super::SimClock;
use crate::ds18b20::{function_command, FAMILY_CODE};
use crate::onewire::{crc8, rom_command, DeviceAddress};
use core::convert::Infallible;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use std::cell::RefCell;
use std::rc::Rc;

const RESET_MIN_LOW_US: u64 = 400;
const WRITE_ONE_MAX_LOW_US: u64 = 15;
/// A device answering `0` holds the line this long after the falling edge.
const DEVICE_HOLD_US: u64 = 30;
const PRESENCE_DELAY_US: u64 = 15;
const PRESENCE_LENGTH_US: u64 = 240;

/// Scratchpad after power-up: 85 °C, TH 75, TL 70, 12 bits.
const POWER_ON_SCRATCHPAD: [u8; 9] = [0x50, 0x05, 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchStep {
    Bit,
    Complement,
    Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Ignores the line until the next reset.
    Detached,
    RomCommand,
    Search { bit: u8, step: SearchStep },
    MatchRom,
    Function,
    WriteScratchpad { index: usize },
    Transmit,
}

/// Protocol model of one DS18B20.
#[derive(Debug, Clone)]
pub struct SimDevice {
    rom: u64,
    connected: bool,
    temperature_raw: i16,
    scratchpad: [u8; 9],
    eeprom: [u8; 3],
    conversions: u32,
    eeprom_writes: u32,
    mode: Mode,
    rx: u64,
    rx_bits: u32,
    tx: [u8; 9],
    tx_bits: u32,
    tx_pos: u32,
}

impl SimDevice {
    /// A sensor with a valid ROM code that will convert to `temperature_raw`.
    pub fn ds18b20(serial: u64, temperature_raw: i16) -> Self {
        Self::with_rom(DeviceAddress::from_parts(FAMILY_CODE, serial).0, temperature_raw)
    }

    /// A sensor answering with an arbitrary ROM code, CRC not checked.
    pub fn with_rom(rom: u64, temperature_raw: i16) -> Self {
        let mut scratchpad = POWER_ON_SCRATCHPAD;
        scratchpad[8] = crc8(&scratchpad[..8]);
        Self {
            rom,
            connected: true,
            temperature_raw,
            scratchpad,
            eeprom: [scratchpad[2], scratchpad[3], scratchpad[4]],
            conversions: 0,
            eeprom_writes: 0,
            mode: Mode::Detached,
            rx: 0,
            rx_bits: 0,
            tx: [0; 9],
            tx_bits: 0,
            tx_pos: 0,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress(self.rom)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn temperature_raw(&self) -> i16 {
        self.temperature_raw
    }

    /// Configuration register in the scratchpad.
    pub fn config_register(&self) -> u8 {
        self.scratchpad[4]
    }

    /// Configuration register in EEPROM.
    pub fn eeprom_config(&self) -> u8 {
        self.eeprom[2]
    }

    pub fn conversions(&self) -> u32 {
        self.conversions
    }

    pub fn eeprom_writes(&self) -> u32 {
        self.eeprom_writes
    }

    fn rom_bit(&self, bit: u8) -> bool {
        self.rom & (1 << bit) != 0
    }

    fn on_reset(&mut self) {
        self.mode = Mode::RomCommand;
        self.rx = 0;
        self.rx_bits = 0;
    }

    /// Whether this device pulls the line low in a read slot starting now.
    fn answers_zero(&self) -> bool {
        match self.mode {
            Mode::Search { bit, step: SearchStep::Bit } => !self.rom_bit(bit),
            Mode::Search { bit, step: SearchStep::Complement } => self.rom_bit(bit),
            Mode::Transmit => {
                let pos = self.tx_pos as usize;
                self.tx_pos < self.tx_bits && self.tx[pos / 8] & (1 << (pos % 8)) == 0
            }
            _ => false,
        }
    }

    fn receive_byte(&mut self, bit: bool) -> Option<u8> {
        self.rx |= u64::from(bit) << self.rx_bits;
        self.rx_bits += 1;
        if self.rx_bits < 8 {
            return None;
        }
        let byte = self.rx as u8;
        self.rx = 0;
        self.rx_bits = 0;
        Some(byte)
    }

    fn transmit(&mut self, bytes: &[u8]) {
        self.tx = [0; 9];
        self.tx[..bytes.len()].copy_from_slice(bytes);
        self.tx_bits = bytes.len() as u32 * 8;
        self.tx_pos = 0;
        self.mode = Mode::Transmit;
    }

    fn on_slot(&mut self, written: bool) {
        match self.mode {
            Mode::Detached => {}
            Mode::RomCommand => {
                if let Some(command) = self.receive_byte(written) {
                    self.on_rom_command(command);
                }
            }
            Mode::Search { bit, step } => {
                self.mode = match step {
                    SearchStep::Bit => Mode::Search {
                        bit,
                        step: SearchStep::Complement,
                    },
                    SearchStep::Complement => Mode::Search {
                        bit,
                        step: SearchStep::Direction,
                    },
                    SearchStep::Direction if written != self.rom_bit(bit) => Mode::Detached,
                    SearchStep::Direction if bit == 63 => Mode::Function,
                    SearchStep::Direction => Mode::Search {
                        bit: bit + 1,
                        step: SearchStep::Bit,
                    },
                };
            }
            Mode::MatchRom => {
                self.rx |= u64::from(written) << self.rx_bits;
                self.rx_bits += 1;
                if self.rx_bits == 64 {
                    self.mode = if self.rx == self.rom {
                        Mode::Function
                    } else {
                        Mode::Detached
                    };
                    self.rx = 0;
                    self.rx_bits = 0;
                }
            }
            Mode::Function => {
                if let Some(command) = self.receive_byte(written) {
                    self.on_function_command(command);
                }
            }
            Mode::WriteScratchpad { index } => {
                if let Some(byte) = self.receive_byte(written) {
                    // TH, TL, then the configuration register.
                    self.scratchpad[2 + index] = if index == 2 { (byte & 0x60) | 0x1F } else { byte };
                    self.scratchpad[8] = crc8(&self.scratchpad[..8]);
                    self.mode = if index == 2 {
                        Mode::Detached
                    } else {
                        Mode::WriteScratchpad { index: index + 1 }
                    };
                }
            }
            Mode::Transmit => {
                self.tx_pos += 1;
                if self.tx_pos >= self.tx_bits {
                    self.mode = Mode::Detached;
                }
            }
        }
    }

    fn on_rom_command(&mut self, command: u8) {
        self.mode = match command {
            rom_command::SEARCH_ROM => Mode::Search {
                bit: 0,
                step: SearchStep::Bit,
            },
            rom_command::MATCH_ROM => Mode::MatchRom,
            rom_command::SKIP_ROM => Mode::Function,
            rom_command::READ_ROM => {
                self.transmit(&self.rom.to_le_bytes());
                return;
            }
            _ => Mode::Detached,
        };
    }

    fn on_function_command(&mut self, command: u8) {
        match command {
            function_command::CONVERT => {
                let [lo, hi] = self.temperature_raw.to_le_bytes();
                self.scratchpad[0] = lo;
                self.scratchpad[1] = hi;
                self.scratchpad[8] = crc8(&self.scratchpad[..8]);
                self.conversions += 1;
                self.mode = Mode::Detached;
            }
            function_command::READ_SCRATCHPAD => {
                let scratchpad = self.scratchpad;
                self.transmit(&scratchpad);
            }
            function_command::WRITE_SCRATCHPAD => {
                self.mode = Mode::WriteScratchpad { index: 0 };
            }
            function_command::COPY_SCRATCHPAD => {
                self.eeprom.copy_from_slice(&self.scratchpad[2..5]);
                self.eeprom_writes += 1;
                self.mode = Mode::Detached;
            }
            function_command::RECALL_EEPROM => {
                self.scratchpad[2..5].copy_from_slice(&self.eeprom);
                self.scratchpad[8] = crc8(&self.scratchpad[..8]);
                self.mode = Mode::Detached;
            }
            _ => self.mode = Mode::Detached,
        }
    }
}

#[derive(Debug)]
struct WireState {
    clock: SimClock,
    devices: Vec<SimDevice>,
    master_low: bool,
    low_since: u64,
    hold_until: u64,
    presence: Option<(u64, u64)>,
    resets: u32,
    slots: u32,
}

impl WireState {
    fn line_is_high(&self) -> bool {
        let now = self.clock.now_us();
        let presence = self
            .presence
            .is_some_and(|(from, until)| (from..until).contains(&now));
        !(self.master_low || now < self.hold_until || presence)
    }

    fn master_pull(&mut self) {
        if self.master_low {
            return;
        }
        let now = self.clock.now_us();
        self.master_low = true;
        self.low_since = now;
        if self.devices.iter().any(|device| device.connected && device.answers_zero()) {
            self.hold_until = now + DEVICE_HOLD_US;
        }
    }

    fn master_release(&mut self) {
        if !self.master_low {
            return;
        }
        let now = self.clock.now_us();
        self.master_low = false;
        let low_time = now - self.low_since;

        if low_time >= RESET_MIN_LOW_US {
            self.resets += 1;
            self.hold_until = 0;
            let mut any_present = false;
            for device in self.devices.iter_mut().filter(|device| device.connected) {
                device.on_reset();
                any_present = true;
            }
            self.presence = any_present
                .then_some((now + PRESENCE_DELAY_US, now + PRESENCE_DELAY_US + PRESENCE_LENGTH_US));
        } else {
            self.slots += 1;
            let written = low_time < WRITE_ONE_MAX_LOW_US;
            for device in self.devices.iter_mut().filter(|device| device.connected) {
                device.on_slot(written);
            }
        }
    }
}

/// The master's end of the line, usable as the 1-Wire pin.
///
/// Clones share the same line, so a test can keep one to inspect the
/// devices while the driver owns another.
#[derive(Debug, Clone)]
pub struct SimOneWire {
    state: Rc<RefCell<WireState>>,
}

impl SimOneWire {
    pub fn new(clock: SimClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(WireState {
                clock,
                devices: Vec::new(),
                master_low: false,
                low_since: 0,
                hold_until: 0,
                presence: None,
                resets: 0,
                slots: 0,
            })),
        }
    }

    /// Connect a device; returns its index.
    pub fn attach(&self, device: SimDevice) -> usize {
        let mut state = self.state.borrow_mut();
        state.devices.push(device);
        state.devices.len() - 1
    }

    pub fn set_connected(&self, index: usize, connected: bool) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(index) {
            device.connected = connected;
            device.mode = Mode::Detached;
        }
    }

    pub fn set_temperature(&self, index: usize, raw: i16) {
        if let Some(device) = self.state.borrow_mut().devices.get_mut(index) {
            device.temperature_raw = raw;
        }
    }

    /// Snapshot of device `index`.
    pub fn device(&self, index: usize) -> Option<SimDevice> {
        self.state.borrow().devices.get(index).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.state.borrow().devices.len()
    }

    /// Reset pulses seen on the line.
    pub fn resets(&self) -> u32 {
        self.state.borrow().resets
    }

    /// Read/write time slots seen on the line.
    pub fn slots(&self) -> u32 {
        self.state.borrow().slots
    }

    pub fn line_is_high(&self) -> bool {
        self.state.borrow().line_is_high()
    }
}

impl ErrorType for SimOneWire {
    type Error = Infallible;
}

impl OutputPin for SimOneWire {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.state.borrow_mut().master_pull();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.state.borrow_mut().master_release();
        Ok(())
    }
}

impl InputPin for SimOneWire {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.line_is_high())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.line_is_high())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_scratchpad_crc() {
        let device = SimDevice::ds18b20(1, 0);
        assert_eq!(crc8(&device.scratchpad), 0);
        assert_eq!(device.config_register(), 0x7F);
        assert!(device.address().is_crc_valid());
    }

    #[test]
    fn test_reset_produces_presence_window() {
        let clock = SimClock::new();
        let mut wire = SimOneWire::new(clock.clone());
        wire.attach(SimDevice::ds18b20(1, 0));

        wire.set_low().unwrap();
        clock.advance(480);
        wire.set_high().unwrap();
        clock.advance(90);

        assert_eq!(wire.is_high(), Ok(false));
        clock.advance(390);
        assert_eq!(wire.is_high(), Ok(true));
        assert_eq!(wire.resets(), 1);
    }

    #[test]
    fn test_empty_line_has_no_presence() {
        let clock = SimClock::new();
        let mut wire = SimOneWire::new(clock.clone());

        wire.set_low().unwrap();
        clock.advance(480);
        wire.set_high().unwrap();
        clock.advance(90);

        assert_eq!(wire.is_high(), Ok(true));
    }
}
