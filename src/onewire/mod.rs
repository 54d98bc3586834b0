pub mod bits;
pub mod bus;
pub mod crc;
pub mod physical;
pub mod read_write;
pub mod reset;
pub mod search;

pub use bits::BitBuffer;
pub use bus::{BusTransaction, OneWireBus};
pub use crc::crc8;
pub use physical::PhysicalBus;
pub use read_write::ReadWriteSequence;
pub use reset::ResetSequence;
pub use search::{AddressDiscovery, DeviceAddress, MAX_DEVICES};

/// ROM-level commands understood by every 1-Wire device.
pub mod rom_command {
    pub const SEARCH_ROM: u8 = 0xF0;
    pub const READ_ROM: u8 = 0x33;
    pub const MATCH_ROM: u8 = 0x55;
    pub const SKIP_ROM: u8 = 0xCC;
    pub const ALARM_SEARCH: u8 = 0xEC;
}
