use thiserror::Error;

/// A fixed-capacity table had no room left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("task table full ({capacity} tasks)")]
    TaskTable { capacity: usize },
    #[error("device list full ({capacity} devices)")]
    DeviceList { capacity: usize },
    #[error("power rail has no free handles ({capacity} handles)")]
    RailHandles { capacity: usize },
}

/// The radio stack refused a timeslot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("timeslot request rejected (code {0})")]
    Rejected(u32),
    #[error("radio session is not open")]
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("driver is busy with another operation")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UartError {
    #[error("line of {len} bytes exceeds the {capacity}-byte transmit buffer")]
    LineTooLong { len: usize, capacity: usize },
    #[error("line does not fit the formatting buffer")]
    Format,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
