//! The sensor node: everything the firmware runs, wired together once at boot.

use crate::advertiser::Advertiser;
use crate::config::{NodeConfig, TEMPERATURE_EXPONENT};
use crate::ds18b20::{Ds18b20Driver, SensorReading};
use crate::error::{CapacityError, DriverError, UartError};
use crate::fault::{self, ContractViolation};
use crate::onewire::MAX_DEVICES;
use crate::power_rail::PowerRailClient;
use crate::scheduler::{EventReceiver, RadioSignal, SignalAction, TaskId, TimeslotHal, TimeslotScheduler};
use crate::sw_uart::SwUartTransmitter;
use crate::timeslot::{SlotContext, TimeslotTask, WorkOutcome};
use core::fmt;
use embedded_hal::digital::{InputPin, OutputPin};
use heapless::Vec;
use tracing::{debug, info, warn};

/// The fixed set of task kinds the node schedules.
pub enum NodeTask<W, R, U> {
    Thermometer(Ds18b20Driver<W, R>),
    Logger(SwUartTransmitter<U>),
}

impl<W, R, U> TimeslotTask for NodeTask<W, R, U>
where
    W: OutputPin + InputPin,
    R: PowerRailClient,
    U: OutputPin,
{
    fn init(&mut self) -> bool {
        match self {
            NodeTask::Thermometer(driver) => driver.init(),
            NodeTask::Logger(uart) => uart.init(),
        }
    }

    fn do_work(&mut self, ctx: &SlotContext<'_>) -> WorkOutcome {
        match self {
            NodeTask::Thermometer(driver) => driver.do_work(ctx),
            NodeTask::Logger(uart) => uart.do_work(ctx),
        }
    }

    fn requested_duration(&self) -> u32 {
        match self {
            NodeTask::Thermometer(driver) => driver.requested_duration(),
            NodeTask::Logger(uart) => uart.requested_duration(),
        }
    }
}

pub type NodeScheduler<'q, W, R, U, H> = TimeslotScheduler<'q, NodeTask<W, R, U>, H>;

pub struct SensorNode<'q, W, R, U, H, A> {
    scheduler: NodeScheduler<'q, W, R, U, H>,
    advertiser: A,
    thermometer: TaskId,
    logger: Option<TaskId>,
    battery_mv: u16,
    temperature_updated: bool,
    completed_cycles: u32,
}

impl<'q, W, R, U, H, A> SensorNode<'q, W, R, U, H, A>
where
    W: OutputPin + InputPin,
    R: PowerRailClient,
    U: OutputPin,
    H: TimeslotHal,
    A: Advertiser,
{
    /// Register the tasks and run their init. The thermometer is registered
    /// first and so always wins over the logger.
    pub fn new(
        hal: H,
        events: EventReceiver<'q>,
        config: &NodeConfig,
        driver: Ds18b20Driver<W, R>,
        logger: Option<SwUartTransmitter<U>>,
        advertiser: A,
    ) -> Result<Self, CapacityError> {
        let mut scheduler = TimeslotScheduler::new(hal, events, config.scheduler);
        let thermometer = scheduler.add_task(NodeTask::Thermometer(driver))?;
        let logger = match logger {
            Some(uart) => Some(scheduler.add_task(NodeTask::Logger(uart))?),
            None => None,
        };
        scheduler.init();
        info!(tasks = scheduler.task_count(), "sensor node initialized");

        Ok(Self {
            scheduler,
            advertiser,
            thermometer,
            logger,
            battery_mv: 0,
            temperature_updated: false,
            completed_cycles: 0,
        })
    }

    /// Periodic measurement trigger.
    pub fn start_measurement(&mut self) -> Result<(), DriverError> {
        self.driver_mut().start_conversion()?;
        self.temperature_updated = false;
        self.scheduler.request_timeslot(self.thermometer);
        debug!("temperature measurement started");
        Ok(())
    }

    /// Enumerate the bus again, e.g. after sensors were hot-plugged.
    pub fn rediscover(&mut self) -> Result<(), DriverError> {
        self.driver_mut().start_discovery()?;
        self.scheduler.request_timeslot(self.thermometer);
        Ok(())
    }

    pub fn set_battery_voltage(&mut self, millivolts: u16) {
        self.battery_mv = millivolts;
    }

    /// Idle-loop pass: publish fresh results, then let the scheduler request
    /// slots, including one for the log lines just queued. Returns `true`
    /// when an update was published.
    pub fn poll(&mut self) -> bool {
        let updated = self.update_data();
        self.scheduler.poll();
        updated
    }

    pub fn on_radio_signal(&mut self, signal: RadioSignal) -> SignalAction {
        self.scheduler.on_radio_signal(signal)
    }

    /// Queue one log line on the serial logger, if there is one.
    pub fn log(&mut self, args: fmt::Arguments<'_>) -> nb::Result<(), UartError> {
        let Some(id) = self.logger else {
            return Ok(());
        };
        match self.scheduler.task_mut(id) {
            Some(NodeTask::Logger(uart)) => uart.write_line(args)?,
            _ => fault::contract_violation(ContractViolation::TaskMismatch(id)),
        }
        self.scheduler.request_timeslot(id);
        Ok(())
    }

    pub fn driver(&self) -> &Ds18b20Driver<W, R> {
        match self.scheduler.task(self.thermometer) {
            Some(NodeTask::Thermometer(driver)) => driver,
            _ => fault::contract_violation(ContractViolation::TaskMismatch(self.thermometer)),
        }
    }

    pub fn logger(&self) -> Option<&SwUartTransmitter<U>> {
        let id = self.logger?;
        match self.scheduler.task(id) {
            Some(NodeTask::Logger(uart)) => Some(uart),
            _ => fault::contract_violation(ContractViolation::TaskMismatch(id)),
        }
    }

    pub fn scheduler(&self) -> &NodeScheduler<'q, W, R, U, H> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut NodeScheduler<'q, W, R, U, H> {
        &mut self.scheduler
    }

    pub fn advertiser(&self) -> &A {
        &self.advertiser
    }

    pub fn completed_cycles(&self) -> u32 {
        self.completed_cycles
    }

    fn driver_mut(&mut self) -> &mut Ds18b20Driver<W, R> {
        let id = self.thermometer;
        match self.scheduler.task_mut(id) {
            Some(NodeTask::Thermometer(driver)) => driver,
            _ => fault::contract_violation(ContractViolation::TaskMismatch(id)),
        }
    }

    fn update_data(&mut self) -> bool {
        if self.temperature_updated || !self.driver().is_conversion_completed() {
            return false;
        }
        self.temperature_updated = true;

        let readings: Vec<SensorReading, MAX_DEVICES> =
            Vec::from_slice(self.driver().readings()).unwrap_or_default();
        info!(sensors = readings.len(), "temperature conversion completed");

        for reading in &readings {
            info!(
                address = %reading.address,
                temperature = %format_temperature(reading.temperature),
                valid = reading.valid,
                "sensor reading"
            );
            let logged = self.log(format_args!(
                "{} {} {}",
                reading.address,
                format_temperature(reading.temperature),
                if reading.valid { "OK" } else { "STALE" }
            ));
            if logged.is_err() {
                warn!("log buffer full, reading not logged");
            }
        }

        let primary = readings.first().map_or(0, |reading| reading.temperature);
        let secondary = readings.get(1).map_or(0, |reading| reading.temperature);
        self.advertiser
            .set_temperature(primary, secondary, TEMPERATURE_EXPONENT);
        self.advertiser.set_voltage(self.battery_mv);
        self.advertiser.update();
        self.completed_cycles += 1;
        true
    }
}

/// Ten-thousandths of a degree as `-12.3456`.
pub fn format_temperature(value: i32) -> arrayvec::ArrayString<16> {
    let mut text = arrayvec::ArrayString::new();
    let sign = if value < 0 { "-" } else { "" };
    let magnitude = value.unsigned_abs();
    // Sixteen bytes hold any i32 in this layout.
    let _ = fmt::write(
        &mut text,
        format_args!("{sign}{}.{:04}", magnitude / 10_000, magnitude % 10_000),
    );
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_temperature() {
        assert_eq!(format_temperature(250_625).as_str(), "25.0625");
        assert_eq!(format_temperature(-5_000).as_str(), "-0.5000");
        assert_eq!(format_temperature(0).as_str(), "0.0000");
        assert_eq!(format_temperature(-550_000).as_str(), "-55.0000");
    }
}
