use clap::{App, Arg};
use colored::*;
use serde::Serialize;
use thermonode::config::NodeConfig;
use thermonode::ds18b20::{Ds18b20Driver, Resolution, SensorReading};
use thermonode::node::{format_temperature, SensorNode};
use thermonode::power_rail::PowerRail;
use thermonode::scheduler::{EventQueue, SchedulerStats};
use thermonode::sim::{
    AdvertisedFrame, RadioStats, RecordingAdvertiser, SimClock, SimDevice, SimHal, SimOneWire,
    SimPin, SimRadio,
};
use thermonode::sw_uart::SwUartTransmitter;
use tracing::info;

const DEFAULT_SENSORS: &str = "2";
const DEFAULT_CYCLES: &str = "3";
const DEFAULT_BATTERY_MV: &str = "2950";
const FIRST_SERIAL: u64 = 0x0000_0000_1000;

#[derive(Debug, Serialize)]
struct CycleReport {
    cycle: u32,
    time_ms: u64,
    readings: Vec<SensorReading>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    sensors_found: usize,
    discovery_passes: u32,
    cycles: Vec<CycleReport>,
    scheduler: SchedulerStats,
    radio: RadioStats,
    advertisements: Vec<AdvertisedFrame>,
    rail_switches: usize,
}

fn numeric(value: String) -> Result<(), String> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| format!("'{value}' is not a number"))
}

/// Raw sample of sensor `index` in `cycle`: around 20 °C, drifting up.
fn sample_temperature(index: usize, cycle: u32) -> i16 {
    0x0140 + (index as i16) * 0x18 + (cycle as i16) * 3
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the report only.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let matches = App::new("thermonode-sim")
        .version("0.1.0")
        .about("Runs the sensor node firmware against simulated DS18B20 sensors and radio")
        .arg(
            Arg::with_name("sensors")
                .short("n")
                .long("sensors")
                .value_name("COUNT")
                .help("Number of simulated sensors on the bus")
                .takes_value(true)
                .default_value(DEFAULT_SENSORS)
                .validator(numeric),
        )
        .arg(
            Arg::with_name("cycles")
                .short("c")
                .long("cycles")
                .value_name("COUNT")
                .help("Measurement cycles to run")
                .takes_value(true)
                .default_value(DEFAULT_CYCLES)
                .validator(numeric),
        )
        .arg(
            Arg::with_name("deny-extensions")
                .short("d")
                .long("deny-extensions")
                .value_name("PERIOD")
                .help("Deny every PERIOD-th timeslot extension (0 grants all)")
                .takes_value(true)
                .default_value("0")
                .validator(numeric),
        )
        .arg(
            Arg::with_name("resolution")
                .short("r")
                .long("resolution")
                .value_name("BITS")
                .help("Sensor resolution")
                .takes_value(true)
                .possible_values(&["9", "10", "11", "12"]),
        )
        .arg(
            Arg::with_name("battery")
                .long("battery-mv")
                .value_name("MILLIVOLTS")
                .help("Battery voltage reported with each advertisement")
                .takes_value(true)
                .default_value(DEFAULT_BATTERY_MV)
                .validator(numeric),
        )
        .arg(
            Arg::with_name("uart")
                .long("uart")
                .help("Enable the software UART logger task"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("JSON node configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(bits) = matches.value_of("resolution") {
        config.driver.resolution = Resolution::from_bits(bits.parse()?).ok_or("unsupported resolution")?;
    }
    if matches.is_present("uart") {
        config.uart.enabled = true;
    }
    let sensors: usize = matches.value_of("sensors").unwrap_or(DEFAULT_SENSORS).parse()?;
    let cycles: u32 = matches.value_of("cycles").unwrap_or(DEFAULT_CYCLES).parse()?;
    let deny_every: u32 = matches.value_of("deny-extensions").unwrap_or("0").parse()?;
    let battery_mv: u16 = matches.value_of("battery").unwrap_or(DEFAULT_BATTERY_MV).parse()?;

    let clock = SimClock::new();
    let wire = SimOneWire::new(clock.clone());
    for index in 0..sensors {
        wire.attach(SimDevice::ds18b20(
            FIRST_SERIAL + index as u64,
            sample_temperature(index, 0),
        ));
    }

    let rail_pin = SimPin::with_clock(clock.clone());
    let rail = PowerRail::new(rail_pin.clone());
    let driver = Ds18b20Driver::new(wire.clone(), rail.handle()?, config.driver);
    let logger = config
        .uart
        .enabled
        .then(|| SwUartTransmitter::new(SimPin::with_clock(clock.clone()), &config.uart));

    let mut queue = EventQueue::new();
    let (events_tx, events_rx) = queue.split();
    let mut node = SensorNode::new(
        SimHal::new(clock.clone()),
        events_rx,
        &config,
        driver,
        logger,
        RecordingAdvertiser::new(),
    )?;
    node.set_battery_voltage(battery_mv);

    let mut radio = SimRadio::new(clock.clone(), events_tx);
    radio.deny_every(deny_every);

    radio.run_until_idle(&mut node);
    info!(sensors = node.driver().sensors_count(), "discovery finished");

    let mut reports = Vec::new();
    for cycle in 0..cycles {
        for index in 0..wire.device_count() {
            wire.set_temperature(index, sample_temperature(index, cycle));
        }
        node.start_measurement()?;
        radio.run_until_idle(&mut node);
        reports.push(CycleReport {
            cycle,
            time_ms: clock.now_us() / 1_000,
            readings: node.driver().readings().to_vec(),
        });
        clock.advance(u64::from(config.measurement_interval_ms) * 1_000);
    }

    let report = SimulationReport {
        sensors_found: node.driver().sensors_count(),
        discovery_passes: node.driver().discovery_passes(),
        cycles: reports,
        scheduler: *node.scheduler().stats(),
        radio: *radio.stats(),
        advertisements: node.advertiser().frames().to_vec(),
        // The first recorded edge is the initial level set by `PowerRail::new`.
        rail_switches: rail_pin.edges().len().saturating_sub(1),
    };

    match matches.value_of("format") {
        Some("json") => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_table(&report),
    }

    Ok(())
}

fn print_table(report: &SimulationReport) {
    println!("{}", "🌡️  Thermonode Simulation".bright_blue().bold());
    println!(
        "Sensors found: {} ({} search passes)",
        report.sensors_found.to_string().bright_white(),
        report.discovery_passes
    );

    for cycle in &report.cycles {
        println!();
        println!(
            "{} {} at {} ms",
            "Cycle".bright_white().bold(),
            cycle.cycle,
            cycle.time_ms
        );
        if cycle.readings.is_empty() {
            println!("  {}", "no sensors".yellow());
        }
        for reading in &cycle.readings {
            let temperature = format!("{:>10} °C", format_temperature(reading.temperature).as_str());
            let (temperature, status) = if reading.valid {
                (temperature.green(), "OK".green())
            } else {
                (temperature.yellow(), "STALE".yellow())
            };
            println!("  {}  {}  {}", reading.address.to_string().bright_cyan(), temperature, status);
        }
    }

    println!();
    println!("{}", "Scheduler".bright_white().bold());
    println!(
        "  slots requested {}  granted {}  extensions {} (denied {})  long waits {}",
        report.scheduler.slots_requested,
        report.scheduler.slots_granted,
        report.scheduler.extensions_requested,
        report.scheduler.extensions_denied.to_string().yellow(),
        report.scheduler.long_waits
    );
    println!(
        "  radio slots {}  timer events {}  rail switches {}  advertisements {}",
        report.radio.slots_granted,
        report.radio.timer_events,
        report.rail_switches,
        report.advertisements.len()
    );
}
