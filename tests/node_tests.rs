use thermonode::config::{NodeConfig, TEMPERATURE_EXPONENT};
use thermonode::ds18b20::Ds18b20Driver;
use thermonode::node::{format_temperature, SensorNode};
use thermonode::power_rail::NoRail;
use thermonode::scheduler::EventQueue;
use thermonode::sim::{
    AdvertisedFrame, RecordingAdvertiser, SimClock, SimDevice, SimHal, SimOneWire, SimPin, SimRadio,
};
use thermonode::sw_uart::SwUartTransmitter;

/// Recover 8N1 bytes from the recorded edges of a UART pin.
fn decode_uart(edges: &[(u64, bool)], bit_period_us: u64) -> Vec<u8> {
    let level_at = |time: u64| {
        edges
            .iter()
            .take_while(|(at, _)| *at <= time)
            .last()
            .map_or(true, |(_, high)| *high)
    };

    let mut bytes = Vec::new();
    let mut cursor = 0;
    while let Some(&(start, _)) = edges.iter().find(|(at, high)| *at >= cursor && !*high) {
        let byte = (0..8).fold(0_u8, |byte, bit| {
            let sample = start + bit_period_us * (bit + 1) + bit_period_us / 2;
            byte | (u8::from(level_at(sample)) << bit)
        });
        bytes.push(byte);
        cursor = start + bit_period_us * 10;
    }
    bytes
}

#[test]
fn test_each_cycle_publishes_one_advertisement() {
    let clock = SimClock::new();
    let wire = SimOneWire::new(clock.clone());
    wire.attach(SimDevice::ds18b20(0x0000_0000_0A01, 0x0191));
    wire.attach(SimDevice::ds18b20(0x0000_0000_0A02, 0x0050));
    let config = NodeConfig::default();
    let driver = Ds18b20Driver::new(wire.clone(), NoRail, config.driver);

    let mut queue = EventQueue::new();
    let (tx, rx) = queue.split();
    let mut node = SensorNode::new(
        SimHal::new(clock.clone()),
        rx,
        &config,
        driver,
        None::<SwUartTransmitter<SimPin>>,
        RecordingAdvertiser::new(),
    )
    .unwrap();
    node.set_battery_voltage(2_950);
    let mut radio = SimRadio::new(clock.clone(), tx);

    radio.run_until_idle(&mut node);
    assert_eq!(node.driver().sensors_count(), 2);
    assert!(node.advertiser().frames().is_empty());

    for cycle in 1..=3 {
        node.start_measurement().unwrap();
        radio.run_until_idle(&mut node);
        assert_eq!(node.completed_cycles(), cycle);
        assert_eq!(node.advertiser().frames().len(), cycle as usize);
    }

    // Polling again without a new measurement publishes nothing.
    assert!(!node.poll());
    assert_eq!(node.advertiser().frames().len(), 3);

    let readings = node.driver().readings();
    let expected = AdvertisedFrame {
        primary: readings[0].temperature,
        secondary: readings[1].temperature,
        exponent: TEMPERATURE_EXPONENT,
        millivolts: 2_950,
    };
    assert_eq!(node.advertiser().frames()[2], expected);
    assert_eq!(expected.exponent, -4);
    let mut published = [expected.primary, expected.secondary];
    published.sort_unstable();
    assert_eq!(published, [50_000, 250_625]);
}

#[test]
fn test_empty_bus_advertises_zeroes() {
    let clock = SimClock::new();
    let wire = SimOneWire::new(clock.clone());
    let config = NodeConfig::default();
    let driver = Ds18b20Driver::new(wire, NoRail, config.driver);

    let mut queue = EventQueue::new();
    let (tx, rx) = queue.split();
    let mut node = SensorNode::new(
        SimHal::new(clock.clone()),
        rx,
        &config,
        driver,
        None::<SwUartTransmitter<SimPin>>,
        RecordingAdvertiser::new(),
    )
    .unwrap();
    node.set_battery_voltage(3_100);
    let mut radio = SimRadio::new(clock.clone(), tx);
    radio.run_until_idle(&mut node);

    node.start_measurement().unwrap();
    radio.run_until_idle(&mut node);

    assert_eq!(
        node.advertiser().frames(),
        [AdvertisedFrame {
            primary: 0,
            secondary: 0,
            exponent: -4,
            millivolts: 3_100,
        }]
    );
}

#[test]
fn test_measurement_while_busy_is_refused() {
    let clock = SimClock::new();
    let wire = SimOneWire::new(clock.clone());
    wire.attach(SimDevice::ds18b20(0x0000_0000_0A01, 0x0191));
    let config = NodeConfig::default();
    let driver = Ds18b20Driver::new(wire, NoRail, config.driver);

    let mut queue = EventQueue::new();
    let (_tx, rx) = queue.split();
    let mut node = SensorNode::new(
        SimHal::new(clock),
        rx,
        &config,
        driver,
        None::<SwUartTransmitter<SimPin>>,
        RecordingAdvertiser::new(),
    )
    .unwrap();

    // Boot discovery has been requested but not run.
    assert!(node.start_measurement().is_err());
    assert!(node.rediscover().is_err());
    assert_eq!(node.log(format_args!("ignored")), Ok(()));
}

#[test]
fn test_readings_are_logged_over_uart() {
    let clock = SimClock::new();
    let wire = SimOneWire::new(clock.clone());
    wire.attach(SimDevice::ds18b20(0x0000_0000_0A01, 0x0191));
    let mut config = NodeConfig::default();
    config.uart.enabled = true;
    let driver = Ds18b20Driver::new(wire.clone(), NoRail, config.driver);
    let uart_pin = SimPin::with_clock(clock.clone());
    let logger = SwUartTransmitter::new(uart_pin.clone(), &config.uart);
    let bit_period_us = u64::from(logger.bit_period_us());

    let mut queue = EventQueue::new();
    let (tx, rx) = queue.split();
    let mut node = SensorNode::new(
        SimHal::new(clock.clone()),
        rx,
        &config,
        driver,
        Some(logger),
        RecordingAdvertiser::new(),
    )
    .unwrap();
    let mut radio = SimRadio::new(clock.clone(), tx);
    radio.run_until_idle(&mut node);

    node.log(format_args!("boot {}", 42)).unwrap();
    node.start_measurement().unwrap();
    radio.run_until_idle(&mut node);

    assert!(node.logger().unwrap().is_empty());
    let address = wire.device(0).unwrap().address();
    let expected = format!(
        "boot 42\r\n{} {} OK\r\n",
        address,
        format_temperature(250_625).as_str()
    );
    let received = decode_uart(&uart_pin.edges(), bit_period_us);
    assert_eq!(String::from_utf8(received).unwrap(), expected);
    assert!(uart_pin.is_high());
}

#[test]
fn test_rediscovery_through_the_node() {
    let clock = SimClock::new();
    let wire = SimOneWire::new(clock.clone());
    wire.attach(SimDevice::ds18b20(0x0000_0000_0A01, 0x0191));
    let config = NodeConfig::default();
    let driver = Ds18b20Driver::new(wire.clone(), NoRail, config.driver);

    let mut queue = EventQueue::new();
    let (tx, rx) = queue.split();
    let mut node = SensorNode::new(
        SimHal::new(clock.clone()),
        rx,
        &config,
        driver,
        None::<SwUartTransmitter<SimPin>>,
        RecordingAdvertiser::new(),
    )
    .unwrap();
    let mut radio = SimRadio::new(clock.clone(), tx);
    radio.run_until_idle(&mut node);

    wire.attach(SimDevice::ds18b20(0x0000_0000_0A02, 0x0050));
    node.rediscover().unwrap();
    radio.run_until_idle(&mut node);

    assert_eq!(node.driver().sensors_count(), 2);
    assert_eq!(node.scheduler().task_count(), 1);
}
