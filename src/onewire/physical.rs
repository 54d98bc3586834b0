use embedded_hal::digital::{InputPin, OutputPin};

/// One open-drain 1-Wire line.
///
/// The pin is configured open-drain by the board setup: driving it high
/// releases the line to the pull-up, driving it low pulls it down.
#[derive(Debug)]
pub struct PhysicalBus<P> {
    pin: P,
}

impl<P: OutputPin + InputPin> PhysicalBus<P> {
    /// Take the pin and leave the line released.
    pub fn new(pin: P) -> Self {
        let mut line = Self { pin };
        line.release();
        line
    }

    pub fn pull_down(&mut self) {
        let _ = self.pin.set_low();
    }

    pub fn release(&mut self) {
        let _ = self.pin.set_high();
    }

    /// Sample the line. A pin error reads as idle-high.
    pub fn read(&mut self) -> bool {
        self.pin.is_high().unwrap_or(true)
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }
}
