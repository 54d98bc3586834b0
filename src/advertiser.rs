/// Outbound side of the radio advertisement.
///
/// The node only hands over values; payload layout and advertising
/// intervals belong to the implementation.
pub trait Advertiser {
    /// Two readings in fixed point: `value * 10^exponent` °C.
    fn set_temperature(&mut self, primary: i32, secondary: i32, exponent: i8);

    fn set_voltage(&mut self, millivolts: u16);

    /// Publish the values set since the last update.
    fn update(&mut self);
}
