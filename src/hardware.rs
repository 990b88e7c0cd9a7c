//! Hardware port consumed by the control core.
//!
//! The real chamber drives thermocouple front-ends over SPI, relay GPIOs and
//! an MCPWM servo. All of that stays behind this trait so the core never
//! touches a bus. Implementations must be non-blocking: `read_thermocouple`
//! returns the most recently published sample, never a bus transaction.

use crate::ControlError;

/// Reported in place of a temperature when a channel has no valid reading.
pub const SENSOR_ERROR: f64 = -3000.0;

/// Number of thermocouple input channels.
pub const NUM_INPUT_CHANNELS: usize = 8;

/// Number of switchable relay outputs.
pub const NUM_RELAYS: usize = 8;

pub trait Hardware: Send + Sync {
    /// Latest temperature on `channel` in degrees C, or [`SENSOR_ERROR`].
    fn read_thermocouple(&self, channel: usize) -> f64;

    fn set_relay_state(&self, relay: usize, on: bool) -> Result<(), ControlError>;

    fn get_relay_state(&self, relay: usize) -> bool;

    /// Command the vent door servo; implementations clamp to [0, 180].
    fn set_servo_angle(&self, angle_deg: f64) -> Result<(), ControlError>;

    fn get_servo_angle(&self) -> f64;
}
