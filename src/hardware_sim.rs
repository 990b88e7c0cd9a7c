//! Simulated chamber hardware for host runs.
//!
//! First-order thermal plant: heat input proportional to the number of
//! closed heater relays, Newton cooling toward ambient that strengthens as
//! the vent door opens. All channels report the plant temperature; a fault
//! flag makes every channel return the sensor error sentinel.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Timer;
use log::info;

use crate::hardware::{Hardware, NUM_INPUT_CHANNELS, NUM_RELAYS, SENSOR_ERROR};
use crate::ControlError;

/// Cadence of the sensor sampling loop.
pub const SENSOR_READ_INTERVAL_MS: u64 = 220;

const AMBIENT_C: f64 = 25.0;
/// Plant gain with every heater relay closed, in degrees per second.
const MAX_HEATING_RATE_C_PER_S: f64 = 3.0;
const HEAT_LOSS_COEFFICIENT: f64 = 0.02;
/// Extra heat loss at a fully open vent door relative to a closed one.
const DOOR_LOSS_FACTOR: f64 = 4.0;
/// Relays counted as heaters for the plant model.
const HEATER_RELAY_COUNT: f64 = 2.0;

#[derive(Debug)]
struct PlantState {
    temperature_c: f64,
    relays: [bool; NUM_RELAYS],
    servo_angle_deg: f64,
    sensor_fault: bool,
}

pub struct SimulatedHardware {
    state: Mutex<CriticalSectionRawMutex, RefCell<PlantState>>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(PlantState {
                temperature_c: AMBIENT_C,
                relays: [false; NUM_RELAYS],
                servo_angle_deg: 0.0,
                sensor_fault: false,
            })),
        }
    }

    /// Advance the plant by `dt_s` seconds.
    pub fn step(&self, dt_s: f64) {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();

            let heaters_on = state.relays.iter().filter(|on| **on).count() as f64;
            let heat_input =
                MAX_HEATING_RATE_C_PER_S * (heaters_on / HEATER_RELAY_COUNT).min(1.0);

            let door_fraction = (state.servo_angle_deg / 180.0).clamp(0.0, 1.0);
            let heat_loss = HEAT_LOSS_COEFFICIENT
                * (state.temperature_c - AMBIENT_C)
                * (1.0 + DOOR_LOSS_FACTOR * door_fraction);

            state.temperature_c += (heat_input - heat_loss) * dt_s;
            if state.temperature_c < AMBIENT_C {
                state.temperature_c = AMBIENT_C;
            }
        });
    }

    pub fn temperature_c(&self) -> f64 {
        self.state.lock(|cell| cell.borrow().temperature_c)
    }

    pub fn set_sensor_fault(&self, fault: bool) {
        self.state.lock(|cell| cell.borrow_mut().sensor_fault = fault);
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for SimulatedHardware {
    fn read_thermocouple(&self, channel: usize) -> f64 {
        if channel >= NUM_INPUT_CHANNELS {
            return SENSOR_ERROR;
        }
        self.state.lock(|cell| {
            let state = cell.borrow();
            if state.sensor_fault {
                SENSOR_ERROR
            } else {
                state.temperature_c
            }
        })
    }

    fn set_relay_state(&self, relay: usize, on: bool) -> Result<(), ControlError> {
        if relay >= NUM_RELAYS {
            return Err(ControlError::InvalidArgument);
        }
        self.state.lock(|cell| cell.borrow_mut().relays[relay] = on);
        Ok(())
    }

    fn get_relay_state(&self, relay: usize) -> bool {
        if relay >= NUM_RELAYS {
            return false;
        }
        self.state.lock(|cell| cell.borrow().relays[relay])
    }

    fn set_servo_angle(&self, angle_deg: f64) -> Result<(), ControlError> {
        if !angle_deg.is_finite() {
            return Err(ControlError::InvalidArgument);
        }
        self.state
            .lock(|cell| cell.borrow_mut().servo_angle_deg = angle_deg.clamp(0.0, 180.0));
        Ok(())
    }

    fn get_servo_angle(&self) -> f64 {
        self.state.lock(|cell| cell.borrow().servo_angle_deg)
    }
}

/// Advances the thermal plant on the sensor cadence.
#[embassy_executor::task]
pub async fn simulation_task(hardware: &'static SimulatedHardware) {
    info!(
        "thermal simulation started: ambient {AMBIENT_C} C, max rate {MAX_HEATING_RATE_C_PER_S} C/s"
    );
    loop {
        hardware.step(SENSOR_READ_INTERVAL_MS as f64 / 1000.0);
        Timer::after_millis(SENSOR_READ_INTERVAL_MS).await;
    }
}
