//! Scripted hardware double shared by the unit and scenario tests.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::hardware::{Hardware, NUM_INPUT_CHANNELS, NUM_RELAYS};
use crate::ControlError;

#[derive(Debug)]
struct TestState {
    channels: [f64; NUM_INPUT_CHANNELS],
    relays: [bool; NUM_RELAYS],
    servo_angle_deg: f64,
    relay_events: Vec<(usize, bool)>,
}

pub struct TestHardware {
    state: Mutex<CriticalSectionRawMutex, RefCell<TestState>>,
}

impl TestHardware {
    pub fn new(initial_temperature_c: f64) -> Self {
        Self {
            state: Mutex::new(RefCell::new(TestState {
                channels: [initial_temperature_c; NUM_INPUT_CHANNELS],
                relays: [false; NUM_RELAYS],
                servo_angle_deg: 0.0,
                relay_events: Vec::new(),
            })),
        }
    }

    pub fn set_channel(&self, channel: usize, value: f64) {
        self.state
            .lock(|cell| cell.borrow_mut().channels[channel] = value);
    }

    pub fn set_all_channels(&self, value: f64) {
        self.state
            .lock(|cell| cell.borrow_mut().channels = [value; NUM_INPUT_CHANNELS]);
    }

    pub fn relay(&self, relay: usize) -> bool {
        self.state.lock(|cell| cell.borrow().relays[relay])
    }

    pub fn servo_angle(&self) -> f64 {
        self.state.lock(|cell| cell.borrow().servo_angle_deg)
    }

    /// Chronological `(relay, state)` writes, including redundant ones.
    pub fn relay_events(&self) -> Vec<(usize, bool)> {
        self.state.lock(|cell| cell.borrow().relay_events.clone())
    }

    pub fn clear_relay_events(&self) {
        self.state.lock(|cell| cell.borrow_mut().relay_events.clear());
    }
}

impl Hardware for TestHardware {
    fn read_thermocouple(&self, channel: usize) -> f64 {
        self.state.lock(|cell| cell.borrow().channels[channel])
    }

    fn set_relay_state(&self, relay: usize, on: bool) -> Result<(), ControlError> {
        if relay >= NUM_RELAYS {
            return Err(ControlError::InvalidArgument);
        }
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            state.relays[relay] = on;
            state.relay_events.push((relay, on));
        });
        Ok(())
    }

    fn get_relay_state(&self, relay: usize) -> bool {
        self.state.lock(|cell| cell.borrow().relays[relay])
    }

    fn set_servo_angle(&self, angle_deg: f64) -> Result<(), ControlError> {
        self.state
            .lock(|cell| cell.borrow_mut().servo_angle_deg = angle_deg.clamp(0.0, 180.0));
        Ok(())
    }

    fn get_servo_angle(&self) -> f64 {
        self.state.lock(|cell| cell.borrow().servo_angle_deg)
    }
}
