//! Control core for a reflow/thermal chamber.
//!
//! The periodic control task samples the thermocouples, filters them into a
//! single process value, runs a bidirectional PID and dispatches the
//! actuators: a relay bank behind software time-proportional PWM for heat,
//! and a servo vent door for cooling. A profile engine sequences thermal
//! recipes over the same setpoint, and a data logger samples the whole
//! state into a rolling buffer.
//!
//! Hardware, persistent settings and the monotonic clock are ports; the
//! [`Chamber`] root wires concrete implementations in leaf-first order and
//! the embassy tasks share the core objects behind mutexes.

pub mod clock;
pub mod controller;
pub mod data_logger;
pub mod hardware;
pub mod hardware_sim;
pub mod pid;
pub mod profile;
pub mod profile_engine;
pub mod settings;
pub mod soft_pwm;

#[cfg(test)]
pub(crate) mod test_support;

use core::fmt;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_sync::watch::Watch;
use serde::Serialize;

use crate::clock::Clock;
use crate::controller::{Controller, ControllerStatus};
use crate::data_logger::DataLogger;
use crate::hardware::Hardware;
use crate::profile_engine::{ProfileEngine, ProfileRuntimeStatus};
use crate::settings::SettingsStore;

pub static VERSION: &str = "v0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    InvalidArgument,
    InvalidState,
    NotFound,
    SensorError,
    HardwareFailure,
    TransitionGuardExceeded,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidArgument => write!(f, "invalid argument"),
            ControlError::InvalidState => write!(f, "operation not allowed in this state"),
            ControlError::NotFound => write!(f, "not found"),
            ControlError::SensorError => write!(f, "no valid sensor reading"),
            ControlError::HardwareFailure => write!(f, "hardware failure"),
            ControlError::TransitionGuardExceeded => {
                write!(f, "profile transition guard exceeded")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    SteadyState,
    Alarming,
    SensorError,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "Idle",
            ControllerState::SteadyState => "Steady State",
            ControllerState::Alarming => "Alarming",
            ControllerState::SensorError => "Sensor Error",
        }
    }
}

/// Snapshot broadcast on every control tick.
#[derive(Debug, Clone, Serialize)]
pub struct ChamberStatus {
    pub controller: ControllerStatus,
    pub profile: ProfileRuntimeStatus,
}

pub static CURRENT_STATE: Watch<CriticalSectionRawMutex, ChamberStatus, 4> = Watch::new();

/// Wakes the PWM task when the edge schedule changed underneath it
/// (start/stop or a forced phase).
pub static PWM_KICK: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Composition root: owns the core objects and the ports they consume.
///
/// Lock order is controller, then profile, then logger; none of the core
/// objects ever locks another.
pub struct Chamber {
    pub hardware: &'static dyn Hardware,
    pub settings: &'static dyn SettingsStore,
    pub clock: &'static dyn Clock,
    pub controller: Mutex<CriticalSectionRawMutex, Controller<'static>>,
    pub profile: Mutex<CriticalSectionRawMutex, ProfileEngine<'static>>,
    pub logger: Mutex<CriticalSectionRawMutex, DataLogger<'static>>,
}

impl Chamber {
    pub fn new(
        hardware: &'static dyn Hardware,
        settings: &'static dyn SettingsStore,
        clock: &'static dyn Clock,
    ) -> Self {
        Self {
            hardware,
            settings,
            clock,
            controller: Mutex::new(Controller::new(hardware, settings, clock)),
            profile: Mutex::new(ProfileEngine::new(settings)),
            logger: Mutex::new(DataLogger::new(settings)),
        }
    }
}
