//! Tick supervisor: samples and filters the thermocouples, checks the alarm
//! predicate, runs the PID and dispatches the actuators (relay soft PWM and
//! the rate-limited vent door).
//!
//! One instance exists for the life of the process, owned by the
//! [`crate::Chamber`] root and shared between tasks behind a mutex. All
//! hardware port calls used here are non-blocking reads/writes of published
//! values, so they stay inside the tick.

use embassy_futures::select::{select, Either};
use embassy_time::Timer;
use heapless::{FnvIndexMap, Vec};
use log::{info, warn};
use serde::Serialize;

use crate::clock::Clock;
use crate::hardware::{Hardware, NUM_INPUT_CHANNELS, NUM_RELAYS, SENSOR_ERROR};
use crate::pid::{PidEngine, PidGains, DEFAULT_SETPOINT_WEIGHT};
use crate::settings::{
    SettingsError, SettingsStore, KEY_COOL_KD, KEY_COOL_KI, KEY_COOL_KP, KEY_DOOR_CLOSED_DEG,
    KEY_DOOR_OPEN_DEG, KEY_DOOR_SPEED, KEY_D_FILTER_S, KEY_HEAT_KD, KEY_HEAT_KI, KEY_HEAT_KP,
    KEY_INPUTS_MASK, KEY_INPUT_FILTER_MS, KEY_I_LEAK_S, KEY_I_ZONE_C, KEY_RELAYS_ON_MASK,
    KEY_RELAYS_PWM_MASK, KEY_RELAY_PWM_WEIGHTS, KEY_SP_WEIGHT,
};
use crate::soft_pwm::{PwmEdge, SoftPwm, DEFAULT_PERIOD_MS};
use crate::{Chamber, ChamberStatus, ControlError, ControllerState, CURRENT_STATE, PWM_KICK};

pub const TICK_INTERVAL_MS: u64 = 250;
pub const TICK_INTERVAL_S: f64 = TICK_INTERVAL_MS as f64 / 1000.0;

pub const MIN_SETPOINT_C: f64 = 0.0;
pub const MAX_SETPOINT_C: f64 = 300.0;
/// Alarm bounds: readings outside catch sensor faults and runaway heating.
pub const MIN_PROCESS_VALUE_C: f64 = -100.0;
pub const MAX_PROCESS_VALUE_C: f64 = 300.0;

pub const ROOM_TEMPERATURE_C: f64 = 24.0;
/// Door cooling effectiveness near room temperature.
pub const MIN_DOOR_COOLING_EFFECTIVENESS: f64 = 0.45;
/// Exponent of the inverse concave map from cooling demand to door opening.
pub const DOOR_COOLING_NONLINEARITY: f64 = 3.0;

const DEFAULT_INPUT_FILTER_MS: f64 = 100.0;
const DEFAULT_DOOR_CLOSED_DEG: f64 = 0.0;
const DEFAULT_DOOR_OPEN_DEG: f64 = 90.0;
const DEFAULT_DOOR_SPEED_DEG_PER_S: f64 = 60.0;
const DEFAULT_INPUTS_MASK: u8 = 0b0000_0001;
const DEFAULT_RELAYS_PWM_MASK: u8 = 0b0000_0011;
const DEFAULT_RELAYS_ON_MASK: u8 = 0b0000_0100;

/// The profile engine drives the controller through this narrow handle; the
/// controller itself has no knowledge of profiles beyond the setpoint lock.
pub trait ControllerHandle {
    fn setpoint(&self) -> f64;
    fn process_value(&self) -> f64;
    fn is_running(&self) -> bool;
    fn set_setpoint_from_profile(&mut self, setpoint_c: f64) -> Result<(), ControlError>;
    fn set_profile_setpoint_lock(&mut self, locked: bool);
    fn start(&mut self) -> Result<(), ControlError>;
    fn stop(&mut self) -> Result<(), ControlError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub running: bool,
    pub alarming: bool,
    pub door_open: bool,
    pub door_preview_active: bool,
    pub state: ControllerState,
    pub setpoint_c: f64,
    pub process_value_c: f64,
    pub pid_output: f64,
    pub setpoint_locked_by_profile: bool,
    pub input_filter_ms: f64,
    pub servo_angle_deg: f64,
}

pub struct Controller<'a> {
    hardware: &'a dyn Hardware,
    settings: &'a dyn SettingsStore,
    clock: &'a dyn Clock,

    pid: PidEngine<'a>,
    relay_pwm: SoftPwm,

    running: bool,
    state: ControllerState,
    alarming: bool,
    door_open: bool,
    door_preview_active: bool,
    setpoint_locked_by_profile: bool,

    setpoint_c: f64,
    process_value_c: f64,
    filtered_pv_c: f64,
    has_filtered_pv: bool,
    pid_output: f64,

    input_filter_ms: f64,
    inputs_used: Vec<u8, NUM_INPUT_CHANNELS>,
    relays_pwm: FnvIndexMap<u8, f64, NUM_RELAYS>,
    relay_pwm_accumulators: FnvIndexMap<u8, f64, NUM_RELAYS>,
    relays_when_running: Vec<u8, NUM_RELAYS>,

    door_closed_angle_deg: f64,
    door_open_angle_deg: f64,
    door_max_speed_deg_per_s: f64,
    door_preview_angle_deg: f64,
}

fn persist_err(_: SettingsError) -> ControlError {
    ControlError::HardwareFailure
}

impl<'a> Controller<'a> {
    pub fn new(
        hardware: &'a dyn Hardware,
        settings: &'a dyn SettingsStore,
        clock: &'a dyn Clock,
    ) -> Self {
        let heating = PidGains::new(
            settings.get_f64(KEY_HEAT_KP).unwrap_or(1.0),
            settings.get_f64(KEY_HEAT_KI).unwrap_or(0.0),
            settings.get_f64(KEY_HEAT_KD).unwrap_or(0.0),
        );
        let cooling = PidGains::new(
            settings.get_f64(KEY_COOL_KP).unwrap_or(1.0),
            settings.get_f64(KEY_COOL_KI).unwrap_or(0.0),
            settings.get_f64(KEY_COOL_KD).unwrap_or(0.0),
        );
        let mut pid = PidEngine::new(clock, heating, cooling);
        let _ = pid.set_derivative_filter_time(settings.get_f64(KEY_D_FILTER_S).unwrap_or(0.0));
        let _ = pid.set_setpoint_weight(
            settings
                .get_f64(KEY_SP_WEIGHT)
                .unwrap_or(DEFAULT_SETPOINT_WEIGHT),
        );
        let _ = pid.set_integral_zone(settings.get_f64(KEY_I_ZONE_C).unwrap_or(0.0));
        let _ = pid.set_integral_leak_time(settings.get_f64(KEY_I_LEAK_S).unwrap_or(0.0));

        let mut controller = Self {
            hardware,
            settings,
            clock,
            pid,
            relay_pwm: SoftPwm::new(DEFAULT_PERIOD_MS, 0.0),
            running: false,
            state: ControllerState::Idle,
            alarming: false,
            door_open: false,
            door_preview_active: false,
            setpoint_locked_by_profile: false,
            setpoint_c: 0.0,
            process_value_c: 0.0,
            filtered_pv_c: 0.0,
            has_filtered_pv: false,
            pid_output: 0.0,
            input_filter_ms: settings
                .get_f64(KEY_INPUT_FILTER_MS)
                .unwrap_or(DEFAULT_INPUT_FILTER_MS),
            inputs_used: Vec::new(),
            relays_pwm: FnvIndexMap::new(),
            relay_pwm_accumulators: FnvIndexMap::new(),
            relays_when_running: Vec::new(),
            door_closed_angle_deg: settings
                .get_f64(KEY_DOOR_CLOSED_DEG)
                .unwrap_or(DEFAULT_DOOR_CLOSED_DEG)
                .clamp(0.0, 180.0),
            door_open_angle_deg: settings
                .get_f64(KEY_DOOR_OPEN_DEG)
                .unwrap_or(DEFAULT_DOOR_OPEN_DEG)
                .clamp(0.0, 180.0),
            door_max_speed_deg_per_s: settings
                .get_f64(KEY_DOOR_SPEED)
                .unwrap_or(DEFAULT_DOOR_SPEED_DEG_PER_S)
                .clamp(1.0, 360.0),
            door_preview_angle_deg: 0.0,
        };

        controller.apply_inputs_mask(
            settings
                .get_u8(KEY_INPUTS_MASK)
                .unwrap_or(DEFAULT_INPUTS_MASK),
        );
        controller.apply_relays_pwm_mask(
            settings
                .get_u8(KEY_RELAYS_PWM_MASK)
                .unwrap_or(DEFAULT_RELAYS_PWM_MASK),
        );
        let mut weights = [1.0_f64; NUM_RELAYS];
        weights[1] = 0.5;
        if settings
            .get_f64_array(KEY_RELAY_PWM_WEIGHTS, &mut weights)
            .is_err()
        {
            warn!("relay weights not persisted yet, using defaults");
        }
        for (&relay, weight) in controller.relays_pwm.iter_mut() {
            *weight = weights[relay as usize].clamp(0.0, 1.0);
        }
        controller.sync_relay_pwm_accumulators();
        controller.apply_relays_on_mask(
            settings
                .get_u8(KEY_RELAYS_ON_MASK)
                .unwrap_or(DEFAULT_RELAYS_ON_MASK),
        );
        controller.door_preview_angle_deg = controller.door_open_angle_deg;
        controller
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One control cycle: sample, filter, check the alarm predicate, then
    /// compute and dispatch. Idempotent and safe to miss.
    pub fn run_tick(&mut self) -> Result<(), ControlError> {
        self.perform()?;
        if self.running {
            self.perform_on_running()
        } else {
            self.perform_on_not_running()
        }
    }

    fn perform(&mut self) -> Result<(), ControlError> {
        if let Err(err) = self.update_process_value() {
            if self.running {
                let _ = self.stop();
            }
            self.alarming = true;
            self.state = ControllerState::SensorError;
            warn!("no valid sensor reading, alarming");
            return Err(err);
        }

        let should_alarm = self.process_value_c < MIN_PROCESS_VALUE_C
            || self.process_value_c > MAX_PROCESS_VALUE_C;
        let was_alarming = self.alarming;

        if should_alarm {
            if !was_alarming && self.running {
                let _ = self.stop();
            }
            self.alarming = true;
            self.state = ControllerState::Alarming;
            if !was_alarming {
                warn!("process value {:.1} outside alarm bounds", self.process_value_c);
            }
        } else if self.alarming {
            self.alarming = false;
            if !self.running {
                self.state = ControllerState::Idle;
            }
            info!("alarm cleared");
        }

        Ok(())
    }

    fn update_process_value(&mut self) -> Result<(), ControlError> {
        let mut sum = 0.0;
        let mut valid = 0u32;
        for &channel in self.inputs_used.iter() {
            let value = self.hardware.read_thermocouple(channel as usize);
            if value == SENSOR_ERROR {
                continue;
            }
            sum += value;
            valid += 1;
        }

        if valid == 0 {
            return Err(ControlError::SensorError);
        }

        let averaged = sum / f64::from(valid);
        let dt = TICK_INTERVAL_MS as f64;
        let alpha = dt / (self.input_filter_ms + dt);
        let filtered = if self.has_filtered_pv {
            alpha * averaged + (1.0 - alpha) * self.filtered_pv_c
        } else {
            averaged
        };

        self.filtered_pv_c = filtered;
        self.has_filtered_pv = true;
        self.process_value_c = filtered;
        Ok(())
    }

    fn perform_on_running(&mut self) -> Result<(), ControlError> {
        let output = self.pid.calculate(self.setpoint_c, self.process_value_c);
        self.pid_output = output;

        if output < 0.0 {
            let fraction = self.cooling_door_open_fraction(output, self.process_value_c);
            let target = self.door_angle_from_fraction(fraction);
            self.apply_door_target_angle(target, TICK_INTERVAL_S);
            self.relay_pwm.set_duty_cycle(0.0);
            self.force_pwm_off();
        } else if output > 0.0 {
            self.relay_pwm.set_duty_cycle((output / 100.0).min(1.0));
            self.apply_door_target_angle(self.door_closed_angle_deg, TICK_INTERVAL_S);
        } else {
            self.relay_pwm.set_duty_cycle(0.0);
            self.force_pwm_off();
            self.apply_door_target_angle(self.door_closed_angle_deg, TICK_INTERVAL_S);
        }

        Ok(())
    }

    fn perform_on_not_running(&mut self) -> Result<(), ControlError> {
        self.pid_output = 0.0;
        self.relay_pwm.set_duty_cycle(0.0);

        let target = if self.door_preview_active {
            self.door_preview_angle_deg
        } else if self.door_open {
            self.door_open_angle_deg
        } else {
            self.door_closed_angle_deg
        };
        self.apply_door_target_angle(target, TICK_INTERVAL_S);

        Ok(())
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    pub fn start(&mut self) -> Result<(), ControlError> {
        if self.alarming || self.running {
            return Err(ControlError::InvalidState);
        }

        self.running_relays_on()?;
        self.relay_pwm.start(self.clock.now_ms());
        PWM_KICK.signal(());

        self.running = true;
        self.door_preview_active = false;
        self.state = ControllerState::SteadyState;
        info!("controller started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ControlError> {
        if !self.running {
            return Err(ControlError::InvalidState);
        }

        self.running_relays_off()?;
        self.relay_pwm.set_duty_cycle(0.0);
        self.force_pwm_off();
        self.relay_pwm.stop();
        PWM_KICK.signal(());

        self.running = false;
        self.state = ControllerState::Idle;
        self.pid_output = 0.0;
        info!("controller stopped");
        Ok(())
    }

    pub fn open_door(&mut self) -> Result<(), ControlError> {
        if self.running {
            return Err(ControlError::InvalidState);
        }
        self.door_open = true;
        self.door_preview_active = false;
        Ok(())
    }

    pub fn close_door(&mut self) -> Result<(), ControlError> {
        if self.running {
            return Err(ControlError::InvalidState);
        }
        self.door_open = false;
        self.door_preview_active = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Setpoint
    // ------------------------------------------------------------------

    pub fn set_setpoint(&mut self, setpoint_c: f64) -> Result<(), ControlError> {
        if !(MIN_SETPOINT_C..=MAX_SETPOINT_C).contains(&setpoint_c) {
            return Err(ControlError::InvalidArgument);
        }
        if self.setpoint_locked_by_profile {
            return Err(ControlError::InvalidState);
        }
        self.setpoint_c = setpoint_c;
        Ok(())
    }

    /// Profile-origin setpoint writes bypass the lock but still clamp.
    pub fn set_setpoint_from_profile(&mut self, setpoint_c: f64) -> Result<(), ControlError> {
        if !(MIN_SETPOINT_C..=MAX_SETPOINT_C).contains(&setpoint_c) {
            return Err(ControlError::InvalidArgument);
        }
        self.setpoint_c = setpoint_c;
        Ok(())
    }

    pub fn set_profile_setpoint_lock(&mut self, locked: bool) {
        self.setpoint_locked_by_profile = locked;
    }

    // ------------------------------------------------------------------
    // Tuning
    // ------------------------------------------------------------------

    pub fn set_input_filter_time(&mut self, filter_ms: f64) -> Result<(), ControlError> {
        if !filter_ms.is_finite() || filter_ms <= 0.0 {
            return Err(ControlError::InvalidArgument);
        }
        self.input_filter_ms = filter_ms;
        self.settings
            .set_f64(KEY_INPUT_FILTER_MS, filter_ms)
            .map_err(persist_err)
    }

    pub fn set_heating_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), ControlError> {
        self.pid.tune_heating(kp, ki, kd)?;
        self.settings.set_f64(KEY_HEAT_KP, kp).map_err(persist_err)?;
        self.settings.set_f64(KEY_HEAT_KI, ki).map_err(persist_err)?;
        self.settings.set_f64(KEY_HEAT_KD, kd).map_err(persist_err)
    }

    pub fn set_cooling_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), ControlError> {
        self.pid.tune_cooling(kp, ki, kd)?;
        self.settings.set_f64(KEY_COOL_KP, kp).map_err(persist_err)?;
        self.settings.set_f64(KEY_COOL_KI, ki).map_err(persist_err)?;
        self.settings.set_f64(KEY_COOL_KD, kd).map_err(persist_err)
    }

    pub fn set_derivative_filter_time(&mut self, time_s: f64) -> Result<(), ControlError> {
        self.pid.set_derivative_filter_time(time_s)?;
        self.settings
            .set_f64(KEY_D_FILTER_S, time_s)
            .map_err(persist_err)
    }

    pub fn set_setpoint_weight(&mut self, weight: f64) -> Result<(), ControlError> {
        self.pid.set_setpoint_weight(weight)?;
        self.settings
            .set_f64(KEY_SP_WEIGHT, weight)
            .map_err(persist_err)
    }

    pub fn set_integral_zone(&mut self, zone_c: f64) -> Result<(), ControlError> {
        self.pid.set_integral_zone(zone_c)?;
        self.settings
            .set_f64(KEY_I_ZONE_C, zone_c)
            .map_err(persist_err)
    }

    pub fn set_integral_leak_time(&mut self, time_s: f64) -> Result<(), ControlError> {
        self.pid.set_integral_leak_time(time_s)?;
        self.settings
            .set_f64(KEY_I_LEAK_S, time_s)
            .map_err(persist_err)
    }

    // ------------------------------------------------------------------
    // Input channels
    // ------------------------------------------------------------------

    pub fn add_input_channel(&mut self, channel: u8) -> Result<(), ControlError> {
        if channel as usize >= NUM_INPUT_CHANNELS {
            return Err(ControlError::InvalidArgument);
        }
        if self.inputs_used.contains(&channel) {
            return Err(ControlError::InvalidArgument);
        }
        let _ = self.inputs_used.push(channel);
        self.persist_inputs_mask()
    }

    pub fn remove_input_channel(&mut self, channel: u8) -> Result<(), ControlError> {
        let Some(position) = self.inputs_used.iter().position(|&c| c == channel) else {
            return Err(ControlError::InvalidArgument);
        };
        self.inputs_used.remove(position);
        if self.inputs_used.is_empty() {
            // Never run without an input; fall back to channel 0.
            let _ = self.inputs_used.push(0);
        }
        self.persist_inputs_mask()
    }

    pub fn set_input_channels(&mut self, channels: &[u8]) -> Result<(), ControlError> {
        if channels.is_empty() {
            return Err(ControlError::InvalidArgument);
        }
        let mut sanitized: Vec<u8, NUM_INPUT_CHANNELS> = Vec::new();
        for &channel in channels {
            if channel as usize >= NUM_INPUT_CHANNELS {
                return Err(ControlError::InvalidArgument);
            }
            if !sanitized.contains(&channel) {
                let _ = sanitized.push(channel);
            }
        }
        self.inputs_used = sanitized;
        self.persist_inputs_mask()
    }

    // ------------------------------------------------------------------
    // Relay PWM map
    // ------------------------------------------------------------------

    pub fn add_set_relay_pwm(&mut self, relay: u8, weight: f64) -> Result<(), ControlError> {
        if relay as usize >= NUM_RELAYS || !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
            return Err(ControlError::InvalidArgument);
        }
        let _ = self.relays_pwm.insert(relay, weight);
        self.sync_relay_pwm_accumulators();
        self.persist_relays_pwm()
    }

    pub fn remove_relay_pwm(&mut self, relay: u8) -> Result<(), ControlError> {
        if self.relays_pwm.remove(&relay).is_none() {
            return Err(ControlError::InvalidArgument);
        }
        self.sync_relay_pwm_accumulators();
        self.persist_relays_pwm()
    }

    /// Replace the membership, keeping known weights and defaulting new
    /// relays to full weight.
    pub fn set_relay_pwm_enabled(&mut self, relays: &[u8]) -> Result<(), ControlError> {
        for &relay in relays {
            if relay as usize >= NUM_RELAYS {
                return Err(ControlError::InvalidArgument);
            }
        }
        let mut next: FnvIndexMap<u8, f64, NUM_RELAYS> = FnvIndexMap::new();
        for &relay in relays {
            let weight = self
                .relays_pwm
                .get(&relay)
                .copied()
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            let _ = next.insert(relay, weight);
        }
        self.relays_pwm = next;
        self.sync_relay_pwm_accumulators();
        self.persist_relays_pwm()
    }

    pub fn set_relays_pwm(&mut self, weights: &[(u8, f64)]) -> Result<(), ControlError> {
        for &(relay, weight) in weights {
            if relay as usize >= NUM_RELAYS || !weight.is_finite() || !(0.0..=1.0).contains(&weight)
            {
                return Err(ControlError::InvalidArgument);
            }
        }
        let mut next: FnvIndexMap<u8, f64, NUM_RELAYS> = FnvIndexMap::new();
        for &(relay, weight) in weights {
            let _ = next.insert(relay, weight);
        }
        self.relays_pwm = next;
        self.sync_relay_pwm_accumulators();
        self.persist_relays_pwm()
    }

    // ------------------------------------------------------------------
    // Running relays
    // ------------------------------------------------------------------

    pub fn add_relay_when_running(&mut self, relay: u8) -> Result<(), ControlError> {
        if relay as usize >= NUM_RELAYS {
            return Err(ControlError::InvalidArgument);
        }
        if self.relays_when_running.contains(&relay) {
            return Err(ControlError::InvalidArgument);
        }
        let _ = self.relays_when_running.push(relay);
        self.persist_relays_on_mask()
    }

    pub fn remove_relay_when_running(&mut self, relay: u8) -> Result<(), ControlError> {
        let Some(position) = self.relays_when_running.iter().position(|&r| r == relay) else {
            return Err(ControlError::InvalidArgument);
        };
        self.relays_when_running.remove(position);
        self.persist_relays_on_mask()
    }

    pub fn set_relays_when_running(&mut self, relays: &[u8]) -> Result<(), ControlError> {
        let mut sanitized: Vec<u8, NUM_RELAYS> = Vec::new();
        for &relay in relays {
            if relay as usize >= NUM_RELAYS {
                return Err(ControlError::InvalidArgument);
            }
            if !sanitized.contains(&relay) {
                let _ = sanitized.push(relay);
            }
        }
        self.relays_when_running = sanitized;
        self.persist_relays_on_mask()
    }

    // ------------------------------------------------------------------
    // Door
    // ------------------------------------------------------------------

    pub fn set_door_calibration_angles(
        &mut self,
        closed_deg: f64,
        open_deg: f64,
    ) -> Result<(), ControlError> {
        let in_range = |angle: f64| angle.is_finite() && (0.0..=180.0).contains(&angle);
        if !in_range(closed_deg) || !in_range(open_deg) {
            return Err(ControlError::InvalidArgument);
        }

        self.settings
            .set_f64(KEY_DOOR_CLOSED_DEG, closed_deg)
            .map_err(persist_err)?;
        self.settings
            .set_f64(KEY_DOOR_OPEN_DEG, open_deg)
            .map_err(persist_err)?;

        self.door_closed_angle_deg = closed_deg;
        self.door_open_angle_deg = open_deg;

        if !self.running {
            let target = if self.door_preview_active {
                self.door_preview_angle_deg
            } else if self.door_open {
                open_deg
            } else {
                closed_deg
            };
            self.apply_door_target_angle(target, TICK_INTERVAL_S);
        }
        Ok(())
    }

    pub fn set_door_max_speed(&mut self, speed_deg_per_s: f64) -> Result<(), ControlError> {
        if !speed_deg_per_s.is_finite() || !(1.0..=360.0).contains(&speed_deg_per_s) {
            return Err(ControlError::InvalidArgument);
        }
        self.settings
            .set_f64(KEY_DOOR_SPEED, speed_deg_per_s)
            .map_err(persist_err)?;
        self.door_max_speed_deg_per_s = speed_deg_per_s;
        Ok(())
    }

    pub fn set_door_preview_angle(&mut self, angle_deg: f64) -> Result<(), ControlError> {
        if !angle_deg.is_finite() || !(0.0..=180.0).contains(&angle_deg) {
            return Err(ControlError::InvalidArgument);
        }
        if self.running {
            return Err(ControlError::InvalidState);
        }
        self.door_preview_active = true;
        self.door_preview_angle_deg = angle_deg;
        self.apply_door_target_angle(angle_deg, TICK_INTERVAL_S);
        Ok(())
    }

    pub fn clear_door_preview(&mut self) -> Result<(), ControlError> {
        if self.running {
            return Err(ControlError::InvalidState);
        }
        self.door_preview_active = false;
        let target = if self.door_open {
            self.door_open_angle_deg
        } else {
            self.door_closed_angle_deg
        };
        self.apply_door_target_angle(target, TICK_INTERVAL_S);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relay soft PWM service
    // ------------------------------------------------------------------

    /// Milliseconds until the next PWM edge is due; `None` while stopped.
    pub fn pwm_sleep_ms(&self) -> Option<u64> {
        self.relay_pwm
            .next_deadline_ms()
            .map(|deadline| deadline.saturating_sub(self.clock.now_ms()))
    }

    /// Called by the PWM task on wakeup; dispatches a due edge, if any.
    pub fn service_pwm(&mut self) {
        if let Some(edge) = self.relay_pwm.service(self.clock.now_ms()) {
            self.dispatch_relay_edge(edge);
        }
    }

    fn force_pwm_off(&mut self) {
        if let Some(edge) = self.relay_pwm.force_off(self.clock.now_ms()) {
            self.dispatch_relay_edge(edge);
        }
        PWM_KICK.signal(());
    }

    fn dispatch_relay_edge(&mut self, edge: PwmEdge) {
        match edge {
            PwmEdge::On => self.relay_cycle_on(),
            PwmEdge::Off => self.relay_cycle_off(),
        }
    }

    /// ON edge of the master cycle: fire each mapped relay according to its
    /// bit weight. Fractional weights accumulate and fire once the
    /// accumulator crosses one full cycle, keeping the remainder.
    fn relay_cycle_on(&mut self) {
        self.sync_relay_pwm_accumulators();
        for (&relay, &weight) in self.relays_pwm.iter() {
            let weight = weight.clamp(0.0, 1.0);
            if weight <= 0.0 {
                continue;
            }
            let on = if weight >= 1.0 {
                true
            } else if let Some(accumulator) = self.relay_pwm_accumulators.get_mut(&relay) {
                *accumulator += weight;
                if *accumulator >= 1.0 {
                    while *accumulator >= 1.0 {
                        *accumulator -= 1.0;
                    }
                    true
                } else {
                    false
                }
            } else {
                false
            };
            let _ = self.hardware.set_relay_state(relay as usize, on);
        }
    }

    fn relay_cycle_off(&mut self) {
        for (&relay, _) in self.relays_pwm.iter() {
            let _ = self.hardware.set_relay_state(relay as usize, false);
        }
    }

    // ------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            running: self.running,
            alarming: self.alarming,
            door_open: self.door_open,
            door_preview_active: self.door_preview_active,
            state: self.state,
            setpoint_c: self.setpoint_c,
            process_value_c: self.process_value_c,
            pid_output: self.pid_output,
            setpoint_locked_by_profile: self.setpoint_locked_by_profile,
            input_filter_ms: self.input_filter_ms,
            servo_angle_deg: self.hardware.get_servo_angle(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_alarming(&self) -> bool {
        self.alarming
    }

    pub fn is_door_open(&self) -> bool {
        self.door_open
    }

    pub fn is_setpoint_locked_by_profile(&self) -> bool {
        self.setpoint_locked_by_profile
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint_c
    }

    pub fn process_value(&self) -> f64 {
        self.process_value_c
    }

    pub fn pid_output(&self) -> f64 {
        self.pid_output
    }

    pub fn pid(&self) -> &PidEngine<'a> {
        &self.pid
    }

    pub fn input_filter_ms(&self) -> f64 {
        self.input_filter_ms
    }

    pub fn input_channels(&self) -> &[u8] {
        &self.inputs_used
    }

    pub fn relays_pwm(&self) -> impl Iterator<Item = (u8, f64)> + '_ {
        self.relays_pwm.iter().map(|(&relay, &weight)| (relay, weight))
    }

    pub fn relays_when_running(&self) -> &[u8] {
        &self.relays_when_running
    }

    pub fn door_closed_angle_deg(&self) -> f64 {
        self.door_closed_angle_deg
    }

    pub fn door_open_angle_deg(&self) -> f64 {
        self.door_open_angle_deg
    }

    pub fn door_max_speed_deg_per_s(&self) -> f64 {
        self.door_max_speed_deg_per_s
    }

    #[cfg(test)]
    pub(crate) fn accumulator_keys(&self) -> std::vec::Vec<u8> {
        let mut keys: std::vec::Vec<u8> = self.relay_pwm_accumulators.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    #[cfg(test)]
    pub(crate) fn relay_pwm_keys(&self) -> std::vec::Vec<u8> {
        let mut keys: std::vec::Vec<u8> = self.relays_pwm.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn running_relays_on(&mut self) -> Result<(), ControlError> {
        for index in 0..self.relays_when_running.len() {
            let relay = self.relays_when_running[index];
            if let Err(err) = self.hardware.set_relay_state(relay as usize, true) {
                // Roll back whatever already switched on.
                for &earlier in self.relays_when_running.iter().take(index) {
                    let _ = self.hardware.set_relay_state(earlier as usize, false);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn running_relays_off(&mut self) -> Result<(), ControlError> {
        for &relay in self.relays_when_running.iter() {
            self.hardware.set_relay_state(relay as usize, false)?;
        }
        Ok(())
    }

    fn cooling_door_open_fraction(&self, pid_output: f64, process_value_c: f64) -> f64 {
        if pid_output >= 0.0 {
            return 0.0;
        }

        let demand = (-pid_output / 100.0).clamp(0.0, 1.0);
        let temp_range = (MAX_PROCESS_VALUE_C - ROOM_TEMPERATURE_C).max(1.0);
        let normalized = ((process_value_c - ROOM_TEMPERATURE_C) / temp_range).clamp(0.0, 1.0);

        // Vent cooling barely works near room temperature.
        let effectiveness = MIN_DOOR_COOLING_EFFECTIVENESS
            + (1.0 - MIN_DOOR_COOLING_EFFECTIVENESS) * normalized;
        let compensated = (demand / effectiveness.max(0.05)).clamp(0.0, 1.0);

        // Small openings provide most of the cooling; invert the concave response.
        (1.0 - (1.0 - compensated).powf(1.0 / DOOR_COOLING_NONLINEARITY)).clamp(0.0, 1.0)
    }

    fn door_angle_from_fraction(&self, open_fraction: f64) -> f64 {
        let fraction = open_fraction.clamp(0.0, 1.0);
        self.door_closed_angle_deg
            + fraction * (self.door_open_angle_deg - self.door_closed_angle_deg)
    }

    fn apply_door_target_angle(&mut self, target_deg: f64, dt_s: f64) {
        let target = target_deg.clamp(0.0, 180.0);
        let speed = self.door_max_speed_deg_per_s.clamp(1.0, 360.0);
        let current = self.hardware.get_servo_angle();

        let max_step = speed * dt_s.max(0.0);
        let delta = target - current;
        let next = if delta.abs() > max_step {
            current + max_step.copysign(delta)
        } else {
            target
        };
        let _ = self.hardware.set_servo_angle(next);
    }

    fn build_inputs_mask(&self) -> u8 {
        self.inputs_used
            .iter()
            .fold(0, |mask, &channel| mask | (1u8 << channel))
    }

    fn build_relays_on_mask(&self) -> u8 {
        self.relays_when_running
            .iter()
            .fold(0, |mask, &relay| mask | (1u8 << relay))
    }

    fn apply_inputs_mask(&mut self, mask: u8) {
        self.inputs_used.clear();
        for channel in 0..NUM_INPUT_CHANNELS as u8 {
            if mask & (1u8 << channel) != 0 {
                let _ = self.inputs_used.push(channel);
            }
        }
        if self.inputs_used.is_empty() {
            let _ = self.inputs_used.push(0);
        }
    }

    fn apply_relays_pwm_mask(&mut self, mask: u8) {
        self.relays_pwm.clear();
        for relay in 0..NUM_RELAYS as u8 {
            if mask & (1u8 << relay) != 0 {
                let _ = self.relays_pwm.insert(relay, 1.0);
            }
        }
        self.sync_relay_pwm_accumulators();
    }

    fn apply_relays_on_mask(&mut self, mask: u8) {
        self.relays_when_running.clear();
        for relay in 0..NUM_RELAYS as u8 {
            if mask & (1u8 << relay) != 0 {
                let _ = self.relays_when_running.push(relay);
            }
        }
    }

    /// Keep the accumulator key set equal to the weight key set.
    fn sync_relay_pwm_accumulators(&mut self) {
        let stale: Vec<u8, NUM_RELAYS> = self
            .relay_pwm_accumulators
            .keys()
            .filter(|key| !self.relays_pwm.contains_key(key))
            .copied()
            .collect();
        for key in stale {
            self.relay_pwm_accumulators.remove(&key);
        }
        for (&relay, _) in self.relays_pwm.iter() {
            if !self.relay_pwm_accumulators.contains_key(&relay) {
                let _ = self.relay_pwm_accumulators.insert(relay, 0.0);
            }
        }
    }

    fn persist_inputs_mask(&mut self) -> Result<(), ControlError> {
        let mask = self.build_inputs_mask();
        self.settings
            .set_u8(KEY_INPUTS_MASK, mask)
            .map_err(persist_err)
    }

    fn persist_relays_on_mask(&mut self) -> Result<(), ControlError> {
        let mask = self.build_relays_on_mask();
        self.settings
            .set_u8(KEY_RELAYS_ON_MASK, mask)
            .map_err(persist_err)
    }

    fn persist_relays_pwm(&mut self) -> Result<(), ControlError> {
        let mut weights = [1.0_f64; NUM_RELAYS];
        let _ = self.settings.get_f64_array(KEY_RELAY_PWM_WEIGHTS, &mut weights);

        let mut mask = 0u8;
        for (&relay, &weight) in self.relays_pwm.iter() {
            mask |= 1u8 << relay;
            weights[relay as usize] = weight.clamp(0.0, 1.0);
        }
        self.settings
            .set_u8(KEY_RELAYS_PWM_MASK, mask)
            .map_err(persist_err)?;
        self.settings
            .set_f64_array(KEY_RELAY_PWM_WEIGHTS, &weights)
            .map_err(persist_err)
    }
}

impl ControllerHandle for Controller<'_> {
    fn setpoint(&self) -> f64 {
        self.setpoint_c
    }

    fn process_value(&self) -> f64 {
        self.process_value_c
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn set_setpoint_from_profile(&mut self, setpoint_c: f64) -> Result<(), ControlError> {
        Controller::set_setpoint_from_profile(self, setpoint_c)
    }

    fn set_profile_setpoint_lock(&mut self, locked: bool) {
        Controller::set_profile_setpoint_lock(self, locked);
    }

    fn start(&mut self) -> Result<(), ControlError> {
        Controller::start(self)
    }

    fn stop(&mut self) -> Result<(), ControlError> {
        Controller::stop(self)
    }
}

/// Control cadence: profile tick writes the setpoint, then the controller
/// tick reads it, then the fresh snapshot is broadcast.
#[embassy_executor::task]
pub async fn control_task(chamber: &'static Chamber) {
    info!("control task started");
    let sender = CURRENT_STATE.sender();
    loop {
        {
            let mut controller = chamber.controller.lock().await;
            let mut profile = chamber.profile.lock().await;
            profile.tick(TICK_INTERVAL_S, &mut *controller);
            if let Err(err) = controller.run_tick() {
                warn!("control tick failed: {err}");
            }
            sender.send(ChamberStatus {
                controller: controller.status(),
                profile: profile.runtime_status(),
            });
        }
        Timer::after_millis(TICK_INTERVAL_MS).await;
    }
}

/// Services relay PWM edges. Sleeps until the next scheduled edge; a kick on
/// [`PWM_KICK`] (start/stop/force) abandons the stale deadline immediately.
#[embassy_executor::task]
pub async fn pwm_task(chamber: &'static Chamber) {
    info!("pwm task started");
    loop {
        let sleep_ms = { chamber.controller.lock().await.pwm_sleep_ms() };
        match sleep_ms {
            Some(sleep_ms) => {
                let deadline = Timer::after_millis(sleep_ms.max(1));
                match select(deadline, PWM_KICK.wait()).await {
                    Either::First(()) => chamber.controller.lock().await.service_pwm(),
                    Either::Second(()) => {}
                }
            }
            None => PWM_KICK.wait().await,
        }
    }
}
