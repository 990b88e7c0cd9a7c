//! Rolling in-memory log of controller state.
//!
//! A fixed-size record is sampled on its own cadence from the exported
//! getters; the buffer holds at most [`MAX_DATA_POINTS`] records (500 KB)
//! and drops the oldest on overflow.

use std::collections::VecDeque;

use embassy_time::Timer;
use log::warn;
use serde::Serialize;

use crate::clock::Clock;
use crate::controller::Controller;
use crate::hardware::{Hardware, NUM_INPUT_CHANNELS, NUM_RELAYS};
use crate::settings::{SettingsStore, KEY_LOG_INTERVAL_MS, KEY_LOG_MAX_TIME_MS};
use crate::{Chamber, ControlError};

pub const MAX_DATA_SIZE_KB: usize = 500;
pub const MAX_DATA_POINTS: usize = (MAX_DATA_SIZE_KB * 1024) / core::mem::size_of::<DataPoint>();

pub const MIN_LOG_INTERVAL_MS: u32 = 250;
pub const MAX_LOG_INTERVAL_MS: u32 = 10_000;
pub const MIN_TIME_SAVED_MS: u32 = 60 * 1000;
pub const MAX_TIME_SAVED_MS: u32 = 24 * 60 * 60 * 1000;

const DEFAULT_LOG_INTERVAL_MS: u32 = 1000;
const DEFAULT_TIME_SAVED_MS: u32 = 30 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataPoint {
    /// Seconds of uptime when the record was sampled.
    pub timestamp_s: u64,
    pub setpoint_c: f32,
    pub process_value_c: f32,
    pub pid_output: f32,
    pub p_term: f32,
    pub i_term: f32,
    pub d_term: f32,
    pub temperatures_c: [f32; NUM_INPUT_CHANNELS],
    /// One bit per relay.
    pub relay_states: u8,
    pub servo_angle_deg: u8,
    pub chamber_running: bool,
}

fn estimate_points(interval_ms: u32, window_ms: u32) -> usize {
    if interval_ms == 0 {
        return 0;
    }
    (window_ms / interval_ms) as usize
}

pub struct DataLogger<'a> {
    settings: &'a dyn SettingsStore,
    logging: bool,
    interval_ms: u32,
    max_time_saved_ms: u32,
    points: VecDeque<DataPoint>,
}

impl<'a> DataLogger<'a> {
    pub fn new(settings: &'a dyn SettingsStore) -> Self {
        let mut interval_ms = settings
            .get_i32(KEY_LOG_INTERVAL_MS)
            .map(|value| value.max(0) as u32)
            .unwrap_or(DEFAULT_LOG_INTERVAL_MS);
        let mut max_time_saved_ms = settings
            .get_i32(KEY_LOG_MAX_TIME_MS)
            .map(|value| value.max(0) as u32)
            .unwrap_or(DEFAULT_TIME_SAVED_MS);

        let interval_valid = (MIN_LOG_INTERVAL_MS..=MAX_LOG_INTERVAL_MS).contains(&interval_ms);
        let window_valid = (MIN_TIME_SAVED_MS..=MAX_TIME_SAVED_MS).contains(&max_time_saved_ms);
        let fits = estimate_points(interval_ms, max_time_saved_ms) <= MAX_DATA_POINTS;
        if !interval_valid || !window_valid || !fits {
            warn!("persisted data log settings invalid, using defaults");
            interval_ms = DEFAULT_LOG_INTERVAL_MS;
            max_time_saved_ms = DEFAULT_TIME_SAVED_MS;
        }

        Self {
            settings,
            logging: true,
            interval_ms,
            max_time_saved_ms,
            points: VecDeque::new(),
        }
    }

    pub fn logging_on(&mut self) -> Result<(), ControlError> {
        if self.logging {
            return Err(ControlError::InvalidState);
        }
        self.logging = true;
        Ok(())
    }

    pub fn logging_off(&mut self) -> Result<(), ControlError> {
        if !self.logging {
            return Err(ControlError::InvalidState);
        }
        self.logging = false;
        Ok(())
    }

    pub fn set_logging_enabled(&mut self, enabled: bool) -> Result<(), ControlError> {
        if enabled == self.logging {
            return Ok(());
        }
        if enabled {
            self.logging_on()
        } else {
            self.logging_off()
        }
    }

    pub fn is_logging(&self) -> bool {
        self.logging
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn max_time_saved_ms(&self) -> u32 {
        self.max_time_saved_ms
    }

    pub fn set_interval_ms(&mut self, interval_ms: u32) -> Result<(), ControlError> {
        if !(MIN_LOG_INTERVAL_MS..=MAX_LOG_INTERVAL_MS).contains(&interval_ms) {
            return Err(ControlError::InvalidArgument);
        }
        if estimate_points(interval_ms, self.max_time_saved_ms) > MAX_DATA_POINTS {
            return Err(ControlError::InvalidArgument);
        }
        self.interval_ms = interval_ms;
        self.settings
            .set_i32(KEY_LOG_INTERVAL_MS, interval_ms as i32)
            .map_err(|_| ControlError::HardwareFailure)
    }

    pub fn set_max_time_saved_ms(&mut self, window_ms: u32) -> Result<(), ControlError> {
        if !(MIN_TIME_SAVED_MS..=MAX_TIME_SAVED_MS).contains(&window_ms) {
            return Err(ControlError::InvalidArgument);
        }
        if estimate_points(self.interval_ms, window_ms) > MAX_DATA_POINTS {
            return Err(ControlError::InvalidArgument);
        }
        self.max_time_saved_ms = window_ms;
        self.settings
            .set_i32(KEY_LOG_MAX_TIME_MS, window_ms as i32)
            .map_err(|_| ControlError::HardwareFailure)
    }

    pub fn push(&mut self, point: DataPoint) {
        let retained = estimate_points(self.interval_ms, self.max_time_saved_ms)
            .clamp(1, MAX_DATA_POINTS);
        while self.points.len() >= retained {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Most recent records, oldest first. `limit == 0` returns everything.
    pub fn recent(&self, limit: usize) -> Vec<DataPoint> {
        let count = self.points.len();
        let take = if limit == 0 || limit > count {
            count
        } else {
            limit
        };
        self.points.iter().skip(count - take).copied().collect()
    }

    pub fn all(&self) -> Vec<DataPoint> {
        self.recent(0)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn storage_bytes_used(&self) -> usize {
        self.points.len() * core::mem::size_of::<DataPoint>()
    }
}

pub fn build_data_point(
    controller: &Controller<'_>,
    hardware: &dyn Hardware,
    clock: &dyn Clock,
) -> DataPoint {
    let mut temperatures_c = [0.0f32; NUM_INPUT_CHANNELS];
    for (channel, slot) in temperatures_c.iter_mut().enumerate() {
        *slot = hardware.read_thermocouple(channel) as f32;
    }

    let mut relay_states = 0u8;
    for relay in 0..NUM_RELAYS {
        if hardware.get_relay_state(relay) {
            relay_states |= 1 << relay;
        }
    }

    DataPoint {
        timestamp_s: clock.now_us() / 1_000_000,
        setpoint_c: controller.setpoint() as f32,
        process_value_c: controller.process_value() as f32,
        pid_output: controller.pid_output() as f32,
        p_term: controller.pid().previous_p() as f32,
        i_term: controller.pid().previous_i() as f32,
        d_term: controller.pid().previous_d() as f32,
        temperatures_c,
        relay_states,
        servo_angle_deg: hardware.get_servo_angle().clamp(0.0, 180.0) as u8,
        chamber_running: controller.is_running(),
    }
}

/// Samples the live state on the configured cadence.
#[embassy_executor::task]
pub async fn data_log_task(chamber: &'static Chamber) {
    loop {
        let (logging, interval_ms) = {
            let logger = chamber.logger.lock().await;
            (logger.is_logging(), logger.interval_ms())
        };

        if logging {
            let point = {
                let controller = chamber.controller.lock().await;
                build_data_point(&controller, chamber.hardware, chamber.clock)
            };
            chamber.logger.lock().await.push(point);
        }

        Timer::after_millis(u64::from(interval_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;

    fn point(timestamp_s: u64) -> DataPoint {
        DataPoint {
            timestamp_s,
            setpoint_c: 0.0,
            process_value_c: 0.0,
            pid_output: 0.0,
            p_term: 0.0,
            i_term: 0.0,
            d_term: 0.0,
            temperatures_c: [0.0; NUM_INPUT_CHANNELS],
            relay_states: 0,
            servo_angle_deg: 0,
            chamber_running: false,
        }
    }

    #[test]
    fn interval_and_window_are_validated() {
        let settings = MemorySettingsStore::new();
        let mut logger = DataLogger::new(&settings);
        assert_eq!(logger.set_interval_ms(100), Err(ControlError::InvalidArgument));
        assert_eq!(logger.set_interval_ms(20_000), Err(ControlError::InvalidArgument));
        assert_eq!(
            logger.set_max_time_saved_ms(1000),
            Err(ControlError::InvalidArgument)
        );

        logger.set_interval_ms(500).unwrap();
        logger.set_max_time_saved_ms(10 * 60 * 1000).unwrap();
        assert_eq!(settings.get_i32(KEY_LOG_INTERVAL_MS), Ok(500));
    }

    #[test]
    fn window_and_interval_must_fit_the_point_cap() {
        let settings = MemorySettingsStore::new();
        let mut logger = DataLogger::new(&settings);
        logger.set_max_time_saved_ms(MIN_TIME_SAVED_MS).unwrap();
        logger.set_interval_ms(250).unwrap();
        // 24 h at 250 ms would be 345600 points, far over the cap.
        assert_eq!(
            logger.set_max_time_saved_ms(MAX_TIME_SAVED_MS),
            Err(ControlError::InvalidArgument)
        );
    }

    #[test]
    fn retention_drops_the_oldest_records() {
        let settings = MemorySettingsStore::new();
        let mut logger = DataLogger::new(&settings);
        // 1 minute window at 1 s interval: 60 retained points.
        logger.set_max_time_saved_ms(MIN_TIME_SAVED_MS).unwrap();

        for timestamp in 0..100 {
            logger.push(point(timestamp));
        }
        assert_eq!(logger.point_count(), 60);
        let recent = logger.recent(0);
        assert_eq!(recent.first().unwrap().timestamp_s, 40);
        assert_eq!(recent.last().unwrap().timestamp_s, 99);
    }

    #[test]
    fn recent_returns_the_tail_in_order() {
        let settings = MemorySettingsStore::new();
        let mut logger = DataLogger::new(&settings);
        for timestamp in 0..10 {
            logger.push(point(timestamp));
        }
        let tail = logger.recent(3);
        let stamps: Vec<u64> = tail.iter().map(|p| p.timestamp_s).collect();
        assert_eq!(stamps, vec![7, 8, 9]);

        logger.clear();
        assert_eq!(logger.point_count(), 0);
        assert_eq!(logger.storage_bytes_used(), 0);
    }

    #[test]
    fn logging_toggle_rejects_redundant_transitions() {
        let settings = MemorySettingsStore::new();
        let mut logger = DataLogger::new(&settings);
        assert!(logger.is_logging());
        assert_eq!(logger.logging_on(), Err(ControlError::InvalidState));
        logger.logging_off().unwrap();
        assert_eq!(logger.logging_off(), Err(ControlError::InvalidState));
        // The idempotent setter swallows the no-op.
        logger.set_logging_enabled(false).unwrap();
        logger.set_logging_enabled(true).unwrap();
        assert!(logger.is_logging());
    }

    #[test]
    fn invalid_persisted_settings_fall_back_to_defaults() {
        let settings = MemorySettingsStore::new();
        settings.set_i32(KEY_LOG_INTERVAL_MS, 50).unwrap();
        settings.set_i32(KEY_LOG_MAX_TIME_MS, 1000).unwrap();
        let logger = DataLogger::new(&settings);
        assert_eq!(logger.interval_ms(), 1000);
        assert_eq!(logger.max_time_saved_ms(), 30 * 60 * 1000);
    }
}
