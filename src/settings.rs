//! Persistent settings port.
//!
//! Models an NVS-style store: typed get/set per short key, commit implicit
//! in every set, and a distinct not-found status so callers can fall back
//! to their defaults. Key names stay within the 15-character NVS limit.

use core::fmt;
use std::collections::HashMap;
use std::sync::Mutex;

pub const KEY_INPUT_FILTER_MS: &str = "in_filter_ms";
pub const KEY_HEAT_KP: &str = "heat_kp";
pub const KEY_HEAT_KI: &str = "heat_ki";
pub const KEY_HEAT_KD: &str = "heat_kd";
pub const KEY_COOL_KP: &str = "cool_kp";
pub const KEY_COOL_KI: &str = "cool_ki";
pub const KEY_COOL_KD: &str = "cool_kd";
pub const KEY_D_FILTER_S: &str = "d_filter_s";
pub const KEY_SP_WEIGHT: &str = "sp_weight";
pub const KEY_I_ZONE_C: &str = "i_zone_c";
pub const KEY_I_LEAK_S: &str = "i_leak_s";
pub const KEY_INPUTS_MASK: &str = "inputs_mask";
pub const KEY_RELAYS_PWM_MASK: &str = "rly_pwm_mask";
pub const KEY_RELAY_PWM_WEIGHTS: &str = "rly_pwm_wts";
pub const KEY_RELAYS_ON_MASK: &str = "rly_on_mask";
pub const KEY_DOOR_CLOSED_DEG: &str = "door_closed";
pub const KEY_DOOR_OPEN_DEG: &str = "door_open";
pub const KEY_DOOR_SPEED: &str = "door_speed";
pub const KEY_LOG_INTERVAL_MS: &str = "log_int_ms";
pub const KEY_LOG_MAX_TIME_MS: &str = "log_max_ms";

pub fn slot_blob_key(slot: usize) -> String {
    format!("slot{slot}_blob")
}

pub fn slot_name_key(slot: usize) -> String {
    format!("slot{slot}_name")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    NotFound,
    WrongType,
    Io,
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::NotFound => write!(f, "setting not found"),
            SettingsError::WrongType => write!(f, "setting has a different type"),
            SettingsError::Io => write!(f, "settings storage failure"),
        }
    }
}

pub trait SettingsStore: Send + Sync {
    fn get_f64(&self, key: &str) -> Result<f64, SettingsError>;
    fn set_f64(&self, key: &str, value: f64) -> Result<(), SettingsError>;

    fn get_u8(&self, key: &str) -> Result<u8, SettingsError>;
    fn set_u8(&self, key: &str, value: u8) -> Result<(), SettingsError>;

    fn get_i32(&self, key: &str) -> Result<i32, SettingsError>;
    fn set_i32(&self, key: &str, value: i32) -> Result<(), SettingsError>;

    fn get_string(&self, key: &str) -> Result<String, SettingsError>;
    fn set_string(&self, key: &str, value: &str) -> Result<(), SettingsError>;

    /// Small fixed arrays (e.g. the 8 relay weights). The stored array must
    /// match `out.len()` exactly.
    fn get_f64_array(&self, key: &str, out: &mut [f64]) -> Result<(), SettingsError>;
    fn set_f64_array(&self, key: &str, values: &[f64]) -> Result<(), SettingsError>;

    /// Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    F64(f64),
    U8(u8),
    I32(i32),
    Str(String),
    F64Array(Vec<f64>),
}

/// In-memory [`SettingsStore`] for host runs and tests.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Result<Value, SettingsError> {
        let values = self.values.lock().map_err(|_| SettingsError::Io)?;
        values.get(key).cloned().ok_or(SettingsError::NotFound)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut values = self.values.lock().map_err(|_| SettingsError::Io)?;
        values.insert(key.to_owned(), value);
        Ok(())
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_f64(&self, key: &str) -> Result<f64, SettingsError> {
        match self.get(key)? {
            Value::F64(value) => Ok(value),
            _ => Err(SettingsError::WrongType),
        }
    }

    fn set_f64(&self, key: &str, value: f64) -> Result<(), SettingsError> {
        self.set(key, Value::F64(value))
    }

    fn get_u8(&self, key: &str) -> Result<u8, SettingsError> {
        match self.get(key)? {
            Value::U8(value) => Ok(value),
            _ => Err(SettingsError::WrongType),
        }
    }

    fn set_u8(&self, key: &str, value: u8) -> Result<(), SettingsError> {
        self.set(key, Value::U8(value))
    }

    fn get_i32(&self, key: &str) -> Result<i32, SettingsError> {
        match self.get(key)? {
            Value::I32(value) => Ok(value),
            _ => Err(SettingsError::WrongType),
        }
    }

    fn set_i32(&self, key: &str, value: i32) -> Result<(), SettingsError> {
        self.set(key, Value::I32(value))
    }

    fn get_string(&self, key: &str) -> Result<String, SettingsError> {
        match self.get(key)? {
            Value::Str(value) => Ok(value),
            _ => Err(SettingsError::WrongType),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.set(key, Value::Str(value.to_owned()))
    }

    fn get_f64_array(&self, key: &str, out: &mut [f64]) -> Result<(), SettingsError> {
        match self.get(key)? {
            Value::F64Array(values) if values.len() == out.len() => {
                out.copy_from_slice(&values);
                Ok(())
            }
            Value::F64Array(_) => Err(SettingsError::WrongType),
            _ => Err(SettingsError::WrongType),
        }
    }

    fn set_f64_array(&self, key: &str, values: &[f64]) -> Result<(), SettingsError> {
        self.set(key, Value::F64Array(values.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<(), SettingsError> {
        let mut values = self.values.lock().map_err(|_| SettingsError::Io)?;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_found() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.get_f64("absent"), Err(SettingsError::NotFound));
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = MemorySettingsStore::new();
        store.set_f64(KEY_HEAT_KP, 12.5).unwrap();
        store.set_u8(KEY_INPUTS_MASK, 0b101).unwrap();
        store.set_string("slot0_name", "lead free").unwrap();
        assert_eq!(store.get_f64(KEY_HEAT_KP), Ok(12.5));
        assert_eq!(store.get_u8(KEY_INPUTS_MASK), Ok(0b101));
        assert_eq!(store.get_string("slot0_name").unwrap(), "lead free");
    }

    #[test]
    fn type_mismatch_is_reported() {
        let store = MemorySettingsStore::new();
        store.set_f64("value", 1.0).unwrap();
        assert_eq!(store.get_u8("value"), Err(SettingsError::WrongType));
    }

    #[test]
    fn arrays_must_match_length() {
        let store = MemorySettingsStore::new();
        store.set_f64_array(KEY_RELAY_PWM_WEIGHTS, &[1.0; 8]).unwrap();
        let mut out = [0.0; 8];
        store.get_f64_array(KEY_RELAY_PWM_WEIGHTS, &mut out).unwrap();
        assert_eq!(out, [1.0; 8]);

        let mut short = [0.0; 4];
        assert_eq!(
            store.get_f64_array(KEY_RELAY_PWM_WEIGHTS, &mut short),
            Err(SettingsError::WrongType)
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemorySettingsStore::new();
        store.set_f64("value", 1.0).unwrap();
        store.delete("value").unwrap();
        store.delete("value").unwrap();
        assert_eq!(store.get_f64("value"), Err(SettingsError::NotFound));
    }
}
