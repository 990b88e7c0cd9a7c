//! Thermal profile data model and JSON schema (v1).
//!
//! Steps are externally visible as objects tagged by `type`; absent optional
//! fields are omitted on the wire (`wait` latches, `soak` guarantee).

use serde::{Deserialize, Serialize};

use crate::controller::{MAX_SETPOINT_C, MIN_SETPOINT_C};

pub const MAX_SLOTS: usize = 5;
pub const MAX_STEPS: usize = 40;
pub const SCHEMA_VERSION: u32 = 1;

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileStep {
    /// Set the setpoint once and advance.
    Direct { setpoint_c: f64 },
    /// Hold until every requested latch (elapsed time, PV proximity) fires.
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_time_s: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pv_target_c: Option<f64>,
    },
    /// Hold the setpoint for an accumulated time; a guaranteed soak only
    /// accumulates while the PV stays within `deviation_c` of the setpoint.
    Soak {
        setpoint_c: f64,
        soak_time_s: f64,
        #[serde(default, skip_serializing_if = "is_false")]
        guaranteed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deviation_c: Option<f64>,
    },
    /// Linear setpoint interpolation over a fixed duration.
    RampTime { setpoint_c: f64, ramp_time_s: f64 },
    /// Linear setpoint interpolation at a fixed rate.
    RampRate { setpoint_c: f64, ramp_rate_c_per_s: f64 },
    /// Branch strictly backward, consuming one repeat per taken jump.
    Jump {
        target_step_number: usize,
        repeat_count: u32,
    },
}

impl ProfileStep {
    pub fn type_str(&self) -> &'static str {
        match self {
            ProfileStep::Direct { .. } => "direct",
            ProfileStep::Wait { .. } => "wait",
            ProfileStep::Soak { .. } => "soak",
            ProfileStep::RampTime { .. } => "ramp_time",
            ProfileStep::RampRate { .. } => "ramp_rate",
            ProfileStep::Jump { .. } => "jump",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDefinition {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ProfileStep>,
}

impl Default for ProfileDefinition {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            name: String::new(),
            description: String::new(),
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileValidationError {
    /// `None` is a profile-level error.
    pub step_index: Option<usize>,
    pub field: &'static str,
    pub message: &'static str,
}

impl core::fmt::Display for ProfileValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.step_index {
            Some(index) => write!(f, "step {}: {}: {}", index + 1, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

fn error(
    errors: &mut Vec<ProfileValidationError>,
    step_index: Option<usize>,
    field: &'static str,
    message: &'static str,
) {
    errors.push(ProfileValidationError {
        step_index,
        field,
        message,
    });
}

fn setpoint_in_range(setpoint_c: f64) -> bool {
    (MIN_SETPOINT_C..=MAX_SETPOINT_C).contains(&setpoint_c)
}

pub fn validate_profile(profile: &ProfileDefinition) -> Vec<ProfileValidationError> {
    let mut errors = Vec::new();

    if profile.name.is_empty() {
        error(&mut errors, None, "name", "name is required");
    }

    if profile.steps.is_empty() {
        error(&mut errors, None, "steps", "steps must not be empty");
        return errors;
    }

    if profile.steps.len() > MAX_STEPS {
        error(&mut errors, None, "steps", "too many steps");
    }

    let step_count = profile.steps.len();
    for (index, step) in profile.steps.iter().enumerate() {
        match step {
            ProfileStep::Direct { setpoint_c } => {
                if !setpoint_in_range(*setpoint_c) {
                    error(
                        &mut errors,
                        Some(index),
                        "setpoint_c",
                        "setpoint must be within [0,300]",
                    );
                }
            }
            ProfileStep::Wait {
                wait_time_s,
                pv_target_c,
            } => {
                if wait_time_s.is_none() && pv_target_c.is_none() {
                    error(
                        &mut errors,
                        Some(index),
                        "wait",
                        "wait requires wait_time_s and/or pv_target_c",
                    );
                }
                if let Some(wait_time_s) = wait_time_s {
                    if *wait_time_s <= 0.0 {
                        error(
                            &mut errors,
                            Some(index),
                            "wait_time_s",
                            "wait_time_s must be > 0",
                        );
                    }
                }
            }
            ProfileStep::Soak {
                setpoint_c,
                soak_time_s,
                guaranteed,
                deviation_c,
            } => {
                if !setpoint_in_range(*setpoint_c) {
                    error(
                        &mut errors,
                        Some(index),
                        "setpoint_c",
                        "setpoint must be within [0,300]",
                    );
                }
                if *soak_time_s <= 0.0 {
                    error(
                        &mut errors,
                        Some(index),
                        "soak_time_s",
                        "soak_time_s must be > 0",
                    );
                }
                if *guaranteed && deviation_c.map_or(true, |deviation| deviation <= 0.0) {
                    error(
                        &mut errors,
                        Some(index),
                        "deviation_c",
                        "deviation_c must be > 0 when guaranteed is true",
                    );
                }
            }
            ProfileStep::RampTime {
                setpoint_c,
                ramp_time_s,
            } => {
                if !setpoint_in_range(*setpoint_c) {
                    error(
                        &mut errors,
                        Some(index),
                        "setpoint_c",
                        "setpoint must be within [0,300]",
                    );
                }
                if *ramp_time_s <= 0.0 {
                    error(
                        &mut errors,
                        Some(index),
                        "ramp_time_s",
                        "ramp_time_s must be > 0",
                    );
                }
            }
            ProfileStep::RampRate {
                setpoint_c,
                ramp_rate_c_per_s,
            } => {
                if !setpoint_in_range(*setpoint_c) {
                    error(
                        &mut errors,
                        Some(index),
                        "setpoint_c",
                        "setpoint must be within [0,300]",
                    );
                }
                if *ramp_rate_c_per_s <= 0.0 {
                    error(
                        &mut errors,
                        Some(index),
                        "ramp_rate_c_per_s",
                        "ramp_rate_c_per_s must be > 0",
                    );
                }
            }
            ProfileStep::Jump {
                target_step_number, ..
            } => {
                if *target_step_number < 1 || *target_step_number > step_count {
                    error(
                        &mut errors,
                        Some(index),
                        "target_step_number",
                        "target_step_number out of range",
                    );
                } else if *target_step_number >= index + 1 {
                    error(
                        &mut errors,
                        Some(index),
                        "target_step_number",
                        "jump target must be backward",
                    );
                }
            }
        }
    }

    errors
}

pub fn parse_profile_json(json: &str) -> Result<ProfileDefinition, Vec<ProfileValidationError>> {
    let profile: ProfileDefinition = serde_json::from_str(json).map_err(|_| {
        vec![ProfileValidationError {
            step_index: None,
            field: "json",
            message: "invalid JSON or schema mismatch",
        }]
    })?;

    let errors = validate_profile(&profile);
    if errors.is_empty() {
        Ok(profile)
    } else {
        Err(errors)
    }
}

pub fn serialize_profile_json(profile: &ProfileDefinition) -> String {
    serde_json::to_string(profile).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_profile() -> ProfileDefinition {
        ProfileDefinition {
            schema_version: SCHEMA_VERSION,
            name: "Lead free bake".into(),
            description: "exercises every step type".into(),
            steps: vec![
                ProfileStep::Direct { setpoint_c: 50.0 },
                ProfileStep::RampTime {
                    setpoint_c: 150.0,
                    ramp_time_s: 90.0,
                },
                ProfileStep::Soak {
                    setpoint_c: 150.0,
                    soak_time_s: 60.0,
                    guaranteed: true,
                    deviation_c: Some(2.0),
                },
                ProfileStep::RampRate {
                    setpoint_c: 220.0,
                    ramp_rate_c_per_s: 1.5,
                },
                ProfileStep::Wait {
                    wait_time_s: Some(30.0),
                    pv_target_c: None,
                },
                ProfileStep::Jump {
                    target_step_number: 2,
                    repeat_count: 1,
                },
            ],
        }
    }

    #[test]
    fn json_round_trip_is_identity() {
        let profile = full_profile();
        let json = serialize_profile_json(&profile);
        let parsed = parse_profile_json(&json).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn absent_optional_fields_are_omitted() {
        let profile = ProfileDefinition {
            schema_version: SCHEMA_VERSION,
            name: "minimal".into(),
            description: String::new(),
            steps: vec![
                ProfileStep::Wait {
                    wait_time_s: Some(5.0),
                    pv_target_c: None,
                },
                ProfileStep::Soak {
                    setpoint_c: 100.0,
                    soak_time_s: 10.0,
                    guaranteed: false,
                    deviation_c: None,
                },
            ],
        };
        let json = serialize_profile_json(&profile);
        assert!(!json.contains("pv_target_c"));
        assert!(!json.contains("guaranteed"));
        assert!(!json.contains("deviation_c"));

        let parsed = parse_profile_json(&json).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn missing_schema_version_defaults_to_current() {
        let json = r#"{"name":"bare","steps":[{"type":"direct","setpoint_c":50.0}]}"#;
        let parsed = parse_profile_json(json).unwrap();
        assert_eq!(parsed.schema_version, SCHEMA_VERSION);
        assert_eq!(parsed.description, "");
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let json = r#"{"name":"bad","steps":[{"type":"sprint","setpoint_c":50.0}]}"#;
        assert!(parse_profile_json(json).is_err());
    }

    #[test]
    fn validation_flags_profile_level_errors() {
        let errors = validate_profile(&ProfileDefinition {
            name: String::new(),
            steps: Vec::new(),
            ..ProfileDefinition::default()
        });
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "name"));
        assert!(errors.iter().any(|e| e.field == "steps"));
    }

    #[test]
    fn validation_flags_step_errors() {
        let profile = ProfileDefinition {
            name: "broken".into(),
            steps: vec![
                ProfileStep::Direct { setpoint_c: 400.0 },
                ProfileStep::Wait {
                    wait_time_s: None,
                    pv_target_c: None,
                },
                ProfileStep::Soak {
                    setpoint_c: 100.0,
                    soak_time_s: 10.0,
                    guaranteed: true,
                    deviation_c: None,
                },
                // Forward jump is illegal.
                ProfileStep::Jump {
                    target_step_number: 4,
                    repeat_count: 0,
                },
            ],
            ..ProfileDefinition::default()
        };
        let errors = validate_profile(&profile);
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0].step_index, Some(0));
        assert_eq!(errors[1].field, "wait");
        assert_eq!(errors[2].field, "deviation_c");
        assert_eq!(errors[3].field, "target_step_number");
    }

    #[test]
    fn too_many_steps_is_rejected() {
        let profile = ProfileDefinition {
            name: "long".into(),
            steps: vec![ProfileStep::Direct { setpoint_c: 50.0 }; MAX_STEPS + 1],
            ..ProfileDefinition::default()
        };
        let errors = validate_profile(&profile);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "too many steps");
    }
}
