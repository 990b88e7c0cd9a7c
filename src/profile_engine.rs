//! Profile execution engine.
//!
//! Owns slot persistence (0..4), the single uploaded profile and the single
//! running profile. Each control tick advances the active step and writes
//! the setpoint through [`ControllerHandle`]; the setpoint lock is acquired
//! on start and released on end, whatever the end reason.

use std::collections::HashMap;

use log::{info, warn};
use serde::Serialize;

use crate::controller::ControllerHandle;
use crate::profile::{
    parse_profile_json, serialize_profile_json, validate_profile, ProfileDefinition, ProfileStep,
    ProfileValidationError, MAX_SLOTS,
};
use crate::settings::{slot_blob_key, slot_name_key, SettingsError, SettingsStore};
use crate::ControlError;

/// Bound on step boundaries crossed per tick; pathological jump graphs end
/// the run instead of livelocking the control thread.
pub const MAX_TRANSITIONS_PER_TICK: usize = 256;

/// PV proximity that satisfies a `wait` latch.
pub const WAIT_PV_TOLERANCE_C: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileEndReason {
    None,
    Completed,
    CancelledByUser,
    ControllerStopped,
    TransitionGuard,
    StartFailed,
    InvalidProfile,
}

impl ProfileEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileEndReason::None => "none",
            ProfileEndReason::Completed => "completed",
            ProfileEndReason::CancelledByUser => "cancelled_by_user",
            ProfileEndReason::ControllerStopped => "controller_stopped",
            ProfileEndReason::TransitionGuard => "transition_guard",
            ProfileEndReason::StartFailed => "start_failed",
            ProfileEndReason::InvalidProfile => "invalid_profile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileSource {
    None,
    Uploaded,
    Slot,
}

impl ProfileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileSource::None => "none",
            ProfileSource::Uploaded => "uploaded",
            ProfileSource::Slot => "slot",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSlotSummary {
    pub slot_index: usize,
    pub occupied: bool,
    pub name: String,
    pub step_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileRuntimeStatus {
    pub running: bool,
    pub name: String,
    pub source: ProfileSource,
    pub slot_index: Option<usize>,
    /// 1-based; 0 while no profile runs.
    pub current_step_number: usize,
    pub current_step_type: &'static str,
    pub step_elapsed_s: f64,
    pub profile_elapsed_s: f64,
    pub last_end_reason: ProfileEndReason,
}

pub struct ProfileEngine<'a> {
    settings: &'a dyn SettingsStore,

    uploaded: Option<ProfileDefinition>,

    running: bool,
    active: ProfileDefinition,
    source: ProfileSource,
    slot_index: Option<usize>,
    current_step_index: usize,
    step_elapsed_s: f64,
    profile_elapsed_s: f64,
    step_start_setpoint_c: f64,
    wait_time_latched: bool,
    wait_pv_latched: bool,
    soak_accumulated_s: f64,
    jump_remaining: HashMap<usize, u32>,
    last_end_reason: ProfileEndReason,
}

impl<'a> ProfileEngine<'a> {
    pub fn new(settings: &'a dyn SettingsStore) -> Self {
        Self {
            settings,
            uploaded: None,
            running: false,
            active: ProfileDefinition::default(),
            source: ProfileSource::None,
            slot_index: None,
            current_step_index: 0,
            step_elapsed_s: 0.0,
            profile_elapsed_s: 0.0,
            step_start_setpoint_c: 0.0,
            wait_time_latched: false,
            wait_pv_latched: false,
            soak_accumulated_s: 0.0,
            jump_remaining: HashMap::new(),
            last_end_reason: ProfileEndReason::None,
        }
    }

    // ------------------------------------------------------------------
    // Uploaded profile
    // ------------------------------------------------------------------

    pub fn set_uploaded_profile(
        &mut self,
        profile: ProfileDefinition,
    ) -> Result<(), Vec<ProfileValidationError>> {
        let errors = validate_profile(&profile);
        if !errors.is_empty() {
            return Err(errors);
        }
        self.uploaded = Some(profile);
        Ok(())
    }

    pub fn uploaded_profile(&self) -> Option<&ProfileDefinition> {
        self.uploaded.as_ref()
    }

    pub fn clear_uploaded_profile(&mut self) {
        self.uploaded = None;
    }

    // ------------------------------------------------------------------
    // Slot storage
    // ------------------------------------------------------------------

    pub fn slot_summaries(&self) -> Vec<ProfileSlotSummary> {
        (0..MAX_SLOTS)
            .map(|slot| match self.load_slot(slot) {
                Ok(profile) => ProfileSlotSummary {
                    slot_index: slot,
                    occupied: true,
                    name: profile.name,
                    step_count: profile.steps.len(),
                },
                Err(_) => ProfileSlotSummary {
                    slot_index: slot,
                    occupied: false,
                    name: String::new(),
                    step_count: 0,
                },
            })
            .collect()
    }

    pub fn slot_profile(&self, slot: usize) -> Result<ProfileDefinition, ControlError> {
        self.load_slot(slot)
    }

    /// Saving refuses an occupied slot; delete it first.
    pub fn save_profile_to_slot(
        &self,
        slot: usize,
        profile: &ProfileDefinition,
    ) -> Result<(), ControlError> {
        if slot >= MAX_SLOTS {
            return Err(ControlError::InvalidArgument);
        }
        if !validate_profile(profile).is_empty() {
            return Err(ControlError::InvalidArgument);
        }

        match self.settings.get_string(&slot_blob_key(slot)) {
            Ok(_) => return Err(ControlError::InvalidState),
            Err(SettingsError::NotFound) => {}
            Err(_) => return Err(ControlError::HardwareFailure),
        }

        let json = serialize_profile_json(profile);
        if json.is_empty() {
            return Err(ControlError::InvalidArgument);
        }
        self.settings
            .set_string(&slot_blob_key(slot), &json)
            .map_err(|_| ControlError::HardwareFailure)?;
        self.settings
            .set_string(&slot_name_key(slot), &profile.name)
            .map_err(|_| ControlError::HardwareFailure)
    }

    pub fn delete_slot_profile(&self, slot: usize) -> Result<(), ControlError> {
        if slot >= MAX_SLOTS {
            return Err(ControlError::InvalidArgument);
        }
        self.settings
            .delete(&slot_blob_key(slot))
            .map_err(|_| ControlError::HardwareFailure)?;
        self.settings
            .delete(&slot_name_key(slot))
            .map_err(|_| ControlError::HardwareFailure)
    }

    fn load_slot(&self, slot: usize) -> Result<ProfileDefinition, ControlError> {
        if slot >= MAX_SLOTS {
            return Err(ControlError::InvalidArgument);
        }
        let json = match self.settings.get_string(&slot_blob_key(slot)) {
            Ok(json) => json,
            Err(SettingsError::NotFound) => return Err(ControlError::NotFound),
            Err(_) => return Err(ControlError::HardwareFailure),
        };
        parse_profile_json(&json).map_err(|_| ControlError::InvalidArgument)
    }

    // ------------------------------------------------------------------
    // Run control
    // ------------------------------------------------------------------

    pub fn start_from_uploaded(
        &mut self,
        controller: &mut dyn ControllerHandle,
    ) -> Result<(), ControlError> {
        if self.running {
            return Err(ControlError::InvalidState);
        }
        let profile = self.uploaded.clone().ok_or(ControlError::NotFound)?;
        self.start_with(profile, ProfileSource::Uploaded, None, controller)
    }

    pub fn start_from_slot(
        &mut self,
        slot: usize,
        controller: &mut dyn ControllerHandle,
    ) -> Result<(), ControlError> {
        if self.running {
            return Err(ControlError::InvalidState);
        }
        let profile = self.load_slot(slot)?;
        self.start_with(profile, ProfileSource::Slot, Some(slot), controller)
    }

    fn start_with(
        &mut self,
        profile: ProfileDefinition,
        source: ProfileSource,
        slot: Option<usize>,
        controller: &mut dyn ControllerHandle,
    ) -> Result<(), ControlError> {
        if !validate_profile(&profile).is_empty() {
            self.last_end_reason = ProfileEndReason::InvalidProfile;
            return Err(ControlError::InvalidArgument);
        }

        self.active = profile;
        self.source = source;
        self.slot_index = slot;

        self.jump_remaining.clear();
        for (index, step) in self.active.steps.iter().enumerate() {
            if let ProfileStep::Jump { repeat_count, .. } = step {
                self.jump_remaining.insert(index, *repeat_count);
            }
        }

        self.running = true;
        self.last_end_reason = ProfileEndReason::None;
        self.profile_elapsed_s = 0.0;
        self.enter_step(0, controller);
        controller.set_profile_setpoint_lock(true);
        info!("profile '{}' started", self.active.name);

        if !controller.is_running() {
            if let Err(err) = controller.start() {
                warn!("profile start refused by controller: {err}");
                self.end_run(ProfileEndReason::StartFailed, false, controller);
                return Err(err);
            }
        }

        // Leading zero-duration steps execute immediately.
        self.drain_transitions(0.0, controller);
        Ok(())
    }

    pub fn cancel(&mut self, controller: &mut dyn ControllerHandle) -> Result<(), ControlError> {
        if !self.running {
            return Err(ControlError::InvalidState);
        }
        self.end_run(ProfileEndReason::CancelledByUser, true, controller);
        Ok(())
    }

    /// Advance the active profile. Invoked on the control cadence before the
    /// controller tick so the setpoint is fresh when the PID reads it.
    pub fn tick(&mut self, dt_s: f64, controller: &mut dyn ControllerHandle) {
        if !self.running {
            return;
        }
        if !controller.is_running() {
            self.end_run(ProfileEndReason::ControllerStopped, false, controller);
            return;
        }
        self.drain_transitions(dt_s, controller);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn last_end_reason(&self) -> ProfileEndReason {
        self.last_end_reason
    }

    pub fn runtime_status(&self) -> ProfileRuntimeStatus {
        if !self.running {
            return ProfileRuntimeStatus {
                running: false,
                name: String::new(),
                source: ProfileSource::None,
                slot_index: None,
                current_step_number: 0,
                current_step_type: "none",
                step_elapsed_s: 0.0,
                profile_elapsed_s: 0.0,
                last_end_reason: self.last_end_reason,
            };
        }

        ProfileRuntimeStatus {
            running: true,
            name: self.active.name.clone(),
            source: self.source,
            slot_index: self.slot_index,
            current_step_number: self.current_step_index + 1,
            current_step_type: self
                .active
                .steps
                .get(self.current_step_index)
                .map_or("none", ProfileStep::type_str),
            step_elapsed_s: self.step_elapsed_s,
            profile_elapsed_s: self.profile_elapsed_s,
            last_end_reason: self.last_end_reason,
        }
    }

    // ------------------------------------------------------------------
    // Step machine
    // ------------------------------------------------------------------

    fn drain_transitions(&mut self, mut dt_s: f64, controller: &mut dyn ControllerHandle) {
        let mut transitions = 0usize;
        while self.running {
            let before = self.current_step_index;
            let keep_running = self.execute_current_step(dt_s, &mut transitions, controller);
            dt_s = 0.0;
            if !keep_running || self.current_step_index == before {
                break;
            }
        }
    }

    fn enter_step(&mut self, step_index: usize, controller: &mut dyn ControllerHandle) -> bool {
        if step_index >= self.active.steps.len() {
            return false;
        }
        self.current_step_index = step_index;
        self.step_elapsed_s = 0.0;
        self.wait_time_latched = false;
        self.wait_pv_latched = false;
        self.soak_accumulated_s = 0.0;
        self.step_start_setpoint_c = controller.setpoint();
        true
    }

    /// Execute one evaluation of the current step. Returns false when the
    /// run ended. On advancement the caller loops so zero-duration steps
    /// chain within the tick, bounded by the transition guard.
    fn execute_current_step(
        &mut self,
        dt_s: f64,
        transitions: &mut usize,
        controller: &mut dyn ControllerHandle,
    ) -> bool {
        let Some(step) = self.active.steps.get(self.current_step_index).cloned() else {
            return false;
        };
        let dt_s = dt_s.max(0.0);

        self.step_elapsed_s += dt_s;
        self.profile_elapsed_s += dt_s;

        let mut advance = false;
        let mut next_step_index = self.current_step_index + 1;

        match step {
            ProfileStep::Direct { setpoint_c } => {
                let _ = controller.set_setpoint_from_profile(setpoint_c);
                advance = true;
            }

            ProfileStep::Wait {
                wait_time_s,
                pv_target_c,
            } => {
                if let Some(wait_time_s) = wait_time_s {
                    if !self.wait_time_latched && self.step_elapsed_s >= wait_time_s {
                        self.wait_time_latched = true;
                    }
                }
                if let Some(pv_target_c) = pv_target_c {
                    if !self.wait_pv_latched
                        && (controller.process_value() - pv_target_c).abs() <= WAIT_PV_TOLERANCE_C
                    {
                        self.wait_pv_latched = true;
                    }
                }

                let time_satisfied = wait_time_s.is_none() || self.wait_time_latched;
                let pv_satisfied = pv_target_c.is_none() || self.wait_pv_latched;
                advance = time_satisfied && pv_satisfied;
            }

            ProfileStep::Soak {
                setpoint_c,
                soak_time_s,
                guaranteed,
                deviation_c,
            } => {
                let _ = controller.set_setpoint_from_profile(setpoint_c);
                if !guaranteed {
                    self.soak_accumulated_s += dt_s;
                } else {
                    let deviation = deviation_c.unwrap_or(0.0);
                    if (controller.process_value() - setpoint_c).abs() <= deviation {
                        self.soak_accumulated_s += dt_s;
                    }
                }
                advance = self.soak_accumulated_s >= soak_time_s;
            }

            ProfileStep::RampTime {
                setpoint_c,
                ramp_time_s,
            } => {
                let duration = ramp_time_s.max(0.001);
                let progress = (self.step_elapsed_s / duration).clamp(0.0, 1.0);
                let setpoint = self.step_start_setpoint_c
                    + (setpoint_c - self.step_start_setpoint_c) * progress;
                let _ = controller.set_setpoint_from_profile(setpoint);
                advance = self.step_elapsed_s >= duration;
            }

            ProfileStep::RampRate {
                setpoint_c,
                ramp_rate_c_per_s,
            } => {
                let delta = setpoint_c - self.step_start_setpoint_c;
                let duration = (delta.abs() / ramp_rate_c_per_s.max(0.001)).max(0.001);
                let progress = (self.step_elapsed_s / duration).clamp(0.0, 1.0);
                let _ = controller
                    .set_setpoint_from_profile(self.step_start_setpoint_c + delta * progress);
                advance = self.step_elapsed_s >= duration;
            }

            ProfileStep::Jump {
                target_step_number,
                repeat_count,
            } => {
                let remaining = self
                    .jump_remaining
                    .get(&self.current_step_index)
                    .copied()
                    .unwrap_or(repeat_count);
                if remaining > 0 {
                    self.jump_remaining
                        .insert(self.current_step_index, remaining - 1);
                    next_step_index = target_step_number - 1;
                    // Inner loops restart for every pass of the outer loop.
                    self.reset_jump_counters_in_range(next_step_index, self.current_step_index);
                } else {
                    // Re-arm for outer re-entry, then fall through forward.
                    self.jump_remaining
                        .insert(self.current_step_index, repeat_count);
                }
                advance = true;
            }
        }

        if !advance {
            return true;
        }

        *transitions += 1;
        if *transitions > MAX_TRANSITIONS_PER_TICK {
            warn!("profile transition guard tripped");
            self.end_run(ProfileEndReason::TransitionGuard, true, controller);
            return false;
        }

        if next_step_index >= self.active.steps.len() {
            self.end_run(ProfileEndReason::Completed, true, controller);
            return false;
        }

        if !self.enter_step(next_step_index, controller) {
            self.end_run(ProfileEndReason::InvalidProfile, true, controller);
            return false;
        }

        true
    }

    fn reset_jump_counters_in_range(&mut self, start_inclusive: usize, end_exclusive: usize) {
        let end = end_exclusive.min(self.active.steps.len());
        for (index, step) in self.active.steps.iter().enumerate() {
            if index < start_inclusive || index >= end {
                continue;
            }
            if let ProfileStep::Jump { repeat_count, .. } = step {
                self.jump_remaining.insert(index, *repeat_count);
            }
        }
    }

    fn end_run(
        &mut self,
        reason: ProfileEndReason,
        stop_chamber: bool,
        controller: &mut dyn ControllerHandle,
    ) {
        let was_running = self.running;
        self.running = false;
        self.last_end_reason = reason;

        info!("profile ended: {}", reason.as_str());

        self.active = ProfileDefinition::default();
        self.source = ProfileSource::None;
        self.slot_index = None;
        self.current_step_index = 0;
        self.step_elapsed_s = 0.0;
        self.profile_elapsed_s = 0.0;
        self.step_start_setpoint_c = 0.0;
        self.wait_time_latched = false;
        self.wait_pv_latched = false;
        self.soak_accumulated_s = 0.0;
        self.jump_remaining.clear();

        controller.set_profile_setpoint_lock(false);

        if stop_chamber && was_running && controller.is_running() {
            let _ = controller.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;

    /// Minimal chamber stand-in: records setpoint writes and run commands.
    struct StubChamber {
        setpoint_c: f64,
        process_value_c: f64,
        running: bool,
        locked: bool,
        refuse_start: bool,
        setpoint_writes: Vec<f64>,
        stop_count: usize,
    }

    impl StubChamber {
        fn new() -> Self {
            Self {
                setpoint_c: 0.0,
                process_value_c: 25.0,
                running: false,
                locked: false,
                refuse_start: false,
                setpoint_writes: Vec::new(),
                stop_count: 0,
            }
        }
    }

    impl ControllerHandle for StubChamber {
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
            self.setpoint_c = setpoint_c;
            self.setpoint_writes.push(setpoint_c);
            Ok(())
        }

        fn set_profile_setpoint_lock(&mut self, locked: bool) {
            self.locked = locked;
        }

        fn start(&mut self) -> Result<(), ControlError> {
            if self.refuse_start {
                return Err(ControlError::InvalidState);
            }
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) -> Result<(), ControlError> {
            self.running = false;
            self.stop_count += 1;
            Ok(())
        }
    }

    fn profile(steps: Vec<ProfileStep>) -> ProfileDefinition {
        ProfileDefinition {
            name: "test".into(),
            steps,
            ..ProfileDefinition::default()
        }
    }

    fn engine(settings: &MemorySettingsStore) -> ProfileEngine<'_> {
        ProfileEngine::new(settings)
    }

    #[test]
    fn direct_ramp_soak_jump_sequence_runs_to_completion() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        engine
            .set_uploaded_profile(profile(vec![
                ProfileStep::Direct { setpoint_c: 50.0 },
                ProfileStep::RampTime {
                    setpoint_c: 100.0,
                    ramp_time_s: 60.0,
                },
                ProfileStep::Soak {
                    setpoint_c: 100.0,
                    soak_time_s: 30.0,
                    guaranteed: true,
                    deviation_c: Some(2.0),
                },
                ProfileStep::Jump {
                    target_step_number: 1,
                    repeat_count: 1,
                },
            ]))
            .unwrap();

        engine.start_from_uploaded(&mut chamber).unwrap();
        assert!(chamber.running);
        assert!(chamber.locked);
        // The leading direct step executed during start.
        assert_eq!(chamber.setpoint_c, 50.0);
        assert_eq!(engine.runtime_status().current_step_number, 2);

        // PV tracks SP within the guaranteed band.
        let dt = 0.25;
        let mut elapsed = 0.0;
        while engine.is_running() && elapsed < 400.0 {
            chamber.process_value_c = chamber.setpoint_c;
            engine.tick(dt, &mut chamber);
            elapsed += dt;
        }

        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::Completed);
        // The jump re-enters at the direct step, so the whole ramp+soak body
        // runs twice: about 2 x (60 + 30) seconds.
        assert!(elapsed >= 120.0 && elapsed < 200.0, "elapsed {elapsed}");
        assert!(!chamber.locked);
        assert_eq!(chamber.stop_count, 1);
    }

    #[test]
    fn ramp_time_interpolates_linearly_from_entry_setpoint() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();
        chamber.setpoint_c = 40.0;

        engine
            .set_uploaded_profile(profile(vec![
                ProfileStep::Direct { setpoint_c: 40.0 },
                ProfileStep::RampTime {
                    setpoint_c: 140.0,
                    ramp_time_s: 100.0,
                },
            ]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();

        engine.tick(25.0, &mut chamber);
        assert!((chamber.setpoint_c - 65.0).abs() < 1e-9);
        engine.tick(25.0, &mut chamber);
        assert!((chamber.setpoint_c - 90.0).abs() < 1e-9);
        engine.tick(50.0, &mut chamber);
        assert!((chamber.setpoint_c - 140.0).abs() < 1e-9);
        assert_eq!(engine.last_end_reason(), ProfileEndReason::Completed);
    }

    #[test]
    fn ramp_rate_duration_follows_the_delta() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        engine
            .set_uploaded_profile(profile(vec![
                ProfileStep::Direct { setpoint_c: 100.0 },
                // 50 degrees down at 2 deg/s: 25 seconds.
                ProfileStep::RampRate {
                    setpoint_c: 50.0,
                    ramp_rate_c_per_s: 2.0,
                },
            ]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();

        engine.tick(12.5, &mut chamber);
        assert!((chamber.setpoint_c - 75.0).abs() < 1e-9);
        engine.tick(12.5, &mut chamber);
        assert!((chamber.setpoint_c - 50.0).abs() < 1e-9);
        assert!(!engine.is_running());
    }

    #[test]
    fn wait_latches_fire_independently_and_stick() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();
        chamber.process_value_c = 0.0;

        engine
            .set_uploaded_profile(profile(vec![
                ProfileStep::Direct { setpoint_c: 100.0 },
                ProfileStep::Wait {
                    wait_time_s: Some(10.0),
                    pv_target_c: Some(100.0),
                },
            ]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();

        // PV touches the target band before the time latch is up; the PV
        // latch sticks even though the PV leaves again.
        chamber.process_value_c = 99.2;
        engine.tick(0.25, &mut chamber);
        assert!(engine.is_running());

        chamber.process_value_c = 0.0;
        engine.tick(5.0, &mut chamber);
        assert!(engine.is_running());

        engine.tick(5.0, &mut chamber);
        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::Completed);
    }

    #[test]
    fn guaranteed_soak_only_accumulates_inside_the_band() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        engine
            .set_uploaded_profile(profile(vec![ProfileStep::Soak {
                setpoint_c: 100.0,
                soak_time_s: 10.0,
                guaranteed: true,
                deviation_c: Some(2.0),
            }]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();

        // Outside the band: nothing accumulates.
        chamber.process_value_c = 50.0;
        for _ in 0..100 {
            engine.tick(0.25, &mut chamber);
        }
        assert!(engine.is_running());

        chamber.process_value_c = 99.0;
        for _ in 0..40 {
            engine.tick(0.25, &mut chamber);
        }
        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::Completed);
    }

    #[test]
    fn nested_jumps_multiply_the_body_count() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        let r_inner = 2u32;
        let r_outer = 1u32;
        engine
            .set_uploaded_profile(profile(vec![
                ProfileStep::Direct { setpoint_c: 50.0 },
                ProfileStep::Jump {
                    target_step_number: 1,
                    repeat_count: r_inner,
                },
                ProfileStep::Jump {
                    target_step_number: 1,
                    repeat_count: r_outer,
                },
            ]))
            .unwrap();
        // Zero-duration steps: the whole profile drains inside start.
        engine.start_from_uploaded(&mut chamber).unwrap();

        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::Completed);
        let body_runs = chamber
            .setpoint_writes
            .iter()
            .filter(|&&sp| sp == 50.0)
            .count();
        assert_eq!(body_runs as u32, (r_outer + 1) * (r_inner + 1));
    }

    #[test]
    fn transition_guard_ends_the_run_and_stops_the_chamber() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        engine
            .set_uploaded_profile(profile(vec![
                ProfileStep::Direct { setpoint_c: 50.0 },
                ProfileStep::Jump {
                    target_step_number: 1,
                    repeat_count: 10_000,
                },
            ]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();

        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::TransitionGuard);
        assert!(!chamber.running);
        assert!(!chamber.locked);
    }

    #[test]
    fn controller_stop_is_detected_on_the_next_tick() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        engine
            .set_uploaded_profile(profile(vec![ProfileStep::Wait {
                wait_time_s: Some(1000.0),
                pv_target_c: None,
            }]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();
        assert!(engine.is_running());

        chamber.running = false;
        engine.tick(0.25, &mut chamber);
        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::ControllerStopped);
        assert!(!chamber.locked);
        // The chamber already stopped; the engine must not stop it again.
        assert_eq!(chamber.stop_count, 0);
    }

    #[test]
    fn refused_start_rolls_back_and_releases_the_lock() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();
        chamber.refuse_start = true;

        engine
            .set_uploaded_profile(profile(vec![ProfileStep::Direct { setpoint_c: 50.0 }]))
            .unwrap();
        let result = engine.start_from_uploaded(&mut chamber);
        assert_eq!(result, Err(ControlError::InvalidState));
        assert!(!engine.is_running());
        assert_eq!(engine.last_end_reason(), ProfileEndReason::StartFailed);
        assert!(!chamber.locked);
    }

    #[test]
    fn cancel_requires_a_running_profile() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();
        assert_eq!(engine.cancel(&mut chamber), Err(ControlError::InvalidState));

        engine
            .set_uploaded_profile(profile(vec![ProfileStep::Wait {
                wait_time_s: Some(1000.0),
                pv_target_c: None,
            }]))
            .unwrap();
        engine.start_from_uploaded(&mut chamber).unwrap();
        engine.cancel(&mut chamber).unwrap();
        assert_eq!(engine.last_end_reason(), ProfileEndReason::CancelledByUser);
        assert!(!chamber.running);
    }

    #[test]
    fn slots_save_load_and_refuse_overwrite() {
        let settings = MemorySettingsStore::new();
        let engine = engine(&settings);
        let stored = profile(vec![ProfileStep::Direct { setpoint_c: 80.0 }]);

        assert_eq!(engine.slot_profile(0), Err(ControlError::NotFound));
        engine.save_profile_to_slot(0, &stored).unwrap();
        assert_eq!(engine.slot_profile(0).unwrap(), stored);

        // Occupied slots need an explicit delete first.
        assert_eq!(
            engine.save_profile_to_slot(0, &stored),
            Err(ControlError::InvalidState)
        );
        engine.delete_slot_profile(0).unwrap();
        engine.save_profile_to_slot(0, &stored).unwrap();

        let summaries = engine.slot_summaries();
        assert!(summaries[0].occupied);
        assert_eq!(summaries[0].name, "test");
        assert_eq!(summaries[0].step_count, 1);
        assert!(!summaries[1].occupied);

        assert_eq!(
            engine.save_profile_to_slot(MAX_SLOTS, &stored),
            Err(ControlError::InvalidArgument)
        );
    }

    #[test]
    fn start_from_slot_runs_the_stored_profile() {
        let settings = MemorySettingsStore::new();
        let mut engine = engine(&settings);
        let mut chamber = StubChamber::new();

        let stored = profile(vec![
            ProfileStep::Direct { setpoint_c: 80.0 },
            ProfileStep::Wait {
                wait_time_s: Some(5.0),
                pv_target_c: None,
            },
        ]);
        engine.save_profile_to_slot(2, &stored).unwrap();
        engine.start_from_slot(2, &mut chamber).unwrap();

        let status = engine.runtime_status();
        assert!(status.running);
        assert_eq!(status.source, ProfileSource::Slot);
        assert_eq!(status.slot_index, Some(2));
        assert_eq!(chamber.setpoint_c, 80.0);

        assert_eq!(
            engine.start_from_slot(3, &mut chamber),
            Err(ControlError::InvalidState)
        );
    }
}
