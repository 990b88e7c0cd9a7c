//! Bidirectional PID engine for the chamber.
//!
//! - Separate heating and cooling gain sets; the active set is chosen each
//!   cycle from the sign of a cooling P+D trial, because the vent door and
//!   the resistive heaters have very different plant gains
//! - Two-degree-of-freedom proportional term (setpoint weighting); the
//!   integral always acts on the true error
//! - Derivative on measurement, sign-inverted, with optional first-order
//!   filtering
//! - Integral zone gating, exponential integral leak, and exact
//!   back-calculation anti-windup
//! - Output clamped to [-100, +100]: positive drives the heater bank,
//!   negative opens the vent door

use crate::clock::Clock;
use crate::ControlError;

pub const OUTPUT_MIN: f64 = -100.0;
pub const OUTPUT_MAX: f64 = 100.0;
pub const DEFAULT_SETPOINT_WEIGHT: f64 = 0.5;

const MIN_DT_S: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

pub struct PidEngine<'a> {
    clock: &'a dyn Clock,

    heating: PidGains,
    cooling: PidGains,
    setpoint_weight: f64,
    derivative_filter_time_s: f64,
    integral_zone_c: f64,
    integral_leak_time_s: f64,

    integral: f64,
    previous_pv: f64,
    previous_error: f64,
    d_filtered: f64,
    last_time_us: u64,
    first_run: bool,

    previous_p: f64,
    previous_i: f64,
    previous_d: f64,
    previous_output: f64,
}

/// The weighted proportional term can end up on the wrong side of zero when
/// the setpoint weight shrinks the setpoint contribution; force its sign to
/// match the true error.
fn clamp_to_error_sign(p: f64, error: f64) -> f64 {
    if error > 0.0 {
        p.max(0.0)
    } else if error < 0.0 {
        p.min(0.0)
    } else {
        0.0
    }
}

impl<'a> PidEngine<'a> {
    pub fn new(clock: &'a dyn Clock, heating: PidGains, cooling: PidGains) -> Self {
        Self {
            clock,
            heating,
            cooling,
            setpoint_weight: DEFAULT_SETPOINT_WEIGHT,
            derivative_filter_time_s: 0.0,
            integral_zone_c: 0.0,
            integral_leak_time_s: 0.0,
            integral: 0.0,
            previous_pv: 0.0,
            previous_error: 0.0,
            d_filtered: 0.0,
            last_time_us: 0,
            first_run: true,
            previous_p: 0.0,
            previous_i: 0.0,
            previous_d: 0.0,
            previous_output: 0.0,
        }
    }

    /// Run one compute step. Output is always within [`OUTPUT_MIN`, `OUTPUT_MAX`].
    pub fn calculate(&mut self, setpoint: f64, process_value: f64) -> f64 {
        let now_us = self.clock.now_us();
        let error = setpoint - process_value;
        let error_weighted = self.setpoint_weight * setpoint - process_value;

        let dt = if self.first_run {
            self.previous_pv = process_value;
            self.previous_error = error;
            self.d_filtered = 0.0;
            MIN_DT_S
        } else {
            (now_us.saturating_sub(self.last_time_us) as f64 / 1e6).max(MIN_DT_S)
        };

        let d_raw = if self.first_run {
            0.0
        } else {
            // Derivative on measurement, inverted so it opposes PV rise.
            -(process_value - self.previous_pv) / dt
        };
        let alpha = if self.derivative_filter_time_s > 0.0 {
            dt / (self.derivative_filter_time_s + dt)
        } else {
            1.0
        };
        self.d_filtered = alpha * d_raw + (1.0 - alpha) * self.d_filtered;

        // A P+D trial with the cooling set decides which gain set acts this
        // cycle: negative trial means the vent would be commanded.
        let p_cool = clamp_to_error_sign(self.cooling.kp * error_weighted, error);
        let cooling_active = p_cool + self.cooling.kd * self.d_filtered < 0.0;
        let gains = if cooling_active {
            self.cooling
        } else {
            self.heating
        };

        if self.integral_leak_time_s > 0.0 {
            self.integral *= (-dt / self.integral_leak_time_s).exp();
        }

        let p_term = clamp_to_error_sign(gains.kp * error_weighted, error);
        let d_term = gains.kd * self.d_filtered;
        let pd = p_term + d_term;

        let zone_open = self.integral_zone_c == 0.0 || error.abs() <= self.integral_zone_c;
        let candidate = self.integral + error * dt;
        if cooling_active && pd < 0.0 {
            // While venting, only let the integrator retreat toward zero.
            if candidate.abs() < self.integral.abs() {
                self.integral = candidate;
            }
        } else if zone_open {
            self.integral = candidate;
        }

        let i_term = if gains.ki != 0.0 {
            let clamped = (gains.ki * self.integral).clamp(OUTPUT_MIN - pd, OUTPUT_MAX - pd);
            // Back-calculate so the stored integrator matches exactly what
            // reached the output; on error reversal it retreats immediately.
            self.integral = clamped / gains.ki;
            clamped
        } else {
            0.0
        };

        let output = (pd + i_term).clamp(OUTPUT_MIN, OUTPUT_MAX);

        self.previous_p = p_term;
        self.previous_i = i_term;
        self.previous_d = d_term;
        self.previous_output = output;
        self.previous_error = error;
        self.previous_pv = process_value;
        self.last_time_us = now_us;
        self.first_run = false;

        output
    }

    pub fn tune_heating(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), ControlError> {
        Self::check_gains(kp, ki, kd)?;
        self.heating = PidGains::new(kp, ki, kd);
        Ok(())
    }

    pub fn tune_cooling(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), ControlError> {
        Self::check_gains(kp, ki, kd)?;
        self.cooling = PidGains::new(kp, ki, kd);
        Ok(())
    }

    pub fn set_derivative_filter_time(&mut self, time_s: f64) -> Result<(), ControlError> {
        if !time_s.is_finite() || time_s < 0.0 {
            return Err(ControlError::InvalidArgument);
        }
        self.derivative_filter_time_s = time_s;
        Ok(())
    }

    pub fn set_setpoint_weight(&mut self, weight: f64) -> Result<(), ControlError> {
        if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
            return Err(ControlError::InvalidArgument);
        }
        self.setpoint_weight = weight;
        Ok(())
    }

    pub fn set_integral_zone(&mut self, zone_c: f64) -> Result<(), ControlError> {
        if !zone_c.is_finite() || zone_c < 0.0 {
            return Err(ControlError::InvalidArgument);
        }
        self.integral_zone_c = zone_c;
        Ok(())
    }

    pub fn set_integral_leak_time(&mut self, time_s: f64) -> Result<(), ControlError> {
        if !time_s.is_finite() || time_s < 0.0 {
            return Err(ControlError::InvalidArgument);
        }
        self.integral_leak_time_s = time_s;
        Ok(())
    }

    /// Clear all transient state. Tuning is kept.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_pv = 0.0;
        self.previous_error = 0.0;
        self.d_filtered = 0.0;
        self.last_time_us = 0;
        self.first_run = true;
        self.previous_p = 0.0;
        self.previous_i = 0.0;
        self.previous_d = 0.0;
        self.previous_output = 0.0;
    }

    fn check_gains(kp: f64, ki: f64, kd: f64) -> Result<(), ControlError> {
        let all_finite = kp.is_finite() && ki.is_finite() && kd.is_finite();
        if !all_finite || kp < 0.0 || ki < 0.0 || kd < 0.0 {
            return Err(ControlError::InvalidArgument);
        }
        Ok(())
    }

    pub fn heating_gains(&self) -> PidGains {
        self.heating
    }

    pub fn cooling_gains(&self) -> PidGains {
        self.cooling
    }

    pub fn setpoint_weight(&self) -> f64 {
        self.setpoint_weight
    }

    pub fn derivative_filter_time_s(&self) -> f64 {
        self.derivative_filter_time_s
    }

    pub fn integral_zone_c(&self) -> f64 {
        self.integral_zone_c
    }

    pub fn integral_leak_time_s(&self) -> f64 {
        self.integral_leak_time_s
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }

    pub fn previous_p(&self) -> f64 {
        self.previous_p
    }

    pub fn previous_i(&self) -> f64 {
        self.previous_i
    }

    pub fn previous_d(&self) -> f64 {
        self.previous_d
    }

    pub fn previous_output(&self) -> f64 {
        self.previous_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine_with<'a>(clock: &'a ManualClock, heating: PidGains, cooling: PidGains) -> PidEngine<'a> {
        PidEngine::new(clock, heating, cooling)
    }

    #[test]
    fn first_call_is_proportional_only() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(2.0, 0.0, 5.0), PidGains::new(2.0, 0.0, 5.0));
        pid.set_setpoint_weight(1.0).unwrap();

        // Derivative seeds from the first sample, so only P contributes.
        let output = pid.calculate(110.0, 100.0);
        assert!((output - 20.0).abs() < 1e-9);
        assert_eq!(pid.previous_d(), 0.0);
    }

    #[test]
    fn output_is_clamped_to_plus_minus_100() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(50.0, 0.0, 0.0), PidGains::new(50.0, 0.0, 0.0));
        pid.set_setpoint_weight(1.0).unwrap();

        assert_eq!(pid.calculate(300.0, 0.0), OUTPUT_MAX);
        clock.advance_ms(250);
        assert_eq!(pid.calculate(0.0, 300.0), OUTPUT_MIN);
    }

    #[test]
    fn back_calculation_keeps_integrator_at_the_clamp() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(0.0, 1.0, 0.0), PidGains::new(0.0, 1.0, 0.0));
        pid.set_setpoint_weight(1.0).unwrap();

        // Saturate the integrator: big error over several seconds.
        pid.calculate(300.0, 0.0);
        for _ in 0..10 {
            clock.advance_ms(1000);
            assert_eq!(pid.calculate(300.0, 0.0), OUTPUT_MAX);
        }
        // Exact back-calculation means integral == clamp / ki, not more.
        assert!((pid.integral() - 100.0).abs() < 1e-9);

        // Reversed error retreats immediately and strictly.
        let before = pid.integral().abs();
        clock.advance_ms(1000);
        let output = pid.calculate(0.0, 50.0);
        assert!(output < OUTPUT_MAX);
        assert!(pid.integral().abs() < before);
    }

    #[test]
    fn cooling_gains_take_over_when_trial_is_negative() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(10.0, 0.0, 0.0), PidGains::new(3.0, 0.0, 0.0));
        pid.set_setpoint_weight(1.0).unwrap();

        // PV far above SP: error = -175, cooling P = 3 * -175 -> clamped to -100.
        let output = pid.calculate(25.0, 200.0);
        assert_eq!(output, OUTPUT_MIN);
        assert!((pid.previous_p() - 3.0 * (25.0 - 200.0)).abs() < 1e-9 || pid.previous_p() <= OUTPUT_MIN);
    }

    #[test]
    fn integral_leak_decays_toward_zero() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(0.0, 1.0, 0.0), PidGains::new(0.0, 1.0, 0.0));
        pid.set_setpoint_weight(1.0).unwrap();
        pid.set_integral_leak_time(10.0).unwrap();

        pid.calculate(100.0, 90.0);
        clock.advance_ms(1000);
        pid.calculate(100.0, 90.0);
        let wound = pid.integral();
        assert!(wound > 0.0);

        // Hold at zero error: the leak is the only integrator change.
        for _ in 0..20 {
            clock.advance_ms(1000);
            pid.calculate(100.0, 100.0);
        }
        assert!(pid.integral() < wound * 0.2);
    }

    #[test]
    fn integral_zone_freezes_integration_outside_the_band() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(1.0, 1.0, 0.0), PidGains::new(1.0, 1.0, 0.0));
        pid.set_setpoint_weight(1.0).unwrap();
        pid.set_integral_zone(5.0).unwrap();

        pid.calculate(100.0, 0.0);
        clock.advance_ms(1000);
        pid.calculate(100.0, 0.0);
        assert_eq!(pid.integral(), 0.0);

        // Inside the band it integrates again.
        clock.advance_ms(1000);
        pid.calculate(100.0, 96.0);
        clock.advance_ms(1000);
        pid.calculate(100.0, 96.0);
        assert!(pid.integral() > 0.0);
    }

    #[test]
    fn setpoint_weight_suppresses_kick_but_not_integral() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(2.0, 1.0, 0.0), PidGains::new(2.0, 1.0, 0.0));
        pid.set_setpoint_weight(0.5).unwrap();

        // SP = 100, PV = 50: weighted error is exactly zero, true error is 50.
        pid.calculate(100.0, 50.0);
        assert_eq!(pid.previous_p(), 0.0);
        clock.advance_ms(1000);
        pid.calculate(100.0, 50.0);
        assert!(pid.previous_i() > 0.0);
    }

    #[test]
    fn weighted_p_never_flips_against_the_true_error() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(2.0, 0.0, 0.0), PidGains::new(2.0, 0.0, 0.0));
        pid.set_setpoint_weight(0.2).unwrap();

        // SP = 100, PV = 30: true error positive, weighted error negative.
        pid.calculate(100.0, 30.0);
        assert_eq!(pid.previous_p(), 0.0);
    }

    #[test]
    fn reset_clears_transient_state() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(1.0, 1.0, 1.0), PidGains::new(1.0, 1.0, 1.0));
        pid.calculate(100.0, 0.0);
        clock.advance_ms(1000);
        pid.calculate(100.0, 0.0);
        assert!(pid.integral() != 0.0);

        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.previous_output(), 0.0);

        // Next call behaves like a first run again.
        clock.advance_ms(1000);
        pid.calculate(50.0, 50.0);
        assert_eq!(pid.previous_d(), 0.0);
    }

    #[test]
    fn tuning_rejects_negative_gains() {
        let clock = ManualClock::new();
        let mut pid = engine_with(&clock, PidGains::new(1.0, 0.0, 0.0), PidGains::new(1.0, 0.0, 0.0));
        assert_eq!(pid.tune_heating(-1.0, 0.0, 0.0), Err(ControlError::InvalidArgument));
        assert_eq!(pid.set_setpoint_weight(1.5), Err(ControlError::InvalidArgument));
        assert_eq!(pid.set_derivative_filter_time(-0.1), Err(ControlError::InvalidArgument));
        assert!(pid.tune_cooling(4.0, 0.5, 0.0).is_ok());
    }
}
