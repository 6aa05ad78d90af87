//! Volume to schedule conversion for pumps.
//!
//! Two strategies exist. Fastest rate drives the pump at 100 % until the
//! volume is reached. Target rate averages a slower flow by cycling the
//! pump: each sub-cycle is on for `minimum_sec_on_per_min` seconds and off
//! for long enough that the on fraction equals `rate / fastest_rate`.

use crate::{
    components::outputs::channel::{ChannelConfig, Direction, FlowMode},
    error::{OutputError, Result},
};
use std::time::Duration;

/// One repetition of the on/off pattern used in target rate mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubCycle {
    pub on_seconds: f64,
    pub off_seconds: f64,
}

impl SubCycle {
    pub fn period_seconds(&self) -> f64 {
        self.on_seconds + self.off_seconds
    }
}

/// Schedule for one volume dispense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispensePlan {
    pub mode: FlowMode,
    pub direction: Direction,
    /// Volume to move, always positive.
    pub volume_ml: f64,
    /// Average flow rate the plan achieves.
    pub rate_ml_min: f64,
    /// Fraction of the time the pump is driven, in `(0, 1]`.
    pub duty_cycle: f64,
    /// Wall clock length of the dispense.
    pub total_seconds: f64,
    pub seconds_on: f64,
    pub seconds_off: f64,
    /// `None` in fastest rate mode, which is one continuous on period.
    pub cycle: Option<SubCycle>,
}

impl DispensePlan {
    pub fn total_duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_seconds)
    }

    /// How many sub-cycles fit in the dispense, fractional for a partial
    /// last cycle.
    pub fn repeats(&self) -> f64 {
        match self.cycle {
            Some(cycle) => self.total_seconds / cycle.period_seconds(),
            None => 1.0,
        }
    }

    /// Human readable summary used for logs and status strings.
    pub fn describe(&self) -> String {
        let direction = match self.direction {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        };
        match (self.mode, self.cycle) {
            (FlowMode::SpecifyFlowRate, Some(cycle)) => format!(
                "Dispensing {:.1} ml {direction} at {:.1} ml/min over {:.1} seconds \
                 (duty cycle {:.1} %, on {:.1} s / off {:.1} s per cycle)",
                self.volume_ml,
                self.rate_ml_min,
                self.total_seconds,
                self.duty_cycle * 100.0,
                cycle.on_seconds,
                cycle.off_seconds
            ),
            _ => format!(
                "Turning pump on for {:.1} seconds {direction} to dispense {:.1} ml \
                 (at {:.1} ml/min, the fastest flow rate).",
                self.total_seconds, self.volume_ml, self.rate_ml_min
            ),
        }
    }
}

fn check_volume(volume_ml: f64) -> Result<()> {
    if volume_ml == 0.0 || !volume_ml.is_finite() {
        return Err(OutputError::Config(format!(
            "volume must be a non-zero number, got {volume_ml}"
        )));
    }
    Ok(())
}

fn check_rate(fastest_rate: f64) -> Result<()> {
    if !(fastest_rate > 0.0 && fastest_rate.is_finite()) {
        return Err(OutputError::Config(format!(
            "fastest rate must be greater than 0, got {fastest_rate}"
        )));
    }
    Ok(())
}

/// Slowest average rate target rate mode can achieve.
pub fn slowest_rate(fastest_rate: f64, minimum_sec_on_per_min: f64) -> f64 {
    fastest_rate / 60.0 * minimum_sec_on_per_min
}

/// Clamp a requested rate into what the pump can deliver.
pub fn clamp_rate(desired_rate: f64, fastest_rate: f64, minimum_sec_on_per_min: f64) -> f64 {
    let slowest = slowest_rate(fastest_rate, minimum_sec_on_per_min);
    desired_rate.clamp(slowest, fastest_rate)
}

/// Plan a dispense at 100 % duty.
///
/// * `volume_ml`: signed volume, the sign selects the direction.
/// * `fastest_rate`: calibrated rate at 100 % duty (ml/min).
pub fn fastest_rate(volume_ml: f64, fastest_rate: f64) -> Result<DispensePlan> {
    check_volume(volume_ml)?;
    check_rate(fastest_rate)?;
    let total_seconds = volume_ml.abs() / fastest_rate * 60.0;
    Ok(DispensePlan {
        mode: FlowMode::FastestFlowRate,
        direction: Direction::from_amount(volume_ml),
        volume_ml: volume_ml.abs(),
        rate_ml_min: fastest_rate,
        duty_cycle: 1.0,
        total_seconds,
        seconds_on: total_seconds,
        seconds_off: 0.0,
        cycle: None,
    })
}

/// Plan a dispense averaging `desired_rate`, clamped into the achievable
/// range `[fastest / 60 * minimum_sec_on_per_min, fastest]`.
pub fn target_rate(
    volume_ml: f64,
    desired_rate: f64,
    fastest_rate: f64,
    minimum_sec_on_per_min: f64,
) -> Result<DispensePlan> {
    check_volume(volume_ml)?;
    check_rate(fastest_rate)?;
    if !(minimum_sec_on_per_min > 0.0 && minimum_sec_on_per_min <= 60.0) {
        return Err(OutputError::Config(format!(
            "minimum_sec_on_per_min must be within (0, 60], got {minimum_sec_on_per_min}"
        )));
    }
    if !desired_rate.is_finite() {
        return Err(OutputError::Config(format!(
            "flow rate must be a number, got {desired_rate}"
        )));
    }

    let rate = clamp_rate(desired_rate, fastest_rate, minimum_sec_on_per_min);
    let duty_cycle = rate / fastest_rate;
    let total_seconds = volume_ml.abs() / rate * 60.0;
    let seconds_on = total_seconds * duty_cycle;
    let on_seconds = minimum_sec_on_per_min;
    let off_seconds = minimum_sec_on_per_min / duty_cycle - minimum_sec_on_per_min;

    Ok(DispensePlan {
        mode: FlowMode::SpecifyFlowRate,
        direction: Direction::from_amount(volume_ml),
        volume_ml: volume_ml.abs(),
        rate_ml_min: rate,
        duty_cycle,
        total_seconds,
        seconds_on,
        seconds_off: total_seconds - seconds_on,
        cycle: Some(SubCycle {
            on_seconds,
            off_seconds,
        }),
    })
}

/// Plan a dispense using the channel's configured flow mode.
pub fn plan(volume_ml: f64, channel: &ChannelConfig) -> Result<DispensePlan> {
    match channel.flow_mode {
        FlowMode::FastestFlowRate => fastest_rate(volume_ml, channel.fastest_dispense_rate_ml_min),
        FlowMode::SpecifyFlowRate => target_rate(
            volume_ml,
            channel.flow_rate,
            channel.fastest_dispense_rate_ml_min,
            channel.minimum_sec_on_per_min,
        ),
    }
}
