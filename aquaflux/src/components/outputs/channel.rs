use crate::error::{OutputError, Result};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Requested state in a switch command.
#[derive(
    EnumString, Display, IntoStaticStr, Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    On,
    Off,
}

/// Actuation types an output family declares it can perform.
#[derive(
    EnumString, Display, IntoStaticStr, Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq,
)]
pub enum OutputType {
    #[strum(serialize = "on_off")]
    #[serde(rename = "on_off")]
    OnOff,
    #[strum(serialize = "pwm")]
    #[serde(rename = "pwm")]
    Pwm,
    #[strum(serialize = "vol")]
    #[serde(rename = "vol")]
    Volume,
    #[strum(serialize = "value")]
    #[serde(rename = "value")]
    Value,
}

/// What the `amount` of a switch command means.
#[derive(
    EnumString, Display, IntoStaticStr, Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActuationKind {
    /// On for `amount` seconds, or indefinitely without an amount.
    Sec,
    /// Duty cycle in percent.
    Pwm,
    /// Volume in millilitres, negative reverses a motor pump.
    Vol,
    /// A raw value for value type outputs.
    Value,
}

impl ActuationKind {
    /// Declared output type a request of this kind needs.
    pub fn required_type(self) -> OutputType {
        match self {
            ActuationKind::Sec => OutputType::OnOff,
            ActuationKind::Pwm => OutputType::Pwm,
            ActuationKind::Vol => OutputType::Volume,
            ActuationKind::Value => OutputType::Value,
        }
    }
}

/// What to do with a channel when the output is initialised.
#[derive(
    EnumString, Display, Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    DoNothing,
    #[default]
    Off,
    On,
    /// Restore the last value written to the measurement store.
    LastKnown,
}

/// What to do with a channel when the output is stopped.
#[derive(
    EnumString, Display, Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    /// Leave the channel as it is. A dispense or timed on still running at
    /// shutdown is switched off regardless.
    DoNothing,
    #[default]
    Off,
    On,
}

/// How a volume is turned into an actuation schedule.
#[derive(
    EnumString, Display, Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    /// Run at 100 % until the volume is reached.
    #[default]
    FastestFlowRate,
    /// Cycle on and off to average out at `flow_rate`.
    SpecifyFlowRate,
}

/// Motor direction, derived from the sign of the amount.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn from_amount(amount: f64) -> Self {
        if amount < 0.0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

/// Per channel options, resolved from the output's config file. Missing
/// keys fall back to [`ChannelConfig::default`].
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Human readable name.
    pub name: String,
    /// Logic level that means "on". Active low relay boards set this false.
    pub on_state: bool,
    pub state_startup: StartupState,
    /// Duty cycle used by PWM channels when starting up `on`.
    pub startup_value: Option<f64>,
    pub state_shutdown: ShutdownState,
    /// Duty cycle used by PWM channels when shutting down `on`.
    pub shutdown_value: Option<f64>,
    pub flow_mode: FlowMode,
    /// Desired rate in `specify_flow_rate` mode (ml/min).
    pub flow_rate: f64,
    /// Calibrated rate at 100 % duty (ml/min).
    #[serde(alias = "dispense_rate_ml_min")]
    pub fastest_dispense_rate_ml_min: f64,
    /// Shortest on period the pump reliably delivers fluid in.
    pub minimum_sec_on_per_min: f64,
    /// Motor speed (percent) used when a motor channel is switched on.
    pub motor_speed: f64,
    /// Invert the PWM signal written to the device.
    pub pwm_invert_signal: bool,
    /// Send commands even when the cached state already matches.
    pub command_force: bool,
    /// Current draw of the connected load.
    pub amps: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            on_state: true,
            state_startup: StartupState::Off,
            startup_value: None,
            state_shutdown: ShutdownState::Off,
            shutdown_value: None,
            flow_mode: FlowMode::FastestFlowRate,
            flow_rate: 10.0,
            fastest_dispense_rate_ml_min: 150.0,
            minimum_sec_on_per_min: 1.0,
            motor_speed: 100.0,
            pwm_invert_signal: false,
            command_force: false,
            amps: 0.0,
        }
    }
}

impl ChannelConfig {
    /// Check option ranges for the channel at `index`.
    pub fn validate(&self, index: u8) -> Result<()> {
        let invalid = |what: &str| Err(OutputError::Config(format!("CH{index}: {what}")));
        if !(self.fastest_dispense_rate_ml_min > 0.0) {
            return invalid("fastest_dispense_rate_ml_min must be greater than 0");
        }
        if !(self.flow_rate > 0.0) {
            return invalid("flow_rate must be greater than 0");
        }
        if !(self.minimum_sec_on_per_min > 0.0 && self.minimum_sec_on_per_min <= 60.0) {
            return invalid("minimum_sec_on_per_min must be within (0, 60]");
        }
        if !(0.0..=100.0).contains(&self.motor_speed) {
            return invalid("motor_speed must be within [0, 100]");
        }
        for value in [self.startup_value, self.shutdown_value].into_iter().flatten() {
            if !(0.0..=100.0).contains(&value) {
                return invalid("startup/shutdown duty cycles must be within [0, 100]");
            }
        }
        if self.amps < 0.0 {
            return invalid("amps cannot be negative");
        }
        Ok(())
    }

    /// Label used in logs, falls back to the index.
    pub fn label(&self, index: u8) -> String {
        if self.name.is_empty() {
            format!("CH{index}")
        } else {
            format!("CH{index} ({})", self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case("sec", ActuationKind::Sec)]
    #[case("pwm", ActuationKind::Pwm)]
    #[case("vol", ActuationKind::Vol)]
    #[case("value", ActuationKind::Value)]
    fn test_parse_actuation_kind(#[case] raw: &str, #[case] expected: ActuationKind) {
        assert_eq!(ActuationKind::from_str(raw).unwrap(), expected);
    }

    #[test]
    fn test_output_type_names() {
        assert_eq!(OutputType::OnOff.to_string(), "on_off");
        assert_eq!(OutputType::from_str("vol").unwrap(), OutputType::Volume);
        assert!(OutputType::from_str("dimmer").is_err());
    }

    #[test]
    fn test_partial_channel_uses_defaults() {
        let parsed: ChannelConfig = serde_yaml::from_str(
            "name: nutrient A\nflow_mode: specify_flow_rate\ndispense_rate_ml_min: 60.0\n",
        )
        .unwrap();
        assert_eq!(parsed.name, "nutrient A");
        assert_eq!(parsed.flow_mode, FlowMode::SpecifyFlowRate);
        assert_eq!(parsed.fastest_dispense_rate_ml_min, 60.0);
        assert_eq!(parsed.minimum_sec_on_per_min, 1.0);
        assert_eq!(parsed.state_startup, StartupState::Off);
        assert!(parsed.on_state);
    }

    #[rstest]
    #[case(ChannelConfig { fastest_dispense_rate_ml_min: 0.0, ..Default::default() })]
    #[case(ChannelConfig { flow_rate: -2.0, ..Default::default() })]
    #[case(ChannelConfig { minimum_sec_on_per_min: 61.0, ..Default::default() })]
    #[case(ChannelConfig { minimum_sec_on_per_min: 0.0, ..Default::default() })]
    #[case(ChannelConfig { motor_speed: 120.0, ..Default::default() })]
    #[case(ChannelConfig { startup_value: Some(101.0), ..Default::default() })]
    #[case(ChannelConfig { fastest_dispense_rate_ml_min: f64::NAN, ..Default::default() })]
    fn test_invalid_channel_rejected(#[case] channel: ChannelConfig) {
        assert!(matches!(channel.validate(4), Err(OutputError::Config(_))));
    }

    #[test]
    fn test_direction_from_sign() {
        assert_eq!(Direction::from_amount(12.5), Direction::Forward);
        assert_eq!(Direction::from_amount(-0.5), Direction::Reverse);
        assert_eq!(Direction::from_amount(0.0), Direction::Forward);
    }
}
