use crate::{
    components::outputs::{channel::ChannelConfig, registry::OutputFamily},
    devices::hardware::lock::Resource,
    error::{OutputError, Result},
    utils::serialise::{hex_u8, ordered_u8_map, u8_keyed_map},
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{collections::HashMap, ffi::OsStr, fs::{self, File}, path::Path, time::Duration};
use uuid::Uuid;

/// Where the output lives.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interface {
    /// Device on a local I2C bus.
    I2c {
        bus: u8,
        #[serde(with = "hex_u8")]
        address: u8,
    },
    /// Device reached over TCP.
    Network { host: String, port: u16 },
}

impl Interface {
    /// Bus address of an I2C interface.
    pub fn i2c_address(&self) -> Result<u8> {
        match self {
            Interface::I2c { address, .. } => Ok(*address),
            Interface::Network { .. } => Err(OutputError::Config(String::from(
                "an I2C interface is needed",
            ))),
        }
    }

    /// Physical resource the output's lock is keyed by.
    pub fn resource(&self) -> Resource {
        match self {
            Interface::I2c { bus, address } => Resource::I2c {
                bus: *bus,
                address: *address,
            },
            Interface::Network { host, port } => Resource::Network {
                host: host.clone(),
                port: *port,
            },
        }
    }
}

/// Configuration of one output. It is only edited while the output is
/// deactivated, drivers treat it as immutable.
#[serde_as]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct OutputConfig {
    /// Unique id, also used to tag measurements.
    pub id: Uuid,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Driver family.
    pub family: OutputFamily,
    pub interface: Interface,
    /// Number of channels in use, at most the family maximum.
    pub channel_count: u8,
    /// Longest time to wait for the hardware lock.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: Duration,
    /// Period between reconciliation polls of network devices, zero disables.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_status_update_period")]
    pub status_update_period: Duration,
    /// Connection attempts made by `initialize()` before giving up.
    #[serde(default = "default_setup_retries")]
    pub setup_retries: u32,
    /// Pause between those attempts.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_setup_retry_delay")]
    pub setup_retry_delay: Duration,
    /// How long a caller waits for a network device to answer.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// PWM frequency for PWM driver boards.
    #[serde(default = "default_pwm_hertz")]
    pub pwm_hertz: u16,
    /// Channel options keyed by channel index.
    #[serde(
        default,
        serialize_with = "ordered_u8_map",
        deserialize_with = "u8_keyed_map"
    )]
    pub channels: HashMap<u8, ChannelConfig>,
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_status_update_period() -> Duration {
    Duration::from_secs(300)
}

fn default_setup_retries() -> u32 {
    3
}

fn default_setup_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pwm_hertz() -> u16 {
    1000
}

/// Rewrite the keys of the `channels` map as strings. The config crate's
/// yaml source drops integer map keys.
fn quote_channel_keys(raw: &str) -> Result<String> {
    let mut document: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|err| OutputError::Config(format!("invalid yaml: {err}")))?;
    if let Some(channels) = document
        .get_mut("channels")
        .and_then(serde_yaml::Value::as_mapping_mut)
    {
        for (key, value) in std::mem::take(channels) {
            let key = match key {
                serde_yaml::Value::Number(index) => serde_yaml::Value::String(index.to_string()),
                serde_yaml::Value::String(_) => key,
                other => {
                    return Err(OutputError::Config(format!(
                        "channel key {other:?} is not a channel index"
                    )))
                }
            };
            channels.insert(key, value);
        }
    }
    serde_yaml::to_string(&document)
        .map_err(|err| OutputError::Config(format!("invalid yaml: {err}")))
}

impl OutputConfig {
    /// Create a config with every channel at its defaults.
    ///
    /// * `family`: driver family.
    /// * `interface`: bus address or network host.
    /// * `channel_count`: channels in use.
    pub fn new(family: OutputFamily, interface: Interface, channel_count: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            family,
            interface,
            channel_count,
            lock_timeout: default_lock_timeout(),
            status_update_period: default_status_update_period(),
            setup_retries: default_setup_retries(),
            setup_retry_delay: default_setup_retry_delay(),
            command_timeout: default_command_timeout(),
            pwm_hertz: default_pwm_hertz(),
            channels: HashMap::new(),
        }
    }

    /// Set the options of one channel, builder style.
    pub fn with_channel(mut self, index: u8, channel: ChannelConfig) -> Self {
        self.channels.insert(index, channel);
        self
    }

    /// Read a config from a yaml file.
    ///
    /// * `filepath`: path to the config file.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(OutputError::Config(format!(
                "could not locate the config file {}",
                file.display()
            )));
        }
        let raw = fs::read_to_string(file)?;
        let config = config::Config::builder()
            .add_source(config::File::from_str(
                &quote_channel_keys(&raw)?,
                config::FileFormat::Yaml,
            ))
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as yaml, channels in ascending order.
    ///
    /// * `filepath`: file to create or overwrite.
    pub fn to_file<F: AsRef<Path>>(&self, filepath: F) -> Result<()> {
        let file = File::create(filepath)?;
        serde_yaml::to_writer(file, self)
            .map_err(|err| OutputError::Config(format!("could not write config: {err}")))
    }

    /// Check the config against what the family supports.
    pub fn validate(&self) -> Result<()> {
        let max = self.family.max_channels();
        if self.channel_count == 0 || self.channel_count > max {
            return Err(OutputError::Config(format!(
                "{} supports 1 to {max} channels, {} configured",
                self.family, self.channel_count
            )));
        }
        if let Some(index) = self.channels.keys().find(|index| **index >= self.channel_count) {
            return Err(OutputError::Config(format!(
                "options given for CH{index} but only {} channels are configured",
                self.channel_count
            )));
        }
        match (&self.interface, self.family.is_network()) {
            (Interface::I2c { .. }, false) | (Interface::Network { .. }, true) => {}
            _ => {
                return Err(OutputError::Config(format!(
                    "{} cannot use a {:?} interface",
                    self.family, self.interface
                )))
            }
        }
        if let Interface::Network { host, .. } = &self.interface {
            if host.is_empty() || host == "0.0.0.0" {
                return Err(OutputError::Config(String::from("host must be set")));
            }
        }
        for index in 0..self.channel_count {
            self.channel(index)?.validate(index)?;
        }
        Ok(())
    }

    /// Resolve the options of a channel, unspecified channels use defaults.
    pub fn channel(&self, index: u8) -> Result<ChannelConfig> {
        if index >= self.channel_count {
            return Err(OutputError::Config(format!(
                "channel {index} out of range, {} has {} channels",
                self.family, self.channel_count
            )));
        }
        Ok(self.channels.get(&index).cloned().unwrap_or_default())
    }

    /// Resolved options of every channel, in index order.
    pub fn resolved_channels(&self) -> Vec<ChannelConfig> {
        (0..self.channel_count)
            .map(|index| self.channels.get(&index).cloned().unwrap_or_default())
            .collect()
    }

    /// Label used in logs.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{} {}", self.family, self.id)
        } else {
            format!("{} ({})", self.name, self.family)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::outputs::channel::{FlowMode, StartupState};

    fn pump_board() -> OutputConfig {
        OutputConfig::new(
            OutputFamily::Pcf8574,
            Interface::I2c {
                bus: 1,
                address: 0x20,
            },
            8,
        )
        .with_channel(
            0,
            ChannelConfig {
                name: String::from("pH down"),
                on_state: false,
                flow_mode: FlowMode::SpecifyFlowRate,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_write_and_read_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pump_board.yaml");
        let write_config = pump_board();

        write_config.to_file(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("address: '0x20'") || written.contains("address: \"0x20\""));

        let read_config = OutputConfig::from_file(&path).unwrap();
        assert_eq!(write_config, read_config, "Failed to read written config");
    }

    #[test]
    fn test_read_shipped_config() {
        let config =
            OutputConfig::from_file(crate::fixture_path!("/config/outputs/dosing_pumps.yaml"))
                .unwrap();
        assert_eq!(config.family, OutputFamily::GroveMotorPump);
        assert_eq!(
            config.interface,
            Interface::I2c {
                bus: 1,
                address: 0x0f
            }
        );
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        let nutrient = config.channel(1).unwrap();
        assert_eq!(nutrient.flow_mode, FlowMode::SpecifyFlowRate);
        assert_eq!(nutrient.state_startup, StartupState::Off);
    }

    #[test]
    fn test_read_shipped_light_and_plug_configs() {
        let lights =
            OutputConfig::from_file(crate::fixture_path!("/config/outputs/grow_lights.yaml"))
                .unwrap();
        assert_eq!(lights.family, OutputFamily::Pca9685);
        assert_eq!(lights.pwm_hertz, 1000);
        assert!(lights.channel(1).unwrap().pwm_invert_signal);
        assert_eq!(lights.channel(0).unwrap().state_startup, StartupState::LastKnown);

        let plugs =
            OutputConfig::from_file(crate::fixture_path!("/config/outputs/air_pumps.yaml"))
                .unwrap();
        assert_eq!(
            plugs.interface,
            Interface::Network {
                host: String::from("192.168.1.64"),
                port: 9999
            }
        );
        assert_eq!(plugs.status_update_period, Duration::from_secs(300));
        assert_eq!(plugs.channel(0).unwrap().state_startup, StartupState::On);
        assert!(plugs.channel(2).unwrap().command_force);
    }

    #[test]
    fn test_integer_and_quoted_channel_keys_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.yaml");
        std::fs::write(
            &path,
            r#"
id: 0d6c6a4e-3f1b-4a8e-8f55-2b7c1e9d4a10
family: pcf8574
interface:
  type: i2c
  bus: 1
  address: "0x20"
channel_count: 4
channels:
  0:
    on_state: false
  "3":
    command_force: true
"#,
        )
        .unwrap();
        let config = OutputConfig::from_file(&path).unwrap();
        assert_eq!(config.channels.len(), 2);
        assert!(!config.channel(0).unwrap().on_state);
        assert!(config.channel(3).unwrap().command_force);
    }

    #[test]
    fn test_unreadable_channel_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.yaml");
        std::fs::write(
            &path,
            r#"
id: 0d6c6a4e-3f1b-4a8e-8f55-2b7c1e9d4a10
family: pcf8574
interface:
  type: i2c
  bus: 1
  address: "0x20"
channel_count: 4
channels:
  pump:
    on_state: false
"#,
        )
        .unwrap();
        assert!(OutputConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        assert!(matches!(
            OutputConfig::from_file("/nonexistent/output.yaml"),
            Err(OutputError::Config(_))
        ));
    }

    #[test]
    fn test_unspecified_channel_resolves_to_default() {
        let config = pump_board();
        assert_eq!(config.channel(5).unwrap(), ChannelConfig::default());
        assert!(!config.channel(0).unwrap().on_state);
        assert!(matches!(config.channel(8), Err(OutputError::Config(_))));
        assert_eq!(config.resolved_channels().len(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let mut too_many = pump_board();
        too_many.channel_count = 9;
        assert!(too_many.validate().is_err());

        let mut orphan = pump_board();
        orphan.channel_count = 2;
        orphan.channels.insert(4, ChannelConfig::default());
        assert!(orphan.validate().is_err());

        let mut wrong_interface = pump_board();
        wrong_interface.interface = Interface::Network {
            host: String::from("10.0.0.8"),
            port: 9999,
        };
        assert!(wrong_interface.validate().is_err());

        let unset_host = OutputConfig::new(
            OutputFamily::KasaPlug,
            Interface::Network {
                host: String::from("0.0.0.0"),
                port: 9999,
            },
            1,
        );
        assert!(unset_host.validate().is_err());

        assert!(pump_board().validate().is_ok());
    }
}
