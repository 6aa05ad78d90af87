use crate::{
    components::outputs::{
        channel::{ActuationKind, OutputType},
        config::{Interface, OutputConfig},
        contract::{Output, OutputModule},
        expander::PortExpander,
        motor_pump::MotorPump,
        pwm::Pca9685,
        smart_plug::SmartPlug,
        state::ChannelStates,
    },
    devices::hardware::{
        i2c::{linux_bus_factory, BusFactory, I2c},
        kasa::{KasaClient, KasaDevice, KasaModel},
        lock::{HardwareLock, ResourceLock},
    },
    error::{OutputError, Result},
    messages::measurement::MeasurementSink,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumIter, EnumString};

/// Driver families, keyed by the id used in config files.
#[derive(
    EnumString,
    EnumIter,
    Display,
    Deserialize,
    Serialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputFamily {
    /// 8 bit I2C port expander driving relays.
    Pcf8574,
    /// 16 bit I2C port expander driving relays.
    Pcf8575,
    /// 16 channel I2C PWM driver.
    Pca9685,
    /// Grove I2C motor driver with two peristaltic pumps.
    GroveMotorPump,
    /// Kasa smart plug with one outlet.
    KasaPlug,
    /// Kasa power strip.
    KasaStrip,
}

impl OutputFamily {
    pub fn max_channels(self) -> u8 {
        match self {
            OutputFamily::Pcf8574 => 8,
            OutputFamily::Pcf8575 | OutputFamily::Pca9685 => 16,
            OutputFamily::GroveMotorPump => 2,
            OutputFamily::KasaPlug => 1,
            OutputFamily::KasaStrip => 6,
        }
    }

    pub fn is_network(self) -> bool {
        matches!(self, OutputFamily::KasaPlug | OutputFamily::KasaStrip)
    }

    /// Actuation types channels of this family accept.
    pub fn declared_types(self) -> &'static [OutputType] {
        match self {
            OutputFamily::Pcf8574 | OutputFamily::Pcf8575 | OutputFamily::GroveMotorPump => {
                &[OutputType::OnOff, OutputType::Volume]
            }
            OutputFamily::Pca9685 => &[OutputType::Pwm],
            OutputFamily::KasaPlug | OutputFamily::KasaStrip => &[OutputType::OnOff],
        }
    }

    pub fn declares(self, output_type: OutputType) -> bool {
        self.declared_types().contains(&output_type)
    }

    /// Channels are driven by duty cycle only.
    pub fn is_pwm(self) -> bool {
        self.declares(OutputType::Pwm) && !self.declares(OutputType::OnOff)
    }

    /// Meaning of a switch without an explicit type.
    pub fn default_kind(self) -> ActuationKind {
        if self.is_pwm() {
            ActuationKind::Pwm
        } else {
            ActuationKind::Sec
        }
    }
}

/// Build the output described by `config`. I2C families open
/// `/dev/i2c-{bus}` when initialised.
///
/// * `config`: validated before anything is built.
/// * `lock`: lock manager shared by every output of the daemon.
/// * `sink`: where measurements are written.
pub fn build_output(
    config: &OutputConfig,
    lock: &HardwareLock,
    sink: Arc<dyn MeasurementSink>,
) -> Result<Box<dyn OutputModule>> {
    match &config.interface {
        Interface::I2c { bus, .. } => build_i2c_output(config, lock, sink, linux_bus_factory(*bus)),
        Interface::Network { host, port } => {
            config.validate()?;
            let states = Arc::new(ChannelStates::new(config.channel_count));
            let device = KasaDevice::new(
                KasaClient::new(host.clone(), *port, config.command_timeout),
                kasa_model(config.family),
                config.channel_count,
            );
            let actuator = SmartPlug::new(config, device, resource_lock(config, lock), states.clone());
            Ok(Box::new(Output::new(config, actuator, states, sink)))
        }
    }
}

/// A strip is addressed per outlet even when one outlet is configured.
fn kasa_model(family: OutputFamily) -> KasaModel {
    match family {
        OutputFamily::KasaStrip => KasaModel::Strip,
        _ => KasaModel::Plug,
    }
}

/// Build an I2C output on the bus handed out by `factory`.
pub fn build_i2c_output<B>(
    config: &OutputConfig,
    lock: &HardwareLock,
    sink: Arc<dyn MeasurementSink>,
    factory: BusFactory<B>,
) -> Result<Box<dyn OutputModule>>
where
    B: I2c + Send + 'static,
{
    config.validate()?;
    let states = Arc::new(ChannelStates::new(config.channel_count));
    let resource = resource_lock(config, lock);
    let output: Box<dyn OutputModule> = match config.family {
        OutputFamily::Pcf8574 | OutputFamily::Pcf8575 => Box::new(Output::new(
            config,
            PortExpander::new(config, resource, factory)?,
            states,
            sink,
        )),
        OutputFamily::Pca9685 => Box::new(Output::new(
            config,
            Pca9685::new(config, resource, factory)?,
            states,
            sink,
        )),
        OutputFamily::GroveMotorPump => Box::new(Output::new(
            config,
            MotorPump::new(config, resource, factory)?,
            states,
            sink,
        )),
        family @ (OutputFamily::KasaPlug | OutputFamily::KasaStrip) => {
            return Err(OutputError::Config(format!("{family} is not an I2C device")))
        }
    };
    Ok(output)
}

fn resource_lock(config: &OutputConfig, lock: &HardwareLock) -> ResourceLock {
    ResourceLock::new(lock, &config.interface.resource(), config.lock_timeout)
}
