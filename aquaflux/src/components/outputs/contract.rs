use crate::{
    components::outputs::{
        channel::{ActuationKind, ChannelConfig, Direction, ShutdownState, StartupState, SwitchState},
        config::OutputConfig,
        dispatcher::ActuationDispatcher,
        registry::OutputFamily,
        state::{ChannelStates, ChannelValue},
    },
    error::{OutputError, Result},
    messages::measurement::{MeasurementSink, DUTY_CYCLE},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Public contract of every output, whatever the driver family.
///
/// Errors never cross this boundary from `output_switch`: a misbehaving
/// actuator is reported in the returned status string and the log.
pub trait OutputModule: Send + Sync {
    fn id(&self) -> Uuid;

    fn family(&self) -> OutputFamily;

    /// Open the hardware handle and apply each channel's startup state.
    /// Calling it again once set up does nothing.
    fn initialize(&self) -> Result<()>;

    /// Fallible form of [`OutputModule::output_switch`].
    fn switch(
        &self,
        state: SwitchState,
        output_type: Option<ActuationKind>,
        amount: Option<f64>,
        output_channel: Option<u8>,
    ) -> Result<String>;

    /// Switch a channel and describe the outcome.
    ///
    /// * `state`: on or off.
    /// * `output_type`: what `amount` means, the family default when `None`.
    /// * `amount`: seconds, duty cycle or volume.
    /// * `output_channel`: the channel, required.
    fn output_switch(
        &self,
        state: SwitchState,
        output_type: Option<ActuationKind>,
        amount: Option<f64>,
        output_channel: Option<u8>,
    ) -> String {
        match self.switch(state, output_type, amount, output_channel) {
            Ok(message) => message,
            Err(err) => {
                error!(output = %self.id(), channel = ?output_channel, "{err}");
                err.to_string()
            }
        }
    }

    /// Cached on/off state, `None` until the channel has been resolved.
    fn is_on(&self, output_channel: u8) -> Option<bool>;

    /// Cached value of the channel.
    fn channel_value(&self, output_channel: u8) -> Option<ChannelValue>;

    fn is_setup(&self) -> bool;

    /// Read the true state back from the device, for drivers that can.
    fn resync(&self) -> Result<()>;

    /// Apply each channel's shutdown state and stop every background
    /// thread of the output.
    fn stop_output(&self);
}

/// The hardware side of an output. One implementation per driver family,
/// every method is a single locked transaction.
pub trait Actuator: Send + Sync + 'static {
    /// Open the bus handle or network connection.
    fn open(&self) -> Result<()>;

    fn switch(&self, channel: u8, on: bool, direction: Direction) -> Result<()>;

    /// Switch on at 100 % drive, ignoring any configured speed. Used by
    /// fastest rate dispenses.
    fn switch_full_speed(&self, channel: u8, direction: Direction) -> Result<()> {
        self.switch(channel, true, direction)
    }

    /// Set a duty cycle in percent.
    fn duty(&self, channel: u8, _percent: f64) -> Result<()> {
        Err(OutputError::command(channel, "duty cycle not supported"))
    }

    /// Read every channel back, `None` if the device cannot be read.
    fn resync(&self) -> Result<Option<Vec<bool>>> {
        Ok(None)
    }

    /// Whether commands matching the cached state can be skipped.
    fn skips_redundant(&self) -> bool {
        false
    }

    /// Whether a device that failed to open has since come up on its own.
    fn came_online(&self) -> bool {
        false
    }

    /// Stop any background work. Called last by `stop_output`.
    fn close(&self) {}
}

/// An output built from a config and a family's actuator.
pub struct Output<A: Actuator> {
    id: Uuid,
    label: String,
    family: OutputFamily,
    channels: Vec<ChannelConfig>,
    actuator: Arc<A>,
    states: Arc<ChannelStates>,
    dispatcher: ActuationDispatcher<A>,
    sink: Arc<dyn MeasurementSink>,
    setup: AtomicBool,
    setup_lock: Mutex<()>,
}

impl<A: Actuator> Output<A> {
    pub fn new(
        config: &OutputConfig,
        actuator: A,
        states: Arc<ChannelStates>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        let actuator = Arc::new(actuator);
        Self {
            id: config.id,
            label: config.label(),
            family: config.family,
            channels: config.resolved_channels(),
            dispatcher: ActuationDispatcher::new(
                config,
                actuator.clone(),
                states.clone(),
                sink.clone(),
            ),
            actuator,
            states,
            sink,
            setup: AtomicBool::new(false),
            setup_lock: Mutex::new(()),
        }
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    fn apply_startup(&self) -> Result<()> {
        for (index, channel) in self.channels.iter().enumerate() {
            let index = index as u8;
            let result = match (self.family.is_pwm(), channel.state_startup) {
                (_, StartupState::DoNothing) => Ok(()),
                (true, StartupState::Off) => self.dispatcher.force_duty(index, 0.0),
                (true, StartupState::On) => self
                    .dispatcher
                    .force_duty(index, channel.startup_value.unwrap_or(100.0)),
                (true, StartupState::LastKnown) => {
                    let duty = match self.sink.last_value(self.id, index, DUTY_CYCLE) {
                        Some(duty) => duty,
                        None => {
                            warn!(
                                output = %self.id,
                                channel = index,
                                "no last known duty cycle, using the startup value"
                            );
                            channel.startup_value.unwrap_or(0.0)
                        }
                    };
                    self.dispatcher.force_duty(index, duty)
                }
                (false, StartupState::On) => self.dispatcher.force_switch(index, true),
                (false, StartupState::Off | StartupState::LastKnown) => {
                    self.dispatcher.force_switch(index, false)
                }
            };
            result.map_err(|err| {
                OutputError::Setup(format!("{} startup: {err}", channel.label(index)))
            })?;
        }
        Ok(())
    }

    fn apply_shutdown(&self) {
        for (index, channel) in self.channels.iter().enumerate() {
            let index = index as u8;
            let result = match (self.family.is_pwm(), channel.state_shutdown) {
                (_, ShutdownState::DoNothing) => Ok(()),
                (true, ShutdownState::Off) => self.dispatcher.force_duty(index, 0.0),
                (true, ShutdownState::On) => self
                    .dispatcher
                    .force_duty(index, channel.shutdown_value.unwrap_or(100.0)),
                (false, ShutdownState::Off) => self.dispatcher.force_switch(index, false),
                (false, ShutdownState::On) => self.dispatcher.force_switch(index, true),
            };
            if let Err(err) = result {
                error!(output = %self.id, channel = index, "shutdown state not applied: {err}");
            }
        }
    }

    /// Short circuit calls on an output that never came up. A network
    /// device that connects after `initialize` gave up is set up here.
    fn ensure_setup(&self) -> Result<()> {
        if self.setup.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.actuator.came_online() {
            return Err(OutputError::NotSetup);
        }
        let _guard = self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.setup.load(Ordering::Acquire) {
            self.apply_startup()?;
            self.setup.store(true, Ordering::Release);
            info!(output = %self.id, "{} came online", self.label);
        }
        Ok(())
    }
}

impl<A: Actuator> OutputModule for Output<A> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn family(&self) -> OutputFamily {
        self.family
    }

    fn initialize(&self) -> Result<()> {
        let _guard = self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.setup.load(Ordering::Acquire) {
            debug!(output = %self.id, "already set up");
            return Ok(());
        }
        match self.actuator.open().and_then(|()| self.apply_startup()) {
            Ok(()) => {
                self.setup.store(true, Ordering::Release);
                info!(output = %self.id, "{} set up", self.label);
                Ok(())
            }
            Err(err) => {
                error!(output = %self.id, "could not set up {}: {err}", self.label);
                Err(err)
            }
        }
    }

    fn switch(
        &self,
        state: SwitchState,
        output_type: Option<ActuationKind>,
        amount: Option<f64>,
        output_channel: Option<u8>,
    ) -> Result<String> {
        let channel = output_channel.ok_or_else(|| {
            OutputError::Config(String::from("output channel needs to be specified"))
        })?;
        if usize::from(channel) >= self.channels.len() {
            return Err(OutputError::Config(format!(
                "channel {channel} out of range, {} has {} channels",
                self.label,
                self.channels.len()
            )));
        }
        self.ensure_setup()?;
        debug!(
            output = %self.id,
            channel,
            %state,
            output_type = ?output_type,
            amount = ?amount,
            "switch"
        );
        self.dispatcher.switch(channel, state, output_type, amount)
    }

    fn is_on(&self, output_channel: u8) -> Option<bool> {
        self.channel_value(output_channel).map(|value| value.is_on())
    }

    fn channel_value(&self, output_channel: u8) -> Option<ChannelValue> {
        if !self.is_setup() {
            return None;
        }
        self.states.value(output_channel)
    }

    fn is_setup(&self) -> bool {
        self.setup.load(Ordering::Acquire) || self.actuator.came_online()
    }

    fn resync(&self) -> Result<()> {
        self.ensure_setup()?;
        if let Some(reported) = self.actuator.resync()? {
            let changed = self.states.apply_reported(&reported, chrono::Utc::now());
            if !changed.is_empty() {
                warn!(output = %self.id, ?changed, "cached state diverged from the device");
            }
        }
        Ok(())
    }

    fn stop_output(&self) {
        let _guard = self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.dispatcher.stop_all();
        if self.setup.swap(false, Ordering::AcqRel) {
            self.apply_shutdown();
        }
        self.actuator.close();
        info!(output = %self.id, "{} stopped", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::outputs::{
            config::Interface,
            dispatcher::testing::{RecordingActuator, Write},
        },
        messages::measurement::{Measurement, MemorySink},
    };
    use std::sync::atomic::Ordering;

    fn relay_board(startup: StartupState) -> OutputConfig {
        let mut config = OutputConfig::new(
            OutputFamily::Pcf8574,
            Interface::I2c {
                bus: 1,
                address: 0x20,
            },
            3,
        );
        for index in 0..3 {
            config.channels.insert(
                index,
                ChannelConfig {
                    state_startup: startup,
                    state_shutdown: ShutdownState::Off,
                    ..Default::default()
                },
            );
        }
        config
    }

    fn output(config: &OutputConfig, sink: Arc<MemorySink>) -> Output<RecordingActuator> {
        let states = Arc::new(ChannelStates::new(config.channel_count));
        Output::new(config, RecordingActuator::default(), states, sink)
    }

    #[test]
    fn test_not_setup_short_circuits() {
        let config = relay_board(StartupState::Off);
        let output = output(&config, Arc::new(MemorySink::new()));
        assert!(!output.is_setup());
        assert_eq!(
            output.output_switch(SwitchState::On, None, None, Some(0)),
            "Error 101: device not set up"
        );
        assert!(output.actuator().writes().is_empty());
        assert_eq!(output.is_on(0), None);
    }

    #[test]
    fn test_initialize_applies_startup_once() {
        let config = relay_board(StartupState::Off);
        let output = output(&config, Arc::new(MemorySink::new()));
        output.initialize().unwrap();
        output.initialize().unwrap();
        assert!(output.is_setup());
        assert_eq!(output.actuator().writes().len(), 3);
        assert_eq!(output.is_on(2), Some(false));
    }

    #[test]
    fn test_do_nothing_leaves_channel_unresolved() {
        let config = relay_board(StartupState::DoNothing);
        let output = output(&config, Arc::new(MemorySink::new()));
        output.initialize().unwrap();
        assert!(output.actuator().writes().is_empty());
        assert_eq!(output.is_on(1), None);
    }

    #[test]
    fn test_failed_open_stays_not_setup() {
        let config = relay_board(StartupState::Off);
        let output = output(&config, Arc::new(MemorySink::new()));
        output.actuator().failing.store(true, Ordering::SeqCst);
        assert!(output.initialize().is_err());
        output.actuator().failing.store(false, Ordering::SeqCst);
        assert!(!output.is_setup());
        assert_eq!(
            output.output_switch(SwitchState::Off, None, None, Some(0)),
            OutputError::NotSetup.to_string()
        );
    }

    #[test]
    fn test_channel_argument_is_checked() {
        let config = relay_board(StartupState::Off);
        let output = output(&config, Arc::new(MemorySink::new()));
        output.initialize().unwrap();
        assert!(matches!(
            output.switch(SwitchState::On, None, None, None),
            Err(OutputError::Config(_))
        ));
        assert!(output
            .output_switch(SwitchState::On, None, None, Some(3))
            .contains("out of range"));
    }

    #[test]
    fn test_off_twice_stays_off() {
        let config = relay_board(StartupState::On);
        let output = output(&config, Arc::new(MemorySink::new()));
        output.initialize().unwrap();
        assert_eq!(output.is_on(0), Some(true));
        output.output_switch(SwitchState::Off, None, None, Some(0));
        output.output_switch(SwitchState::Off, None, None, Some(0));
        assert_eq!(output.is_on(0), Some(false));
    }

    #[test]
    fn test_stop_output_applies_shutdown() {
        let config = relay_board(StartupState::On);
        let output = output(&config, Arc::new(MemorySink::new()));
        output.initialize().unwrap();
        output.stop_output();
        let writes = output.actuator().writes();
        assert_eq!(writes.len(), 6);
        assert!(writes[3..]
            .iter()
            .all(|write| matches!(write, Write::Switch { on: false, .. })));
        assert!(!output.is_setup());
    }

    #[test]
    fn test_stop_output_ends_timed_on_when_shutdown_does_nothing() {
        let mut config = relay_board(StartupState::Off);
        for channel in config.channels.values_mut() {
            channel.state_shutdown = ShutdownState::DoNothing;
        }
        let output = output(&config, Arc::new(MemorySink::new()));
        output.initialize().unwrap();
        output.output_switch(SwitchState::On, Some(ActuationKind::Sec), Some(30.0), Some(1));
        output.output_switch(SwitchState::On, None, None, Some(2));
        output.stop_output();

        assert_eq!(output.actuator().switch_writes(1), vec![false, true, false]);
        // A plain on is left alone.
        assert_eq!(output.actuator().switch_writes(2), vec![false, true]);
    }

    #[test]
    fn test_pwm_last_known_startup() {
        let mut config = OutputConfig::new(
            OutputFamily::Pca9685,
            Interface::I2c {
                bus: 1,
                address: 0x40,
            },
            2,
        );
        for index in 0..2 {
            config.channels.insert(
                index,
                ChannelConfig {
                    state_startup: StartupState::LastKnown,
                    startup_value: Some(10.0),
                    ..Default::default()
                },
            );
        }
        let sink = Arc::new(MemorySink::new());
        sink.record(config.id, 0, vec![Measurement::duty_cycle(42.0)]);
        let output = output(&config, sink);
        output.initialize().unwrap();
        assert_eq!(
            output.actuator().writes(),
            vec![
                Write::Duty {
                    channel: 0,
                    percent: 42.0
                },
                Write::Duty {
                    channel: 1,
                    percent: 10.0
                },
            ]
        );
        assert_eq!(output.channel_value(0), Some(ChannelValue::Duty(42.0)));
        assert_eq!(output.is_on(1), Some(true));
    }
}
