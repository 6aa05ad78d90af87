use crate::{
    components::outputs::{
        bridge::{AsyncBridge, BridgeOptions},
        channel::Direction,
        config::OutputConfig,
        contract::Actuator,
        reconciler::BackoffPolicy,
        state::ChannelStates,
    },
    devices::hardware::{lock::ResourceLock, network::NetworkActuator},
    error::{OutputError, Result},
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};
use tracing::warn;
use uuid::Uuid;

/// Smart plug or power strip on the network. Commands go through an
/// [`AsyncBridge`], which is started on the first `open` and keeps
/// reconnecting in the background after a failed setup.
pub struct SmartPlug<D> {
    output_id: Uuid,
    label: String,
    device: Mutex<Option<D>>,
    lock: ResourceLock,
    states: Arc<ChannelStates>,
    options: BridgeOptions,
    setup_retries: u32,
    setup_retry_delay: Duration,
    bridge: Mutex<Option<Arc<AsyncBridge>>>,
}

impl<D: NetworkActuator> SmartPlug<D> {
    /// * `states`: the cache the output reads from, the bridge keeps it
    ///   in line with the device.
    pub fn new(
        config: &OutputConfig,
        device: D,
        lock: ResourceLock,
        states: Arc<ChannelStates>,
    ) -> Self {
        Self {
            output_id: config.id,
            label: config.label(),
            device: Mutex::new(Some(device)),
            lock,
            states,
            options: BridgeOptions::from_config(config),
            setup_retries: config.setup_retries.max(1),
            setup_retry_delay: config.setup_retry_delay,
            bridge: Mutex::new(None),
        }
    }

    /// Replace the reconnect delays.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.options.backoff = backoff;
        self
    }

    fn bridge(&self) -> Result<Arc<AsyncBridge>> {
        self.bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(OutputError::NotSetup)
    }

    fn start_bridge(&self) -> Result<Arc<AsyncBridge>> {
        let mut bridge = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bridge) = bridge.as_ref() {
            return Ok(bridge.clone());
        }
        let device = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| OutputError::Setup(format!("{} has been stopped", self.label)))?;
        let started = Arc::new(AsyncBridge::spawn(
            self.output_id,
            device,
            self.lock.clone(),
            self.states.clone(),
            self.options,
        )?);
        *bridge = Some(started.clone());
        Ok(started)
    }
}

impl<D: NetworkActuator> Actuator for SmartPlug<D> {
    fn open(&self) -> Result<()> {
        let bridge = self.start_bridge()?;
        let mut last_error = None;
        for attempt in 1..=self.setup_retries {
            match bridge.connect() {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(
                        output = %self.output_id,
                        attempt,
                        retries = self.setup_retries,
                        "could not reach {}: {err}",
                        self.label
                    );
                    last_error = Some(err);
                }
            }
            if attempt < self.setup_retries {
                thread::sleep(self.setup_retry_delay);
            }
        }
        Err(OutputError::Setup(match last_error {
            Some(err) => format!("{} unreachable: {err}", self.label),
            None => format!("{} unreachable", self.label),
        }))
    }

    fn switch(&self, channel: u8, on: bool, _direction: Direction) -> Result<()> {
        self.bridge()?.request(channel, on)
    }

    fn resync(&self) -> Result<Option<Vec<bool>>> {
        self.bridge()?.refresh().map(Some)
    }

    fn skips_redundant(&self) -> bool {
        true
    }

    fn came_online(&self) -> bool {
        self.bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|bridge| bridge.ever_connected())
    }

    fn close(&self) {
        let bridge = self.bridge.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(bridge) = bridge {
            bridge.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::outputs::{
            channel::{ChannelConfig, ShutdownState, StartupState, SwitchState},
            config::Interface,
            contract::{Output, OutputModule},
            registry::OutputFamily,
        },
        devices::hardware::{
            kasa::{fake::FakePlug, KasaClient, KasaDevice},
            lock::HardwareLock,
        },
        messages::measurement::{MeasurementSink, MemorySink, DURATION_TIME},
    };
    use serial_test::serial;
    use std::time::Instant;

    struct Rig {
        output: Output<SmartPlug<KasaDevice>>,
        plug: FakePlug,
        sink: Arc<MemorySink>,
        _dir: tempfile::TempDir,
    }

    fn rig(outlets: u8) -> Rig {
        let plug = FakePlug::spawn(usize::from(outlets));
        let family = if outlets == 1 {
            OutputFamily::KasaPlug
        } else {
            OutputFamily::KasaStrip
        };
        let mut config = OutputConfig::new(
            family,
            Interface::Network {
                host: String::from("127.0.0.1"),
                port: plug.port,
            },
            outlets,
        );
        config.status_update_period = Duration::ZERO;
        config.setup_retries = 2;
        config.setup_retry_delay = Duration::from_millis(10);
        config.command_timeout = Duration::from_secs(2);
        for index in 0..outlets {
            config.channels.insert(
                index,
                ChannelConfig {
                    state_startup: StartupState::Off,
                    state_shutdown: ShutdownState::Off,
                    ..Default::default()
                },
            );
        }
        let dir = tempfile::tempdir().unwrap();
        let lock = ResourceLock::new(
            &HardwareLock::new(dir.path()),
            &config.interface.resource(),
            Duration::from_secs(1),
        );
        let states = Arc::new(ChannelStates::new(outlets));
        let device = KasaDevice::new(
            KasaClient::new("127.0.0.1", plug.port, Duration::from_millis(500)),
            plug.model(),
            outlets,
        );
        let plug_actuator = SmartPlug::new(&config, device, lock, states.clone()).with_backoff(
            BackoffPolicy {
                short: Duration::from_millis(50),
                medium: Duration::from_millis(100),
                long: Duration::from_secs(1),
            },
        );
        let sink = Arc::new(MemorySink::new());
        let output = Output::new(&config, plug_actuator, states, sink.clone());
        Rig {
            output,
            plug,
            sink,
            _dir: dir,
        }
    }

    #[test]
    #[serial]
    fn test_initialize_applies_startup_on_strip() {
        let rig = rig(3);
        rig.plug.set_external(1, true);
        rig.output.initialize().unwrap();
        assert!(rig.output.is_setup());
        assert_eq!(rig.plug.states(), vec![false, false, false]);
        assert_eq!(rig.output.is_on(1), Some(false));
    }

    #[test]
    #[serial]
    fn test_switch_and_skip_redundant_command() {
        let rig = rig(2);
        rig.output.initialize().unwrap();
        rig.output.output_switch(SwitchState::On, None, None, Some(1));
        assert_eq!(rig.plug.states(), vec![false, true]);
        assert_eq!(rig.output.is_on(1), Some(true));

        let requests = rig.plug.requests();
        rig.output.output_switch(SwitchState::On, None, None, Some(1));
        assert_eq!(rig.plug.requests(), requests);

        rig.output.output_switch(SwitchState::Off, None, None, Some(1));
        assert_eq!(rig.plug.states(), vec![false, false]);
        assert!(rig.sink.last_value(rig.output.id(), 1, DURATION_TIME).is_some());
    }

    #[test]
    #[serial]
    fn test_resync_picks_up_external_change() {
        let rig = rig(2);
        rig.output.initialize().unwrap();
        rig.plug.set_external(0, true);
        assert_eq!(rig.output.is_on(0), Some(false));
        rig.output.resync().unwrap();
        assert_eq!(rig.output.is_on(0), Some(true));
    }

    #[test]
    #[serial]
    fn test_unreachable_plug_comes_online_later() {
        let rig = rig(1);
        rig.plug.set_offline(true);
        assert!(matches!(rig.output.initialize(), Err(OutputError::Setup(_))));
        assert!(!rig.output.is_setup());
        assert_eq!(
            rig.output.output_switch(SwitchState::On, None, None, Some(0)),
            "Error 101: device not set up"
        );

        rig.plug.set_external(0, true);
        rig.plug.set_offline(false);
        let started = Instant::now();
        while !rig.output.is_setup() && started.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(rig.output.is_setup());

        // The startup state is applied before the first command goes out.
        rig.output.output_switch(SwitchState::Off, None, None, Some(0));
        assert_eq!(rig.plug.states(), vec![false]);
        assert_eq!(rig.output.is_on(0), Some(false));
    }

    #[test]
    #[serial]
    fn test_stop_output_switches_off_and_closes() {
        let rig = rig(2);
        rig.output.initialize().unwrap();
        rig.output.output_switch(SwitchState::On, None, None, Some(0));
        rig.output.stop_output();
        assert_eq!(rig.plug.states(), vec![false, false]);
        assert!(!rig.output.is_setup());
        assert!(matches!(
            rig.output.actuator().switch(0, true, Direction::Forward),
            Err(OutputError::NotSetup)
        ));
        assert!(matches!(
            rig.output.initialize(),
            Err(OutputError::Setup(_))
        ));
    }
}
