use crate::{
    components::outputs::{
        config::OutputConfig,
        reconciler::{BackoffPolicy, LinkStatus, StateReconciler},
        state::ChannelStates,
    },
    devices::hardware::{lock::ResourceLock, network::NetworkActuator},
    error::{OutputError, Result},
};
use std::{
    future::pending,
    sync::{mpsc as reply_channel, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc,
    time::{self, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Reply<T> = reply_channel::Sender<Result<T>>;

enum Command {
    Connect(Reply<String>),
    Set { channel: u8, on: bool, reply: Reply<()> },
    Refresh(Reply<Vec<bool>>),
}

/// Timing of a bridge.
#[derive(Clone, Copy, Debug)]
pub struct BridgeOptions {
    /// Period of the reconciliation poll, zero disables it.
    pub status_update_period: Duration,
    /// How long a caller waits for an answer.
    pub command_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl BridgeOptions {
    pub fn from_config(config: &OutputConfig) -> Self {
        Self {
            status_update_period: config.status_update_period,
            command_timeout: config.command_timeout,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Synchronous facade over an async network device. The device lives on
/// a dedicated thread running its own single threaded runtime; callers
/// send it commands and block, bounded by the command timeout, for the
/// answer. The same thread polls the device for changes made outside the
/// daemon and reconnects after an outage.
pub struct AsyncBridge {
    output_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    status: Arc<LinkStatus>,
    states: Arc<ChannelStates>,
    command_timeout: Duration,
}

impl AsyncBridge {
    /// Start the bridge thread. Nothing is sent to the device until the
    /// first command.
    pub fn spawn<D: NetworkActuator>(
        output_id: Uuid,
        device: D,
        lock: ResourceLock,
        states: Arc<ChannelStates>,
        options: BridgeOptions,
    ) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let status = Arc::new(LinkStatus::default());
        let worker = Worker {
            output_id,
            device,
            lock,
            reconciler: StateReconciler::new(
                output_id,
                options.backoff,
                states.clone(),
                status.clone(),
            ),
            period: options.status_update_period,
            shutdown: shutdown.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("bridge-{}", output_id.simple()))
            .spawn(move || worker.run(receiver))?;
        Ok(Self {
            output_id,
            commands,
            shutdown,
            thread: Mutex::new(Some(thread)),
            status,
            states,
            command_timeout: options.command_timeout,
        })
    }

    fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let stopped = || OutputError::ConnectionLost(String::from("bridge stopped"));
        let (reply, answer) = reply_channel::channel();
        self.commands.send(command(reply)).map_err(|_| stopped())?;
        match answer.recv_timeout(self.command_timeout) {
            Ok(result) => result,
            Err(reply_channel::RecvTimeoutError::Timeout) => Err(OutputError::ConnectionLost(
                format!("no answer within {:?}", self.command_timeout),
            )),
            Err(reply_channel::RecvTimeoutError::Disconnected) => Err(stopped()),
        }
    }

    /// Connect now, ignoring any backoff in progress.
    pub fn connect(&self) -> Result<String> {
        self.call(Command::Connect)
    }

    /// Switch one outlet.
    pub fn request(&self, channel: u8, on: bool) -> Result<()> {
        self.call(|reply| Command::Set { channel, on, reply })
    }

    /// Query every outlet and update the cache.
    pub fn refresh(&self) -> Result<Vec<bool>> {
        self.call(Command::Refresh)
    }

    /// Last known state of an outlet, without a round trip.
    pub fn current_state(&self, channel: u8) -> Option<bool> {
        self.states.value(channel).map(|value| value.is_on())
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn ever_connected(&self) -> bool {
        self.status.ever_connected()
    }

    pub fn failures(&self) -> u32 {
        self.status.failures()
    }

    /// Stop the bridge thread and wait for it.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(output = %self.output_id, "bridge thread panicked");
            }
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Event {
    Shutdown,
    Command(Option<Command>),
    Poll,
    Retry,
}

struct Worker<D> {
    output_id: Uuid,
    device: D,
    lock: ResourceLock,
    reconciler: StateReconciler,
    period: Duration,
    shutdown: CancellationToken,
}

impl<D: NetworkActuator> Worker<D> {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(output = %self.output_id, "could not start bridge runtime: {err}");
                return;
            }
        };
        runtime.block_on(self.serve(&mut commands));
        debug!(output = %self.output_id, "bridge stopped");
    }

    async fn serve(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        let shutdown = self.shutdown.clone();
        let mut poll = (!self.period.is_zero()).then(|| {
            let mut interval = time::interval_at(time::Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        loop {
            let retry_at = self.reconciler.retry_at();
            let event = tokio::select! {
                _ = shutdown.cancelled() => Event::Shutdown,
                command = commands.recv() => Event::Command(command),
                _ = tick(&mut poll) => Event::Poll,
                _ = sleep_until(retry_at) => Event::Retry,
            };
            match event {
                Event::Shutdown | Event::Command(None) => break,
                Event::Command(Some(command)) => self.handle(command).await,
                Event::Poll => self.poll().await,
                Event::Retry => {
                    let _ = self.connect().await;
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        // A caller that timed out has dropped its receiver, the answer is
        // discarded.
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            Command::Set { channel, on, reply } => {
                let _ = reply.send(self.set(channel, on).await);
            }
            Command::Refresh(reply) => {
                let _ = reply.send(self.refresh().await);
            }
        }
    }

    async fn connect(&mut self) -> Result<String> {
        // Lock timeouts count as failures too.
        let result = match self.lock.hold() {
            Ok(_guard) => self.device.connect().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(description) => {
                self.reconciler.record_success();
                info!(output = %self.output_id, "connected to {description}");
                if let Err(err) = self.query().await {
                    warn!(output = %self.output_id, "state not read after connecting: {err}");
                }
                Ok(description)
            }
            Err(err) => {
                self.reconciler.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Connect first if needed. While backing off nothing is sent.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.reconciler.status().is_connected() {
            return Ok(());
        }
        if let Some(retry_at) = self.reconciler.retry_at() {
            let now = Instant::now();
            if now < retry_at {
                return Err(OutputError::ConnectionLost(format!(
                    "device offline, next attempt in {:.1} s",
                    (retry_at - now).as_secs_f64()
                )));
            }
        }
        self.connect().await.map(|_| ())
    }

    async fn set(&mut self, channel: u8, on: bool) -> Result<()> {
        self.ensure_connected().await?;
        let result = {
            let _guard = self.lock.hold()?;
            self.device.set_state(channel, on).await
        };
        if let Err(err) = &result {
            if err.is_connection_lost() {
                self.reconciler.record_failure(err);
            }
        }
        result
    }

    async fn refresh(&mut self) -> Result<Vec<bool>> {
        self.ensure_connected().await?;
        self.query().await
    }

    async fn query(&mut self) -> Result<Vec<bool>> {
        let result = {
            let _guard = self.lock.hold()?;
            self.device.query_states().await
        };
        match &result {
            Ok(reported) => self.reconciler.apply(reported),
            Err(err) if err.is_connection_lost() => {
                self.reconciler.record_failure(err);
            }
            Err(_) => {}
        }
        result
    }

    /// Periodic reconciliation. A disconnected device is left to the
    /// retry timer.
    async fn poll(&mut self) {
        if !self.reconciler.status().is_connected() {
            return;
        }
        if let Err(err) = self.query().await {
            if !err.is_connection_lost() {
                warn!(output = %self.output_id, "status poll failed: {err}");
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::hardware::{
        kasa::{fake::FakePlug, KasaClient, KasaDevice},
        lock::{HardwareLock, Resource},
    };
    use serial_test::serial;

    struct Rig {
        bridge: AsyncBridge,
        plug: FakePlug,
        _dir: tempfile::TempDir,
    }

    fn rig(outlets: u8, period: Duration, backoff: BackoffPolicy) -> Rig {
        let plug = FakePlug::spawn(usize::from(outlets));
        let dir = tempfile::tempdir().unwrap();
        let lock = ResourceLock::new(
            &HardwareLock::new(dir.path()),
            &Resource::Network {
                host: String::from("127.0.0.1"),
                port: plug.port,
            },
            Duration::from_secs(1),
        );
        let client = KasaClient::new("127.0.0.1", plug.port, Duration::from_millis(500));
        let bridge = AsyncBridge::spawn(
            Uuid::new_v4(),
            KasaDevice::new(client, plug.model(), outlets),
            lock,
            Arc::new(ChannelStates::new(outlets)),
            BridgeOptions {
                status_update_period: period,
                command_timeout: Duration::from_secs(2),
                backoff,
            },
        )
        .unwrap();
        Rig {
            bridge,
            plug,
            _dir: dir,
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            short: Duration::from_millis(50),
            medium: Duration::from_millis(300),
            long: Duration::from_secs(30),
        }
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(3) {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    #[serial]
    fn test_request_reaches_device() {
        let rig = rig(3, Duration::ZERO, fast_backoff());
        assert_eq!(rig.bridge.connect().unwrap(), "fake strip (HS300(US))");
        assert_eq!(rig.bridge.current_state(1), Some(false));
        rig.bridge.request(1, true).unwrap();
        assert_eq!(rig.plug.states(), vec![false, true, false]);
        assert!(rig.bridge.ever_connected());
    }

    #[test]
    #[serial]
    fn test_first_request_connects() {
        let rig = rig(1, Duration::ZERO, fast_backoff());
        rig.bridge.request(0, true).unwrap();
        assert!(rig.bridge.is_connected());
        assert_eq!(rig.plug.states(), vec![true]);
    }

    #[test]
    #[serial]
    fn test_poll_detects_external_change() {
        let rig = rig(2, Duration::from_millis(50), fast_backoff());
        rig.bridge.connect().unwrap();
        rig.plug.set_external(0, true);
        assert!(wait_for(|| rig.bridge.current_state(0) == Some(true)));
        assert_eq!(rig.bridge.current_state(1), Some(false));
    }

    #[test]
    #[serial]
    fn test_backoff_answers_without_network_traffic() {
        let backoff = BackoffPolicy {
            short: Duration::from_secs(5),
            ..fast_backoff()
        };
        let rig = rig(1, Duration::ZERO, backoff);
        rig.plug.set_offline(true);
        let err = rig.bridge.connect().unwrap_err();
        assert!(err.is_connection_lost(), "{err}");
        let requests = rig.plug.requests();

        let started = Instant::now();
        let err = rig.bridge.request(0, true).unwrap_err();
        assert!(err.is_connection_lost(), "{err}");
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(rig.plug.requests(), requests);
    }

    #[test]
    #[serial]
    fn test_reconnects_after_outage() {
        let rig = rig(2, Duration::ZERO, fast_backoff());
        rig.plug.set_offline(true);
        assert!(rig.bridge.connect().is_err());
        assert!(!rig.bridge.ever_connected());
        rig.plug.set_external(1, true);
        rig.plug.set_offline(false);

        assert!(wait_for(|| rig.bridge.is_connected()));
        assert_eq!(rig.bridge.failures(), 0);
        // State is read on reconnect.
        assert_eq!(rig.bridge.current_state(1), Some(true));
    }

    #[test]
    #[serial]
    fn test_backoff_escalates_after_five_failures() {
        let backoff = BackoffPolicy {
            short: Duration::from_millis(10),
            medium: Duration::from_millis(400),
            long: Duration::from_secs(30),
        };
        let rig = rig(1, Duration::ZERO, backoff);
        rig.plug.set_offline(true);
        assert!(rig.bridge.connect().is_err());
        assert!(wait_for(|| rig.bridge.failures() >= 5));
        let requests = rig.plug.requests();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(rig.bridge.failures(), 5);
        assert_eq!(rig.plug.requests(), requests);
    }

    #[test]
    #[serial]
    fn test_shutdown_during_backoff_is_prompt() {
        let backoff = BackoffPolicy {
            short: Duration::from_secs(30),
            ..fast_backoff()
        };
        let rig = rig(1, Duration::from_secs(30), backoff);
        rig.plug.set_offline(true);
        assert!(rig.bridge.connect().is_err());
        let started = Instant::now();
        rig.bridge.shutdown();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(rig.bridge.request(0, true).is_err());
    }
}
