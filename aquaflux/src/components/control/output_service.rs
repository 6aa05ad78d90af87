use crate::{
    components::outputs::{config::OutputConfig, contract::OutputModule, registry::build_output},
    devices::hardware::lock::{HardwareLock, DEFAULT_LOCK_DIR},
    error::{OutputError, Result},
    messages::{
        control::switch::{ControlMessage, ControlReply, SwitchMessage},
        measurement::{JsonLinesSink, LogSink, MeasurementSink},
    },
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::{
    collections::HashMap,
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest control message accepted on the wire.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Configuration of the output daemon.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct OutputServiceConfig {
    /// Local port control messages are received on.
    pub port: u16,
    /// Directory the hardware lock files are created in.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// JSON lines file measurements are appended to, the log when unset.
    #[serde(default)]
    pub measurement_log: Option<PathBuf>,
    /// One output config file per output.
    #[serde(default)]
    pub output_config_files: Vec<PathBuf>,
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_DIR)
}

impl OutputServiceConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            lock_dir: default_lock_dir(),
            measurement_log: None,
            output_config_files: Vec::new(),
        }
    }

    /// Add an output to the daemon, the file is read when the service is
    /// created.
    ///
    /// * `filepath`: path to the output's config file.
    pub fn add_output_config_file<F>(mut self, filepath: F) -> Self
    where
        F: AsRef<OsStr>,
    {
        self.output_config_files.push((&filepath).into());
        self
    }

    /// Read the daemon config from a yaml file. `AQUAFLUX_*` environment
    /// variables override the file, e.g. `AQUAFLUX_PORT=7001`.
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
        Ok(config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .add_source(config::Environment::with_prefix("AQUAFLUX").try_parsing(true))
            .build()?
            .try_deserialize::<Self>()?)
    }
}

/// Every output the daemon drives, keyed by output id.
pub struct OutputService {
    port: u16,
    outputs: HashMap<Uuid, Arc<dyn OutputModule>>,
}

assert_impl_all!(OutputService: Send, Sync);

impl OutputService {
    /// Build every configured output. Nothing is opened until
    /// [`OutputService::initialize_all`].
    pub fn new(config: OutputServiceConfig) -> Result<Self> {
        let lock = HardwareLock::new(&config.lock_dir);
        let sink: Arc<dyn MeasurementSink> = match &config.measurement_log {
            Some(path) => Arc::new(JsonLinesSink::open(path)?),
            None => Arc::new(LogSink),
        };
        let mut outputs = Vec::new();
        for filepath in &config.output_config_files {
            let output_config = OutputConfig::from_file(filepath)?;
            outputs.push(build_output(&output_config, &lock, sink.clone())?);
        }
        Self::with_outputs(config.port, outputs)
    }

    /// Create the service from outputs built elsewhere.
    pub fn with_outputs(port: u16, outputs: Vec<Box<dyn OutputModule>>) -> Result<Self> {
        let mut by_id: HashMap<Uuid, Arc<dyn OutputModule>> = HashMap::new();
        for output in outputs {
            let id = output.id();
            if by_id.insert(id, Arc::from(output)).is_some() {
                return Err(OutputError::Config(format!("output id {id} used twice")));
            }
        }
        Ok(Self {
            port,
            outputs: by_id,
        })
    }

    /// Create the service by reading the daemon config file.
    ///
    /// * `filepath`: path to config file.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        Self::new(OutputServiceConfig::from_file(filepath)?)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn output(&self, id: &Uuid) -> Option<&Arc<dyn OutputModule>> {
        self.outputs.get(id)
    }

    /// Initialise every output. An output that fails stays registered
    /// and answers "not set up" until it comes up.
    pub fn initialize_all(&self) {
        for (id, output) in &self.outputs {
            if let Err(err) = output.initialize() {
                warn!(output = %id, "output left not set up: {err}");
            }
        }
    }

    /// Apply every output's shutdown state.
    pub fn stop_all(&self) {
        for output in self.outputs.values() {
            output.stop_output();
        }
    }

    /// Answer one control message. Blocks for as long as the hardware
    /// transaction takes.
    pub fn handle(&self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::Switch(switch) => self.switch(switch),
            ControlMessage::IsOn { output_id, channel } => match self.outputs.get(&output_id) {
                Some(output) => {
                    let state = output.is_on(channel);
                    let message = match state {
                        Some(true) => format!("CH{channel} on"),
                        Some(false) => format!("CH{channel} off"),
                        None => format!("CH{channel} unknown"),
                    };
                    ControlReply::ok(message).with_state(state)
                }
                None => unknown_output(output_id),
            },
            ControlMessage::IsSetup { output_id } => match self.outputs.get(&output_id) {
                Some(output) => {
                    let setup = output.is_setup();
                    ControlReply::ok(if setup { "set up" } else { "not set up" })
                        .with_state(Some(setup))
                }
                None => unknown_output(output_id),
            },
        }
    }

    fn switch(&self, message: SwitchMessage) -> ControlReply {
        let Some(output) = self.outputs.get(&message.output_id) else {
            return unknown_output(message.output_id);
        };
        match output.switch(
            message.state,
            message.output_type,
            message.amount,
            message.channel,
        ) {
            Ok(status) => {
                let state = message.channel.and_then(|channel| output.is_on(channel));
                ControlReply::ok(status).with_state(state)
            }
            Err(err) => {
                error!(output = %message.output_id, channel = ?message.channel, "{err}");
                ControlReply::error(err.to_string())
            }
        }
    }
}

fn unknown_output(id: Uuid) -> ControlReply {
    ControlReply::error(format!("no output with id {id}"))
}

/// Unit struct for adding controlling behaviour to the output service.
pub struct OutputServiceController;

impl OutputServiceController {
    /// Initialise the outputs and serve control messages until Ctrl-C,
    /// then apply every output's shutdown state.
    ///
    /// * `service`: component
    pub async fn start(service: OutputService) -> Result<()> {
        let service = Arc::new(service);
        let listener = TcpListener::bind(("0.0.0.0", service.port())).await?;
        let initializing = service.clone();
        tokio::task::spawn_blocking(move || initializing.initialize_all())
            .await
            .map_err(|err| OutputError::Setup(err.to_string()))?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("could not listen for ctrl-c: {err}");
            }
            info!("shutting down");
            signal.cancel();
        });

        Self::serve(listener, service.clone(), shutdown).await;

        let stopping = service.clone();
        tokio::task::spawn_blocking(move || stopping.stop_all())
            .await
            .map_err(|err| OutputError::Setup(err.to_string()))?;
        Ok(())
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(
        listener: TcpListener,
        service: Arc<OutputService>,
        shutdown: CancellationToken,
    ) {
        if let Ok(address) = listener.local_addr() {
            info!(%address, outputs = service.outputs.len(), "output daemon listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(%peer, "control connection");
                        let service = service.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, service).await;
                        });
                    }
                    Err(err) => warn!("could not accept connection: {err}"),
                },
            }
        }
    }
}

/// Answer every line received on one connection. Clients may send one
/// message per connection or keep the connection open.
async fn handle_connection(socket: TcpStream, service: Arc<OutputService>) {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = framed.next().await {
        let reply = match line {
            Ok(line) => match serde_json::from_str::<ControlMessage>(&line) {
                Ok(message) => {
                    let service = service.clone();
                    tokio::task::spawn_blocking(move || service.handle(message))
                        .await
                        .unwrap_or_else(|err| ControlReply::error(err.to_string()))
                }
                Err(err) => {
                    warn!("malformed control message: {err}");
                    ControlReply::error(format!("malformed message: {err}"))
                }
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                ControlReply::error(format!("message longer than {MAX_LINE_LENGTH} bytes"))
            }
            Err(LinesCodecError::Io(err)) => {
                debug!("control connection closed: {err}");
                break;
            }
        };
        let encoded = match serde_json::to_string(&reply) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("could not encode reply: {err}");
                break;
            }
        };
        if let Err(err) = framed.send(encoded).await {
            debug!("could not send reply: {err}");
            break;
        }
    }
}
