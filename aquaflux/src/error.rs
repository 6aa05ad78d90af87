use thiserror::Error;

/// Errors raised inside the output subsystem. None of these cross the
/// [`OutputModule`](crate::components::outputs::contract::OutputModule)
/// boundary; they are logged and turned into status strings there.
#[derive(Debug, Error)]
pub enum OutputError {
    /// `initialize()` has not succeeded, hardware is never touched.
    #[error("Error 101: device not set up")]
    NotSetup,

    /// The hardware could not be reached while setting up.
    #[error("setup failed: {0}")]
    Setup(String),

    /// A single hardware transaction failed.
    #[error("CH{channel} command failed: {reason}")]
    Command { channel: u8, reason: String },

    /// Bad channel argument, option value or actuation request.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The actuation type is not declared by the output family.
    #[error("output family '{family}' does not support '{output_type}'")]
    Unsupported { family: String, output_type: String },

    /// A network device dropped its connection (command or poll).
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The physical resource lock could not be taken in time.
    #[error("timed out waiting for hardware lock {0}")]
    LockTimeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ConfigFile(#[from] config::ConfigError),
}

impl OutputError {
    /// Convenience constructor for a failed transaction on `channel`.
    pub fn command(channel: u8, reason: impl ToString) -> Self {
        Self::Command {
            channel,
            reason: reason.to_string(),
        }
    }

    /// Whether the failure means the connection to a network device is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Io(_))
    }
}

pub type Result<T, E = OutputError> = std::result::Result<T, E>;
