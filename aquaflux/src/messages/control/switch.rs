use crate::components::outputs::channel::{ActuationKind, SwitchState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One line sent to the output daemon.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Switch a channel of an output.
    Switch(SwitchMessage),
    /// Ask for the cached state of a channel.
    IsOn { output_id: Uuid, channel: u8 },
    /// Ask whether an output has been set up.
    IsSetup { output_id: Uuid },
}

/// Arguments of [`OutputModule::output_switch`](crate::components::outputs::contract::OutputModule::output_switch)
/// addressed to one output.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct SwitchMessage {
    pub output_id: Uuid,
    pub state: SwitchState,
    /// Family default when missing.
    pub output_type: Option<ActuationKind>,
    pub amount: Option<f64>,
    pub channel: Option<u8>,
}

/// The daemon's answer, one line per message.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct ControlReply {
    pub ok: bool,
    pub message: String,
    /// On/off state where the message asked for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
}

impl ControlReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            state: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: Option<bool>) -> Self {
        self.state = state;
        self
    }
}
