use serde::{Deserialize, Serialize};

use crate::session::Stage;

/// Commands accepted on the control socket.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Play {
        target: String,
        profile: Option<String>,
        name: Option<String>,
    },
    Stop {
        target: String,
    },
    /// Listener count on the target, not counting ourselves.
    VoiceState {
        target: String,
        members: u32,
    },
    Shutdown,
}

/// Notifications sent back to the command layer.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Status {
        target: String,
        stage: Stage,
        text: String,
    },
    /// `activity` is "listening" or "streaming"; `name` is what is heard.
    Presence {
        activity: String,
        name: String,
        url: String,
    },
}
