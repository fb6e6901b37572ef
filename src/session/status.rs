use serde::Serialize;
use tokio::sync::mpsc;

use super::TargetId;

/// Lifecycle stage reported to the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Waiting,
    Ready,
    Streaming,
    Error,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Listening { activity: String, url: String },
    Streaming { name: String, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Progress { target: TargetId, stage: Stage, text: String },
    Presence(Presence),
}

/// Fire-and-forget status sink. Sending never blocks and a closed channel
/// is ignored, so notifications cannot stall the state machine.
#[derive(Clone)]
pub struct StatusNotifier {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusNotifier {
    pub fn new(tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { tx }
    }

    pub fn progress(&self, target: &TargetId, stage: Stage, text: impl Into<String>) {
        let text = text.into();
        log::info!("[{}] {:?}: {}", target, stage, text);
        self.send(StatusEvent::Progress { target: target.clone(), stage, text });
    }

    pub fn presence(&self, presence: Presence) {
        self.send(StatusEvent::Presence(presence));
    }

    fn send(&self, event: StatusEvent) {
        if let Err(e) = self.tx.send(event) {
            log::debug!("Status channel closed, dropping {:?}", e.0);
        }
    }
}
