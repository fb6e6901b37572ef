//! Streaming session management: supervises decoder processes, waits for
//! them to become ready, and keeps exactly one live stream per target.

mod coordinator;
mod error;
mod plan;
pub mod readiness;
mod relay;
mod sink;
mod status;
pub mod supervisor;

use std::fmt;

pub use coordinator::SessionCoordinator;
pub use error::SessionError;
pub use plan::SourceSpec;
pub use sink::{SinkEvent, VoiceSink};
pub use status::{Presence, Stage, StatusEvent, StatusNotifier};

#[cfg(test)]
pub(crate) use coordinator::tests as coordinator_tests;

/// The voice destination a session streams to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingReady,
    Streaming,
    Stopping,
    Failed,
}

impl SessionState {
    /// States that count against the one-session-per-target rule.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::AwaitingReady | SessionState::Streaming
        )
    }
}
