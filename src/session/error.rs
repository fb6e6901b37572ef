use std::time::Duration;

use super::readiness::ReadinessFailure;
use super::supervisor::SpawnError;

/// Why a session attempt ended without streaming. Every variant is terminal
/// for the attempt; the coordinator never retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
    #[error("invalid source name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("{0}")]
    ReadinessFailure(ReadinessFailure),
    #[error("decoder was not ready after {0:?}")]
    ReadinessTimeout(Duration),
    #[error("audio device error: {0:#}")]
    Device(anyhow::Error),
    #[error("voice sink error: {0:#}")]
    Sink(anyhow::Error),
    #[error("session was cancelled")]
    Cancelled,
}
