use async_trait::async_trait;
use uuid::Uuid;

use crate::audio::FrameSourceHandle;

use super::TargetId;

/// Events a sink reports back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Nobody is listening on the target any more. `session` is the session
    /// whose source was attached when the sink noticed.
    MembershipEmpty { target: TargetId, session: Uuid },
}

/// The voice output. The sink pulls frames from an attached source at its
/// own cadence; the coordinator only connects, attaches and detaches.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Join the target (e.g. connect the voice channel).
    async fn connect(&self, target: &TargetId) -> anyhow::Result<()>;
    /// Start pulling frames from `source`. Events raised while pulling are
    /// tagged with `session`.
    async fn attach(
        &self,
        target: &TargetId,
        session: Uuid,
        source: FrameSourceHandle,
    ) -> anyhow::Result<()>;
    /// Stop pulling and leave the target. Must tolerate a target that was
    /// never connected.
    async fn detach(&self, target: &TargetId);
}
