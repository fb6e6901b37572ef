use crate::control_bridge::ControlEvent;
use crate::protocol::ControlMessage;
use crate::session::{SessionCoordinator, SessionError, SinkEvent, SourceSpec, TargetId};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::task::JoinSet;

pub struct CoreController {
    coordinator: Arc<SessionCoordinator>,
    default_profile: String,
    default_name: String,
    tasks: JoinSet<()>,
}

impl CoreController {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        default_profile: &str,
        default_name: &str,
    ) -> Self {
        Self {
            coordinator,
            default_profile: default_profile.to_string(),
            default_name: default_name.to_string(),
            tasks: JoinSet::new(),
        }
    }

    /// Returns `Break` once a shutdown has been requested and handled.
    pub async fn handle_control_event(&mut self, event: ControlEvent) -> ControlFlow<()> {
        self.reap_finished_tasks();
        let ControlEvent::Command(msg) = event;
        match msg {
            ControlMessage::Play { target, profile, name } => {
                let spec = SourceSpec {
                    profile: profile.unwrap_or_else(|| self.default_profile.clone()),
                    name: name.unwrap_or_else(|| self.default_name.clone()),
                };
                self.spawn_start(TargetId(target), spec);
            }
            ControlMessage::Stop { target } => {
                log::info!("Stop requested for {}", target);
                self.coordinator.stop(&TargetId(target)).await;
            }
            ControlMessage::VoiceState { target, members } => {
                log::debug!("{} has {} listeners", target, members);
                if members == 0 {
                    self.coordinator
                        .notify_external_disconnect(&TargetId(target))
                        .await;
                }
            }
            ControlMessage::Shutdown => {
                log::info!("Shutdown requested over control socket");
                self.shutdown().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub fn handle_sink_event(&mut self, event: SinkEvent) {
        self.reap_finished_tasks();
        match event {
            SinkEvent::MembershipEmpty { target, session } => {
                // 槽位可能正被新的 start 占用，不能阻塞主循环
                let coordinator = self.coordinator.clone();
                self.tasks.spawn(async move {
                    coordinator.notify_session_disconnect(&target, session).await;
                });
            }
        }
    }

    /// Stop every session and wait for in-flight tasks to unwind.
    pub async fn shutdown(&mut self) {
        self.coordinator.shutdown().await;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Session task failed: {}", e);
            }
        }
    }

    // 每个 start 独立运行，等待就绪期间仍能处理 stop 和断开
    fn spawn_start(&mut self, target: TargetId, spec: SourceSpec) {
        log::info!("Play requested for {}: {}/{}", target, spec.profile, spec.name);
        let coordinator = self.coordinator.clone();
        self.tasks.spawn(async move {
            match coordinator.start(&target, spec).await {
                Ok(()) => {}
                Err(SessionError::Cancelled) => log::debug!("[{}] start superseded", target),
                Err(e) => log::warn!("[{}] start failed: {}", target, e),
            }
        });
    }

    fn reap_finished_tasks(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                log::error!("Session task failed: {}", e);
            }
        }
    }
}
