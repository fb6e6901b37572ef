//! The session coordinator: one slot per target, at most one live session
//! per slot.
//!
//! Every state change for a target happens while holding that target's
//! session lock, so the coordinator is the only writer of `SessionState`.
//! A start installs a cancellation token for its target before queueing on
//! the lock; a newer start or a stop cancels it, which aborts a start that
//! is still waiting for the decoder without relying on the decoder to print
//! anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioFrameSource, CaptureOpener, FrameSourceHandle, frames_per_duration};
use crate::config::{Backend, ProfileConfig};

use super::error::SessionError;
use super::plan::{SessionPlan, SourceSpec};
use super::readiness::{Readiness, ReadinessDetector, ReadinessFailure};
use super::relay::spawn_relay;
use super::sink::VoiceSink;
use super::status::{Presence, Stage, StatusNotifier};
use super::supervisor::{ProcessHandle, SpawnError, SpawnOptions, Supervisor};
use super::{SessionState, TargetId};

#[derive(Default)]
struct ActiveAttempt {
    latest_id: u64,
    token: Option<CancellationToken>,
}

struct Slot {
    session: tokio::sync::Mutex<Session>,
    state_tx: watch::Sender<SessionState>,
    attempt: Mutex<ActiveAttempt>,
    #[cfg(test)]
    transitions: Mutex<Vec<SessionState>>,
}

impl Slot {
    fn new(target: TargetId) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            session: tokio::sync::Mutex::new(Session::new(target)),
            state_tx,
            attempt: Mutex::new(ActiveAttempt::default()),
            #[cfg(test)]
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Supersede whatever attempt is in flight and register a new one.
    fn begin_attempt(&self) -> (u64, CancellationToken) {
        let mut active = self.attempt.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = active.token.take() {
            old.cancel();
        }
        active.latest_id = active.latest_id.wrapping_add(1);
        let token = CancellationToken::new();
        active.token = Some(token.clone());
        (active.latest_id, token)
    }

    fn clear_attempt_if(&self, id: u64) {
        let mut active = self.attempt.lock().unwrap_or_else(|p| p.into_inner());
        if active.latest_id == id {
            active.token = None;
        }
    }

    fn cancel_attempt(&self) {
        let old = self.attempt.lock().unwrap_or_else(|p| p.into_inner()).token.take();
        if let Some(token) = old {
            token.cancel();
        }
    }
}

struct Session {
    id: Option<Uuid>,
    target: TargetId,
    state: SessionState,
    supervisor: Supervisor,
    processes: Vec<ProcessHandle>,
    relay: Option<JoinHandle<u64>>,
    source: Option<FrameSourceHandle>,
    sink_connected: bool,
}

impl Session {
    fn new(target: TargetId) -> Self {
        Self {
            id: None,
            target,
            state: SessionState::Idle,
            supervisor: Supervisor::new(),
            processes: Vec::new(),
            relay: None,
            source: None,
            sink_connected: false,
        }
    }

    fn holds_resources(&self) -> bool {
        !self.processes.is_empty()
            || self.relay.is_some()
            || self.source.is_some()
            || self.sink_connected
    }
}

pub struct SessionCoordinator {
    profiles: HashMap<String, ProfileConfig>,
    sink: Arc<dyn VoiceSink>,
    capture: Arc<dyn CaptureOpener>,
    notifier: StatusNotifier,
    idle_presence: Presence,
    slots: Mutex<HashMap<TargetId, Arc<Slot>>>,
    streaming: Mutex<HashMap<TargetId, Presence>>,
}

impl SessionCoordinator {
    pub fn new(
        profiles: HashMap<String, ProfileConfig>,
        sink: Arc<dyn VoiceSink>,
        capture: Arc<dyn CaptureOpener>,
        notifier: StatusNotifier,
        idle_presence: Presence,
    ) -> Self {
        notifier.presence(idle_presence.clone());
        Self {
            profiles,
            sink,
            capture,
            notifier,
            idle_presence,
            slots: Mutex::new(HashMap::new()),
            streaming: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, target: &TargetId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .entry(target.clone())
            .or_insert_with(|| Arc::new(Slot::new(target.clone())))
            .clone()
    }

    fn existing_slot(&self, target: &TargetId) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(target)
            .cloned()
    }

    pub fn state(&self, target: &TargetId) -> SessionState {
        self.existing_slot(target)
            .map(|slot| *slot.state_tx.borrow())
            .unwrap_or(SessionState::Idle)
    }

    pub fn subscribe(&self, target: &TargetId) -> watch::Receiver<SessionState> {
        self.slot(target).state_tx.subscribe()
    }

    /// Every state `target` has entered, in order.
    #[cfg(test)]
    pub(crate) fn transitions(&self, target: &TargetId) -> Vec<SessionState> {
        self.existing_slot(target)
            .map(|slot| slot.transitions.lock().unwrap_or_else(|p| p.into_inner()).clone())
            .unwrap_or_default()
    }

    /// Stop whatever runs on `target`, then bring up a new stream. Returns
    /// once the session streams or the attempt has been torn down again.
    pub async fn start(&self, target: &TargetId, spec: SourceSpec) -> Result<(), SessionError> {
        let plan = match SessionPlan::build(&self.profiles, &spec) {
            Ok(plan) => plan,
            Err(e) => {
                self.notifier.progress(target, Stage::Error, e.to_string());
                return Err(e);
            }
        };

        let slot = self.slot(target);
        let (attempt_id, token) = slot.begin_attempt();
        let result = self.start_locked(&slot, &plan, &token).await;
        slot.clear_attempt_if(attempt_id);
        result
    }

    async fn start_locked(
        &self,
        slot: &Slot,
        plan: &SessionPlan,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut session = slot.session.lock().await;
        if token.is_cancelled() {
            // 排队期间已被新的 start 或 stop 取代
            return Err(SessionError::Cancelled);
        }

        self.teardown(slot, &mut session).await;

        match self.run_attempt(slot, &mut session, plan, token).await {
            Ok(()) => Ok(()),
            Err(SessionError::Cancelled) => {
                log::info!("[{}] start cancelled", session.target);
                self.teardown(slot, &mut session).await;
                Err(SessionError::Cancelled)
            }
            Err(e) => {
                log::error!("[{}] session failed: {}", session.target, e);
                self.set_state(slot, &mut session, SessionState::Failed);
                self.notifier.progress(&session.target, Stage::Error, e.to_string());
                self.teardown(slot, &mut session).await;
                Err(e)
            }
        }
    }

    async fn run_attempt(
        &self,
        slot: &Slot,
        session: &mut Session,
        plan: &SessionPlan,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        let target = session.target.clone();
        let id = Uuid::new_v4();
        session.id = Some(id);
        log::info!("[{}] session {} for {} {}", target, id, plan.label, plan.display_name);
        self.notifier.progress(
            &target,
            Stage::Queued,
            format!("Starting {} for {}...", plan.label, plan.display_name),
        );

        // Connecting
        self.set_state(slot, session, SessionState::Connecting);
        session.sink_connected = true;
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SessionError::Cancelled),
            connected = self.sink.connect(&target) => connected.map_err(SessionError::Sink)?,
        }

        let decoder_options = SpawnOptions {
            working_dir: plan.working_dir.clone(),
            merge_stderr: true,
            raw_stdout: plan.backend == Backend::Relay,
            pipe_stdin: false,
        };
        let mut decoder = session.supervisor.spawn(&plan.decoder_argv, &decoder_options)?;
        session.processes.push(decoder.handle.clone());

        if plan.backend == Backend::Relay {
            let player_options = SpawnOptions {
                working_dir: plan.working_dir.clone(),
                merge_stderr: true,
                raw_stdout: false,
                pipe_stdin: true,
            };
            let mut player = session.supervisor.spawn(&plan.player_argv, &player_options)?;
            session.processes.push(player.handle.clone());

            let (Some(pcm_out), Some(pcm_in)) = (decoder.stdout.take(), player.stdin.take()) else {
                return Err(SessionError::Spawn(SpawnError {
                    program: player.handle.program().to_string(),
                    source: std::io::Error::other("relay pipes were not captured"),
                }));
            };
            session.relay = Some(spawn_relay(pcm_out, pcm_in));
        }

        // AwaitingReady
        self.set_state(slot, session, SessionState::AwaitingReady);
        self.notifier.progress(
            &target,
            Stage::Waiting,
            format!("Waiting for {}...", plan.ready_description),
        );

        let mut lines = decoder.lines;
        let mut detector = ReadinessDetector::new(plan.markers.clone());
        let outcome = match plan.ready_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SessionError::Cancelled),
                outcome = tokio::time::timeout(limit, detector.watch(&mut lines)) => {
                    outcome.map_err(|_| SessionError::ReadinessTimeout(limit))?
                }
            },
            None => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SessionError::Cancelled),
                outcome = detector.watch(&mut lines) => outcome,
            },
        };
        // 之后的输出由 supervisor 的 pump 继续排空
        drop(lines);

        let ready_line = match outcome {
            Readiness::Ready(line) => line,
            Readiness::Errored(failure) => return Err(SessionError::ReadinessFailure(failure)),
            Readiness::Waiting => return Err(SessionError::ReadinessFailure(ReadinessFailure::Eof)),
        };
        log::info!(
            "[{}] decoder ready after {} lines: {}",
            target,
            detector.lines_seen(),
            ready_line
        );

        if !plan.settle.is_zero() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(plan.settle) => {}
            }
        }
        self.notifier.progress(
            &target,
            Stage::Ready,
            format!("{} acquired, beginning streaming...", plan.ready_description),
        );

        let opener = self.capture.clone();
        let capture_config = plan.capture.clone();
        let frames = frames_per_duration(capture_config.sample_rate);
        let source = tokio::task::spawn_blocking(move || {
            let capture = opener.open(&capture_config, frames)?;
            AudioFrameSource::new(capture)
        })
        .await
        .map_err(|e| SessionError::Device(anyhow::anyhow!("capture setup panicked: {e}")))?
        .map_err(SessionError::Device)?;

        log::info!(
            "[{}] capturing {} Hz x{}{}",
            target,
            source.input_rate(),
            source.channel_count(),
            if source.is_resampling() { ", resampling to 48 kHz" } else { "" }
        );
        let handle = FrameSourceHandle::new(source);
        session.source = Some(handle.clone());
        self.sink
            .attach(&target, id, handle)
            .await
            .map_err(SessionError::Sink)?;

        // Streaming
        self.set_state(slot, session, SessionState::Streaming);
        self.notifier.progress(
            &target,
            Stage::Streaming,
            format!("Streaming {}.", plan.display_name),
        );
        self.enter_streaming(
            &target,
            Presence::Streaming {
                name: plan.display_name.clone(),
                url: plan.presence_url.clone(),
            },
        );
        Ok(())
    }

    /// Kill processes, release the frame source, detach the sink, go Idle.
    /// A no-op for a session that is already Idle.
    async fn teardown(&self, slot: &Slot, session: &mut Session) {
        if session.state == SessionState::Idle && !session.holds_resources() {
            return;
        }
        let target = session.target.clone();
        let was_active = session.state.is_active();
        if was_active {
            self.set_state(slot, session, SessionState::Stopping);
        }

        if let Some(relay) = session.relay.take() {
            relay.abort();
        }
        let handles: Vec<ProcessHandle> = session.processes.drain(..).collect();
        for handle in handles.iter().rev() {
            session.supervisor.kill(handle).await;
        }
        session.supervisor.shutdown().await;

        if let Some(source) = session.source.take() {
            // 采集线程可能正阻塞在 readi 上并持有锁
            if let Err(e) = tokio::task::spawn_blocking(move || source.release()).await {
                log::error!("[{}] failed to release frame source: {}", target, e);
            }
        }
        if session.sink_connected {
            self.sink.detach(&target).await;
            session.sink_connected = false;
        }
        self.leave_streaming(&target);

        if let Some(id) = session.id.take() {
            log::info!("[{}] session {} torn down", target, id);
        }
        if was_active {
            self.notifier.progress(&target, Stage::Stopped, "Stopped.");
        }
        self.set_state(slot, session, SessionState::Idle);
    }

    /// Stop the session on `target`. Cancels a start that is still waiting
    /// for its decoder. Stopping an idle target does nothing.
    pub async fn stop(&self, target: &TargetId) {
        let Some(slot) = self.existing_slot(target) else {
            return;
        };
        slot.cancel_attempt();
        let mut session = slot.session.lock().await;
        self.teardown(&slot, &mut session).await;
    }

    /// The sink reported that nobody is left listening on `target`.
    pub async fn notify_external_disconnect(&self, target: &TargetId) {
        log::info!("[{}] sink membership is empty, stopping", target);
        self.stop(target).await;
    }

    /// Like `notify_external_disconnect`, but only for the session the sink
    /// was attached to. Reports about a session that has since been replaced
    /// are dropped, and a start queued behind it is left alone.
    pub async fn notify_session_disconnect(&self, target: &TargetId, session_id: Uuid) {
        let Some(slot) = self.existing_slot(target) else {
            return;
        };
        let mut session = slot.session.lock().await;
        if session.id != Some(session_id) {
            log::debug!(
                "[{}] ignoring disconnect for stale session {} (current {:?})",
                target,
                session_id,
                session.id
            );
            return;
        }
        log::info!("[{}] sink lost session {}, stopping", target, session_id);
        self.teardown(&slot, &mut session).await;
    }

    /// Stop every target.
    pub async fn shutdown(&self) {
        let targets: Vec<TargetId> = self
            .slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        for target in targets {
            self.stop(&target).await;
        }
    }

    fn set_state(&self, slot: &Slot, session: &mut Session, state: SessionState) {
        if session.state == state {
            return;
        }
        log::info!("[{}] {:?} -> {:?}", session.target, session.state, state);
        session.state = state;
        #[cfg(test)]
        slot.transitions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(state);
        slot.state_tx.send_replace(state);
    }

    fn enter_streaming(&self, target: &TargetId, presence: Presence) {
        self.streaming
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.clone(), presence.clone());
        self.notifier.presence(presence);
    }

    fn leave_streaming(&self, target: &TargetId) {
        let next = {
            let mut streaming = self.streaming.lock().unwrap_or_else(|p| p.into_inner());
            if streaming.remove(target).is_none() {
                return;
            }
            streaming
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| self.idle_presence.clone())
        };
        self.notifier.presence(next);
    }
}
