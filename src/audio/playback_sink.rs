//! A voice sink that plays frames on a local ALSA device.
//!
//! Playback runs in a dedicated OS thread per target (not a tokio task) so a
//! blocking `writei` never stalls the runtime. The device clock paces the
//! pull from the frame source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::session::{SinkEvent, TargetId, VoiceSink};

use super::alsa_device::AlsaPlayback;
use super::frame_source::{FRAME_SAMPLES, FrameSourceHandle, OUTPUT_CHANNELS, OUTPUT_RATE};

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct LocalPlaybackSink {
    device: String,
    period_size: usize,
    events: mpsc::Sender<SinkEvent>,
    workers: Mutex<HashMap<TargetId, Worker>>,
}

impl LocalPlaybackSink {
    pub fn new(device: &str, period_size: usize, events: mpsc::Sender<SinkEvent>) -> Self {
        Self {
            device: device.to_string(),
            period_size,
            events,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn take_worker(&self, target: &TargetId) -> Option<Worker> {
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(target)
    }
}

#[async_trait]
impl VoiceSink for LocalPlaybackSink {
    async fn connect(&self, target: &TargetId) -> Result<()> {
        log::info!("[{}] local sink ready on '{}'", target, self.device);
        Ok(())
    }

    async fn attach(
        &self,
        target: &TargetId,
        session: Uuid,
        source: FrameSourceHandle,
    ) -> Result<()> {
        if let Some(old) = self.take_worker(target) {
            stop_worker(target, old).await;
        }

        let running = Arc::new(AtomicBool::new(true));
        let (opened_tx, opened_rx) = oneshot::channel();
        let handle = {
            let running = running.clone();
            let device = self.device.clone();
            let period = (self.period_size > 0).then_some(self.period_size);
            let events = self.events.clone();
            let target = target.clone();
            thread::Builder::new()
                .name("voice-sink".into())
                .spawn(move || {
                    let playback = match AlsaPlayback::open(
                        &device,
                        OUTPUT_RATE,
                        OUTPUT_CHANNELS as u32,
                        period,
                    ) {
                        Ok(playback) => playback,
                        Err(e) => {
                            let _ = opened_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = opened_tx.send(Ok(()));

                    if let Err(e) = play_frames(&playback, &source, &running) {
                        log::error!("[{}] playback failed: {:#}", target, e);
                        if running.load(Ordering::SeqCst) {
                            let event = SinkEvent::MembershipEmpty {
                                target: target.clone(),
                                session,
                            };
                            if let Err(e) = events.try_send(event) {
                                log::warn!("[{}] could not report playback fault: {}", target, e);
                            }
                        }
                    }
                })
                .context("Failed to spawn playback thread")?
        };

        opened_rx
            .await
            .context("Playback thread exited before opening the device")??;

        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.clone(), Worker { running, handle });
        log::info!("[{}] playback attached for session {}", target, session);
        Ok(())
    }

    async fn detach(&self, target: &TargetId) {
        match self.take_worker(target) {
            Some(worker) => stop_worker(target, worker).await,
            None => log::debug!("[{}] detach with no playback attached", target),
        }
    }
}

async fn stop_worker(target: &TargetId, worker: Worker) {
    worker.running.store(false, Ordering::SeqCst);
    // 线程最多阻塞在一次 writei 上
    match tokio::task::spawn_blocking(move || worker.handle.join()).await {
        Ok(Ok(())) => log::info!("[{}] playback detached", target),
        Ok(Err(_)) => log::error!("[{}] playback thread panicked", target),
        Err(e) => log::error!("[{}] failed to join playback thread: {}", target, e),
    }
}

fn play_frames(
    playback: &AlsaPlayback,
    source: &FrameSourceHandle,
    running: &AtomicBool,
) -> Result<()> {
    let params = playback.params();
    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    let mut samples = Vec::with_capacity(FRAME_SAMPLES);
    while running.load(Ordering::Relaxed) {
        let Some(frame) = source.read_frame() else {
            log::info!("Frame source released, playback loop ending");
            break;
        };
        frame_to_samples(&frame, &mut samples);
        playback.write_all(&samples)?;
    }

    playback.drain();
    log::info!("Playback stopped");
    Ok(())
}

/// Decode an S16LE frame into interleaved samples.
fn frame_to_samples(frame: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        frame
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
}
