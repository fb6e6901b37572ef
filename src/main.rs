mod audio;
mod config;
mod control_bridge;
mod controller;
mod protocol;
mod session;

use audio::{AlsaCaptureOpener, LocalPlaybackSink};
use config::Config;
use control_bridge::{ControlBridge, ControlEvent};
use controller::CoreController;
use session::{Presence, SessionCoordinator, SinkEvent, StatusEvent, StatusNotifier};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let config = Config::new()?;
    log::info!(
        "{} {} starting with profiles: {:?}",
        config.app_name,
        config.app_version,
        config.profiles.keys().collect::<Vec<_>>()
    );

    // 控制命令通道
    let (tx_control, mut rx_control) = mpsc::channel::<ControlEvent>(100);
    // 播放设备故障上报
    let (tx_sink, mut rx_sink) = mpsc::channel::<SinkEvent>(100);
    // 状态通知，不阻塞状态机
    let (tx_status, mut rx_status) = mpsc::unbounded_channel::<StatusEvent>();

    let bridge = Arc::new(ControlBridge::new(&config, tx_control).await?);
    let bridge_clone = bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge_clone.run().await {
            log::error!("ControlBridge error: {}", e);
        }
    });

    // 状态转发到命令层
    let status_bridge = bridge.clone();
    tokio::spawn(async move {
        while let Some(event) = rx_status.recv().await {
            if let Err(e) = status_bridge.send_status(&event).await {
                log::warn!("Failed to send status: {}", e);
            }
        }
    });

    let sink = Arc::new(LocalPlaybackSink::new(
        config.playback_device,
        config.playback_period_size,
        tx_sink,
    ));
    let idle_presence = Presence::Listening {
        activity: config.presence_idle_activity.to_string(),
        url: config.presence_idle_url.to_string(),
    };
    let coordinator = Arc::new(SessionCoordinator::new(
        config.profiles.clone(),
        sink,
        Arc::new(AlsaCaptureOpener),
        StatusNotifier::new(tx_status),
        idle_presence,
    ));
    let mut controller =
        CoreController::new(coordinator, config.default_profile, config.default_name);
    log::info!("Session manager ready");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                controller.shutdown().await;
                break;
            }

            Some(event) = rx_control.recv() => {
                if let ControlFlow::Break(()) = controller.handle_control_event(event).await {
                    break;
                }
            }

            Some(event) = rx_sink.recv() => {
                controller.handle_sink_event(event);
            }
        }
    }

    log::info!("All sessions stopped, exiting");
    Ok(())
}
