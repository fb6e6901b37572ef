use crate::config::Config;
use crate::protocol::{ControlMessage, OutboundMessage};
use crate::session::{Presence, StatusEvent};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub enum ControlEvent {
    Command(ControlMessage),
}

pub struct ControlBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<ControlEvent>,
}

// 命令层通过本地UDP发送JSON命令，状态和presence原路推回
impl ControlBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<ControlEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!(
            "{}:{}",
            config.control_local_ip, config.control_local_port
        ))
        .await?;
        let target_addr = format!("{}:{}", config.control_remote_ip, config.control_remote_port);
        log::info!("Control bridge listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.control_buffer_size,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Some(msg) = parse_command(&buf[..len]) else {
                log::warn!("Ignoring malformed control message from {}", from);
                continue;
            };
            log::debug!("Control command from {}: {:?}", from, msg);
            if let Err(e) = self.tx.send(ControlEvent::Command(msg)).await {
                log::error!("Failed to forward control command: {}", e);
                break;
            }
        }
        Ok(())
    }

    pub async fn send_status(&self, event: &StatusEvent) -> anyhow::Result<()> {
        let msg = serde_json::to_string(&outbound(event))?;
        self.socket.send_to(msg.as_bytes(), &self.target_addr).await?;
        Ok(())
    }
}

fn parse_command(datagram: &[u8]) -> Option<ControlMessage> {
    let text = std::str::from_utf8(datagram).ok()?;
    serde_json::from_str(text.trim()).ok()
}

fn outbound(event: &StatusEvent) -> OutboundMessage {
    match event {
        StatusEvent::Progress { target, stage, text } => OutboundMessage::Status {
            target: target.to_string(),
            stage: *stage,
            text: text.clone(),
        },
        StatusEvent::Presence(Presence::Listening { activity, url }) => OutboundMessage::Presence {
            activity: "listening".into(),
            name: activity.clone(),
            url: url.clone(),
        },
        StatusEvent::Presence(Presence::Streaming { name, url }) => OutboundMessage::Presence {
            activity: "streaming".into(),
            name: name.clone(),
            url: url.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Stage, TargetId};

    #[test]
    fn malformed_datagrams_are_dropped() {
        assert!(parse_command(b"\xff\xfe").is_none());
        assert!(parse_command(b"play okwin").is_none());
        assert_eq!(
            parse_command(b"{\"type\":\"stop\",\"target\":\"g1\"}\n"),
            Some(ControlMessage::Stop { target: "g1".into() })
        );
    }

    #[test]
    fn status_events_map_to_wire_messages() {
        let progress = StatusEvent::Progress {
            target: TargetId::from("g1"),
            stage: Stage::Streaming,
            text: "Streaming OKWIN.".into(),
        };
        assert_eq!(
            outbound(&progress),
            OutboundMessage::Status {
                target: "g1".into(),
                stage: Stage::Streaming,
                text: "Streaming OKWIN.".into(),
            }
        );

        let idle = StatusEvent::Presence(Presence::Listening {
            activity: "the airwaves".into(),
            url: "https://www.rtl-sdr.com/".into(),
        });
        assert_eq!(
            outbound(&idle),
            OutboundMessage::Presence {
                activity: "listening".into(),
                name: "the airwaves".into(),
                url: "https://www.rtl-sdr.com/".into(),
            }
        );
    }

    #[tokio::test]
    async fn forwards_commands_and_sends_status() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let bridge = Arc::new(ControlBridge {
            socket: Arc::new(socket),
            target_addr: peer.local_addr().unwrap().to_string(),
            buffer_size: 4096,
            tx,
        });
        let runner = bridge.clone();
        tokio::spawn(async move { runner.run().await });

        peer.send_to(b"not json", bridge_addr).await.unwrap();
        peer.send_to(br#"{"type":"shutdown"}"#, bridge_addr).await.unwrap();
        let ControlEvent::Command(cmd) = rx.recv().await.unwrap();
        assert_eq!(cmd, ControlMessage::Shutdown);

        bridge
            .send_status(&StatusEvent::Progress {
                target: TargetId::from("g1"),
                stage: Stage::Stopped,
                text: "Stopped.".into(),
            })
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["stage"], "stopped");
    }
}
