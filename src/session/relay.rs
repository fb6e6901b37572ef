//! Byte relay between a tuner's raw PCM stdout and a player's stdin.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

pub const RELAY_CHUNK_BYTES: usize = 4096;

/// Copy fixed-size chunks from `reader` into `writer` until either side
/// ends. Returns the number of bytes relayed.
pub async fn relay<R, W>(mut reader: R, mut writer: W, chunk_bytes: usize) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("Relay source closed after {} bytes", total);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("Relay read error after {} bytes: {}", total, e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            // 播放进程退出后写入会得到 EPIPE
            log::warn!("Relay write error after {} bytes: {}", total, e);
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    total
}

pub fn spawn_relay<R, W>(reader: R, writer: W) -> JoinHandle<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(relay(reader, writer, RELAY_CHUNK_BYTES))
}
