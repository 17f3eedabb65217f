//! TCP heartbeat transport: length-prefixed bincode frames.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{decode_heartbeat, encode_heartbeat, Heartbeat, HeartbeatHandler, HeartbeatTransport};
use crate::error::DcpError;

/// Frames larger than this are rejected.
const MAX_FRAME_LEN: usize = 1_048_576;

/// Heartbeats over plain TCP, one request/response exchange per
/// connection.
pub struct TcpHeartbeatTransport {
    listen_address: String,
}

impl TcpHeartbeatTransport {
    /// Creates a transport listening on `listen_address`.
    #[must_use]
    pub fn new(listen_address: String) -> Self {
        Self { listen_address }
    }

    async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> Result<(), DcpError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = data.len() as u32;
        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| DcpError::Transport(e.to_string()))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| DcpError::Transport(e.to_string()))
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, DcpError> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DcpError::Transport(e.to_string()))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DcpError::Protocol("heartbeat frame too large".into()));
        }
        let mut data = vec![0u8; len];
        stream
            .read_exact(&mut data)
            .await
            .map_err(|e| DcpError::Transport(e.to_string()))?;
        Ok(data)
    }

    async fn answer(mut stream: TcpStream, handler: HeartbeatHandler) -> Result<(), DcpError> {
        let data = Self::read_frame(&mut stream).await?;
        let incoming = decode_heartbeat(&data)?;
        let response = handler(incoming);
        let data = encode_heartbeat(&response)?;
        Self::write_frame(&mut stream, &data).await
    }
}

#[async_trait]
impl HeartbeatTransport for TcpHeartbeatTransport {
    async fn serve(
        &self,
        handler: HeartbeatHandler,
        cancel: CancellationToken,
    ) -> Result<(), DcpError> {
        let listener = TcpListener::bind(&self.listen_address)
            .await
            .map_err(|e| DcpError::Transport(format!("heartbeat bind failed: {e}")))?;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) =
                        accepted.map_err(|e| DcpError::Transport(e.to_string()))?;
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::answer(stream, handler).await {
                            debug!(peer = %peer, error = %e, "heartbeat exchange failed");
                        }
                    });
                }
            }
        }
    }

    async fn exchange(&self, address: &str, heartbeat: Heartbeat) -> Result<Heartbeat, DcpError> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| DcpError::Transport(format!("connect {address}: {e}")))?;

        let data = encode_heartbeat(&heartbeat)?;
        Self::write_frame(&mut stream, &data).await?;
        let response = Self::read_frame(&mut stream).await?;
        decode_heartbeat(&response)
    }
}
