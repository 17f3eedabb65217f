//! Peer discovery and leader election.
//!
//! Each group member sends periodic heartbeats carrying its identity and
//! join timestamp. Every member tracks its peers, evicts the silent ones,
//! and orders the live set by join time; the earliest-joined member is the
//! leader and member numbers `1..=N` follow that order. Because the
//! ordering is deterministic and every member sees the same heartbeats,
//! each member derives its own assignment locally and publishes it on the
//! event bus as `membership.changed`.
//!
//! The heartbeat mechanism is pluggable through [`HeartbeatTransport`];
//! [`TcpHeartbeatTransport`] ships with the crate, and tests use the
//! in-process loopback from [`crate::testing`].

mod leader;
mod service;
mod tcp;

pub use leader::LeaderElection;
pub use service::ServiceDiscovery;
pub use tcp::TcpHeartbeatTransport;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::DcpError;

/// One peer heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Stable identity of the sender.
    pub member_id: String,
    /// When the sender joined the group (epoch millis). Fixed for the
    /// lifetime of the process; drives leader ordering.
    pub joined_at_ms: i64,
    /// When this heartbeat was sent (epoch millis).
    pub sent_at_ms: i64,
}

/// Answers an incoming heartbeat with the local one.
pub type HeartbeatHandler = Arc<dyn Fn(Heartbeat) -> Heartbeat + Send + Sync>;

/// Carries heartbeats between peers.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync + 'static {
    /// Serves incoming heartbeat exchanges until `cancel` fires. Each
    /// received heartbeat is passed to `handler`; its return value is sent
    /// back as the response.
    async fn serve(
        &self,
        handler: HeartbeatHandler,
        cancel: CancellationToken,
    ) -> Result<(), DcpError>;

    /// Sends one heartbeat to a peer and returns the peer's response.
    async fn exchange(&self, address: &str, heartbeat: Heartbeat) -> Result<Heartbeat, DcpError>;
}

/// Serializes a heartbeat for the wire.
pub(crate) fn encode_heartbeat(heartbeat: &Heartbeat) -> Result<Vec<u8>, DcpError> {
    bincode::serde::encode_to_vec(heartbeat, bincode::config::standard())
        .map_err(|e| DcpError::Protocol(e.to_string()))
}

/// Deserializes a heartbeat from the wire.
pub(crate) fn decode_heartbeat(data: &[u8]) -> Result<Heartbeat, DcpError> {
    let (heartbeat, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| DcpError::Protocol(e.to_string()))?;
    Ok(heartbeat)
}
