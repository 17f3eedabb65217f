//! Error types for the DCP client.

use crate::models::{SeqNo, VbId};

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum DcpError {
    /// Network failure or exceeded deadline.
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication against the cluster failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed or unexpected DCP response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server-initiated rollback; recovered inside the cluster client.
    #[error("rollback required for vb {vb_id} to seq no {seq_no}")]
    Rollback {
        /// Affected vBucket.
        vb_id: VbId,
        /// Sequence number the server rolled the stream back to.
        seq_no: SeqNo,
    },

    /// The requested key does not exist in the metadata bucket.
    #[error("document not found")]
    KeyNotFound,

    /// Ping found no healthy endpoint for a required service.
    #[error("unhealthy services: {0}")]
    UnhealthyServices(String),

    /// Metadata backend I/O failure.
    #[error("metadata error: {0}")]
    MetadataIo(String),

    /// Configuration rejected at startup.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// The application listener rejected an event.
    #[error("listener failed: {0}")]
    ListenerFailed(String),

    /// Operation issued before the relevant session was established.
    #[error("not connected")]
    NotConnected,

    /// Operation issued after shutdown began.
    #[error("client is shut down")]
    ShutDown,
}

impl DcpError {
    /// `true` for failures worth retrying on the next tick (network and
    /// metadata I/O), as opposed to terminal conditions.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::MetadataIo(_))
    }
}
