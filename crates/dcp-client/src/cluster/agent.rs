//! The external-SDK seam.
//!
//! The wire-level DCP codec lives outside this crate. What the engine needs
//! from it is modeled here as callback-based agent traits mirroring the
//! SDK's completion style: every operation takes a [`Completion`] that is
//! resolved exactly once with `(result, error)` collapsed into a `Result`.
//! [`crate::cluster::ClusterClient`] is the only consumer of these traits
//! and is responsible for turning completions into awaited futures; raw
//! callbacks never escape the `cluster` module.
//!
//! The in-memory implementation used by tests lives in [`crate::testing`].

use std::sync::Arc;

use bytes::Bytes;

use crate::error::DcpError;
use crate::models::{Deletion, Expiration, Mutation, SeqNo, SnapshotMarker, VbId, VbUuid};

/// Single-shot completion callback of an agent operation.
pub type Completion<T> = Box<dyn FnOnce(Result<T, DcpError>) + Send + 'static>;

/// One `(vb_uuid, seq_no)` branch point in a vBucket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    /// History branch identifier.
    pub vb_uuid: VbUuid,
    /// Sequence number the branch started at.
    pub seq_no: SeqNo,
}

/// Current high sequence number of one vBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbSeqNoEntry {
    /// The vBucket.
    pub vb_id: VbId,
    /// Its current high sequence number.
    pub seq_no: SeqNo,
}

/// Topology facts captured from the cluster configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Number of vBuckets in the source bucket.
    pub num_vbuckets: u16,
    /// UUID of the source bucket.
    pub bucket_uuid: String,
}

/// State of one pinged endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    /// Endpoint answered in time.
    Ok,
    /// Endpoint did not answer before the deadline.
    Timeout,
    /// Endpoint answered with an error.
    Error,
}

/// Ping result of a single service endpoint.
#[derive(Debug, Clone)]
pub struct EndpointPing {
    /// Remote address of the endpoint.
    pub address: String,
    /// Observed state.
    pub state: PingState,
}

/// Per-service ping outcome.
#[derive(Debug, Clone, Default)]
pub struct PingReport {
    /// Memcached (data) service endpoints.
    pub memd: Vec<EndpointPing>,
    /// Management service endpoints.
    pub mgmt: Vec<EndpointPing>,
}

impl PingReport {
    /// `true` when at least one endpoint of the slice answered `Ok`.
    #[must_use]
    pub fn any_healthy(endpoints: &[EndpointPing]) -> bool {
        endpoints.iter().any(|e| e.state == PingState::Ok)
    }
}

/// Why a stream stopped delivering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The stream reached its end sequence number.
    Ok,
    /// The consumer closed the stream.
    Closed,
    /// The vBucket moved to another server node.
    StateChanged,
    /// The connection dropped.
    Disconnected,
}

/// Collection filter for an opened stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    /// Numeric collection IDs to stream; empty streams everything.
    pub collection_ids: Vec<u32>,
}

/// Sub-document mutation (dict-set semantics).
#[derive(Debug, Clone)]
pub struct SubDocMutation {
    /// Path inside the document.
    pub path: String,
    /// Write into extended attributes instead of the body.
    pub xattr: bool,
    /// JSON-encoded value.
    pub value: Vec<u8>,
}

/// Sub-document lookup.
#[derive(Debug, Clone)]
pub struct SubDocLookup {
    /// Path inside the document.
    pub path: String,
    /// Read from extended attributes instead of the body.
    pub xattr: bool,
}

/// Receiver of DCP stream traffic.
///
/// Implemented by the stream engine and handed to [`DcpAgent::open_stream`].
/// Contract: for any one vBucket the agent issues at most one call at a
/// time, in sequence-number order; calls for different vBuckets may run in
/// parallel.
pub trait StreamObserver: Send + Sync {
    /// A snapshot window announcement for upcoming events.
    fn snapshot_marker(&self, vb_id: VbId, marker: SnapshotMarker);

    /// A document mutation.
    fn mutation(&self, mutation: Mutation);

    /// A document deletion.
    fn deletion(&self, deletion: Deletion);

    /// A document expiration.
    fn expiration(&self, expiration: Expiration);

    /// The stream stopped; no further events will arrive for `vb_id`.
    fn stream_end(&self, vb_id: VbId, reason: StreamEndReason);

    /// The vBucket's failover log, delivered on stream open and rollback.
    fn set_failover_logs(&self, vb_id: VbId, entries: Vec<FailoverEntry>);
}

/// Key-value session against one bucket.
///
/// Operations are deadline-free at this layer; callers bound their waits
/// on the completion side.
pub trait KvAgent: Send + Sync {
    /// Resolves once the session is usable.
    fn wait_until_ready(&self, cb: Completion<()>);

    /// Pings every connected service endpoint.
    fn ping(&self, cb: Completion<PingReport>);

    /// Fetches a document body. Resolves [`DcpError::KeyNotFound`] when the
    /// key does not exist.
    fn get(&self, key: &[u8], cb: Completion<Bytes>);

    /// Stores a document body.
    fn set(&self, key: &[u8], value: Bytes, expiry: u32, cb: Completion<()>);

    /// Deletes a document. Resolves [`DcpError::KeyNotFound`] when absent.
    fn delete(&self, key: &[u8], cb: Completion<()>);

    /// Applies sub-document mutations to one document.
    fn mutate_in(&self, key: &[u8], ops: Vec<SubDocMutation>, expiry: u32, cb: Completion<()>);

    /// Reads one sub-document path.
    fn lookup_in(&self, key: &[u8], op: SubDocLookup, cb: Completion<Bytes>);

    /// Resolves a collection name to its numeric ID.
    fn get_collection_id(&self, scope: &str, collection: &str, cb: Completion<u32>);

    /// Tears the session down.
    fn close(&self);
}

/// DCP streaming session against the source bucket.
pub trait DcpAgent: Send + Sync {
    /// Resolves once the session is usable.
    fn wait_until_ready(&self, cb: Completion<()>);

    /// Topology facts from the current cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::NotConnected`] before the session is ready.
    fn config_snapshot(&self) -> Result<ConfigSnapshot, DcpError>;

    /// Current high sequence number of every active vBucket.
    fn get_vbucket_seqnos(&self, cb: Completion<Vec<VbSeqNoEntry>>);

    /// History branch points of one vBucket.
    fn get_failover_log(&self, vb_id: VbId, cb: Completion<Vec<FailoverEntry>>);

    /// `true` when the server speaks collections on this session.
    fn has_collections_support(&self) -> bool;

    /// Opens a DCP stream. The completion carries the vBucket's failover
    /// log; a position off the current history branch resolves
    /// [`DcpError::Rollback`].
    #[allow(clippy::too_many_arguments)]
    fn open_stream(
        &self,
        vb_id: VbId,
        vb_uuid: VbUuid,
        start_seq_no: SeqNo,
        end_seq_no: SeqNo,
        snap_start_seq_no: SeqNo,
        snap_end_seq_no: SeqNo,
        filter: Option<StreamFilter>,
        observer: Arc<dyn StreamObserver>,
        cb: Completion<Vec<FailoverEntry>>,
    );

    /// Closes one stream.
    fn close_stream(&self, vb_id: VbId, cb: Completion<()>);

    /// Tears the session down.
    fn close(&self);
}

/// Options for creating a [`KvAgent`].
#[derive(Debug, Clone)]
pub struct KvAgentOptions {
    /// Bucket the session binds to.
    pub bucket_name: String,
    /// Kernel connection buffer size.
    pub connection_buffer_size: usize,
}

/// Options for creating a [`DcpAgent`].
#[derive(Debug, Clone)]
pub struct DcpAgentOptions {
    /// Bucket the stream reads from.
    pub bucket_name: String,
    /// Connection name visible to the server (`{group}_{uuid}`).
    pub connection_name: String,
    /// DCP flow-control buffer size.
    pub buffer_size: usize,
    /// Kernel connection buffer size.
    pub connection_buffer_size: usize,
    /// Negotiate collection support.
    pub use_collections: bool,
}

/// Creates agent sessions; the constructor seam where a concrete SDK (or
/// the in-memory test cluster) plugs in.
pub trait AgentFactory: Send + Sync {
    /// Creates a key-value session.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::Transport`] when the session cannot be created.
    fn kv_agent(&self, options: &KvAgentOptions) -> Result<Arc<dyn KvAgent>, DcpError>;

    /// Creates a DCP streaming session.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::Transport`] when the session cannot be created.
    fn dcp_agent(&self, options: &DcpAgentOptions) -> Result<Arc<dyn DcpAgent>, DcpError>;
}
