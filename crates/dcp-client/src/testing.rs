//! In-memory test doubles.
//!
//! [`MockCluster`] implements the agent seam entirely in memory: scripted
//! DCP events per vBucket, rollback injection, per-vBucket seqnos and
//! failover logs, and a KV document store. Tests drive the whole engine
//! against it without a server. [`LoopbackHub`] does the same for the
//! heartbeat transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cluster::agent::{
    AgentFactory, Completion, ConfigSnapshot, DcpAgent, DcpAgentOptions, EndpointPing,
    FailoverEntry, KvAgent, KvAgentOptions, PingReport, PingState, StreamEndReason, StreamFilter,
    StreamObserver, SubDocLookup, SubDocMutation, VbSeqNoEntry,
};
use crate::discovery::{Heartbeat, HeartbeatHandler, HeartbeatTransport};
use crate::error::DcpError;
use crate::models::{
    DcpEvent, Deletion, Expiration, Listener, Mutation, SeqNo, SnapshotMarker, VbId, VbUuid,
};

/// One scripted stream event, replayed on stream open.
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    /// Snapshot window announcement.
    Marker(SnapshotMarker),
    /// Document mutation.
    Mutation {
        /// Sequence number.
        seq_no: SeqNo,
        /// Document key.
        key: Bytes,
        /// Document body.
        value: Bytes,
    },
    /// Document deletion.
    Deletion {
        /// Sequence number.
        seq_no: SeqNo,
        /// Document key.
        key: Bytes,
    },
    /// Document expiration.
    Expiration {
        /// Sequence number.
        seq_no: SeqNo,
        /// Document key.
        key: Bytes,
    },
    /// Stream termination.
    End(StreamEndReason),
}

/// A recorded `open_stream` call.
#[derive(Debug, Clone)]
pub struct OpenStreamRequest {
    /// Requested vBucket.
    pub vb_id: VbId,
    /// Requested history branch.
    pub vb_uuid: VbUuid,
    /// Requested resume position.
    pub start_seq_no: SeqNo,
    /// Requested stream end.
    pub end_seq_no: SeqNo,
    /// Requested snapshot window start.
    pub snap_start_seq_no: SeqNo,
    /// Requested snapshot window end.
    pub snap_end_seq_no: SeqNo,
    /// Requested collection filter.
    pub filter: Option<StreamFilter>,
}

#[derive(Default)]
struct MockState {
    bucket_uuid: Mutex<String>,
    seq_nos: Mutex<HashMap<VbId, SeqNo>>,
    failover_logs: Mutex<HashMap<VbId, Vec<FailoverEntry>>>,
    documents: Mutex<HashMap<Vec<u8>, Bytes>>,
    xattrs: Mutex<HashMap<(Vec<u8>, String), Bytes>>,
    scripted_events: Mutex<HashMap<VbId, Vec<ScriptedEvent>>>,
    rollbacks: Mutex<HashMap<VbId, SeqNo>>,
    transient_open_failures: Mutex<HashMap<VbId, u32>>,
    open_requests: Mutex<Vec<OpenStreamRequest>>,
    close_requests: Mutex<Vec<VbId>>,
    open_streams: Mutex<HashSet<VbId>>,
    ping_failures: Mutex<u32>,
    collection_ids: Mutex<HashMap<(String, String), u32>>,
    collections_support: AtomicBool,
    kv_set_calls: AtomicU64,
}

/// An in-memory cluster implementing [`AgentFactory`].
#[derive(Clone)]
pub struct MockCluster {
    num_vbuckets: u16,
    state: Arc<MockState>,
}

impl MockCluster {
    /// Creates a cluster with `num_vbuckets` vBuckets, all at seqno 0.
    #[must_use]
    pub fn new(num_vbuckets: u16, bucket_uuid: &str) -> Self {
        let state = MockState::default();
        *state.bucket_uuid.lock() = bucket_uuid.to_string();
        state.collections_support.store(true, Ordering::SeqCst);
        Self {
            num_vbuckets,
            state: Arc::new(state),
        }
    }

    /// Sets one vBucket's current high seqno.
    pub fn set_seq_no(&self, vb_id: VbId, seq_no: SeqNo) {
        self.state.seq_nos.lock().insert(vb_id, seq_no);
    }

    /// Sets one vBucket's failover log.
    pub fn set_failover_log(&self, vb_id: VbId, entries: Vec<FailoverEntry>) {
        self.state.failover_logs.lock().insert(vb_id, entries);
    }

    /// Makes the next `open_stream` for `vb_id` with a non-zero branch
    /// fail with a rollback to `seq_no`; the follow-up zero-branch open
    /// succeeds.
    pub fn script_rollback(&self, vb_id: VbId, seq_no: SeqNo) {
        self.state.rollbacks.lock().insert(vb_id, seq_no);
    }

    /// Scripts the events replayed when a stream opens on `vb_id`.
    pub fn script_events(&self, vb_id: VbId, events: Vec<ScriptedEvent>) {
        self.state.scripted_events.lock().insert(vb_id, events);
    }

    /// Makes the next `count` `open_stream` calls for `vb_id` fail with a
    /// transport error before the stream opens normally.
    pub fn fail_next_opens(&self, vb_id: VbId, count: u32) {
        self.state
            .transient_open_failures
            .lock()
            .insert(vb_id, count);
    }

    /// Makes the next `count` pings fail (use `u32::MAX` for all).
    pub fn fail_pings(&self, count: u32) {
        *self.state.ping_failures.lock() = count;
    }

    /// Registers a collection name → ID mapping.
    pub fn set_collection_id(&self, scope: &str, collection: &str, id: u32) {
        self.state
            .collection_ids
            .lock()
            .insert((scope.to_string(), collection.to_string()), id);
    }

    /// Toggles server-side collections support.
    pub fn set_collections_support(&self, enabled: bool) {
        self.state
            .collections_support
            .store(enabled, Ordering::SeqCst);
    }

    /// Replaces the bucket UUID (simulates a recreated bucket).
    pub fn set_bucket_uuid(&self, bucket_uuid: &str) {
        *self.state.bucket_uuid.lock() = bucket_uuid.to_string();
    }

    /// All recorded `open_stream` calls, in order.
    #[must_use]
    pub fn open_stream_requests(&self) -> Vec<OpenStreamRequest> {
        self.state.open_requests.lock().clone()
    }

    /// All recorded `close_stream` calls, in order.
    #[must_use]
    pub fn close_stream_requests(&self) -> Vec<VbId> {
        self.state.close_requests.lock().clone()
    }

    /// vBuckets with a currently open stream.
    #[must_use]
    pub fn open_streams(&self) -> Vec<VbId> {
        let mut ids: Vec<VbId> = self.state.open_streams.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Copy of one stored document.
    #[must_use]
    pub fn document(&self, key: &[u8]) -> Option<Bytes> {
        self.state.documents.lock().get(key).cloned()
    }

    /// Stores a document directly.
    pub fn insert_document(&self, key: &[u8], value: Bytes) {
        self.state.documents.lock().insert(key.to_vec(), value);
    }

    /// Number of stored documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.state.documents.lock().len()
    }

    /// Number of KV `set` calls served so far.
    #[must_use]
    pub fn kv_set_call_count(&self) -> u64 {
        self.state.kv_set_calls.load(Ordering::SeqCst)
    }
}

impl AgentFactory for MockCluster {
    fn kv_agent(&self, _options: &KvAgentOptions) -> Result<Arc<dyn KvAgent>, DcpError> {
        Ok(Arc::new(MockKvAgent {
            state: Arc::clone(&self.state),
        }))
    }

    fn dcp_agent(&self, _options: &DcpAgentOptions) -> Result<Arc<dyn DcpAgent>, DcpError> {
        Ok(Arc::new(MockDcpAgent {
            num_vbuckets: self.num_vbuckets,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockKvAgent {
    state: Arc<MockState>,
}

impl KvAgent for MockKvAgent {
    fn wait_until_ready(&self, cb: Completion<()>) {
        cb(Ok(()));
    }

    fn ping(&self, cb: Completion<PingReport>) {
        let mut failures = self.state.ping_failures.lock();
        if *failures > 0 {
            *failures = failures.saturating_sub(1);
            cb(Ok(PingReport {
                memd: vec![EndpointPing {
                    address: "mock:11210".into(),
                    state: PingState::Timeout,
                }],
                mgmt: vec![EndpointPing {
                    address: "mock:8091".into(),
                    state: PingState::Ok,
                }],
            }));
            return;
        }
        cb(Ok(PingReport {
            memd: vec![EndpointPing {
                address: "mock:11210".into(),
                state: PingState::Ok,
            }],
            mgmt: vec![EndpointPing {
                address: "mock:8091".into(),
                state: PingState::Ok,
            }],
        }));
    }

    fn get(&self, key: &[u8], cb: Completion<Bytes>) {
        let documents = self.state.documents.lock();
        match documents.get(key) {
            Some(value) => cb(Ok(value.clone())),
            None => cb(Err(DcpError::KeyNotFound)),
        }
    }

    fn set(&self, key: &[u8], value: Bytes, _expiry: u32, cb: Completion<()>) {
        self.state.kv_set_calls.fetch_add(1, Ordering::SeqCst);
        self.state.documents.lock().insert(key.to_vec(), value);
        cb(Ok(()));
    }

    fn delete(&self, key: &[u8], cb: Completion<()>) {
        match self.state.documents.lock().remove(key) {
            Some(_) => cb(Ok(())),
            None => cb(Err(DcpError::KeyNotFound)),
        }
    }

    fn mutate_in(&self, key: &[u8], ops: Vec<SubDocMutation>, _expiry: u32, cb: Completion<()>) {
        let mut xattrs = self.state.xattrs.lock();
        for op in ops {
            xattrs.insert((key.to_vec(), op.path), Bytes::from(op.value));
        }
        cb(Ok(()));
    }

    fn lookup_in(&self, key: &[u8], op: SubDocLookup, cb: Completion<Bytes>) {
        let xattrs = self.state.xattrs.lock();
        match xattrs.get(&(key.to_vec(), op.path)) {
            Some(value) => cb(Ok(value.clone())),
            None => cb(Err(DcpError::KeyNotFound)),
        }
    }

    fn get_collection_id(&self, scope: &str, collection: &str, cb: Completion<u32>) {
        let ids = self.state.collection_ids.lock();
        match ids.get(&(scope.to_string(), collection.to_string())) {
            Some(id) => cb(Ok(*id)),
            None => cb(Err(DcpError::Protocol(format!(
                "unknown collection {scope}.{collection}"
            )))),
        }
    }

    fn close(&self) {}
}

struct MockDcpAgent {
    num_vbuckets: u16,
    state: Arc<MockState>,
}

impl MockDcpAgent {
    /// Replays the scripted events for `vb_id`, skipping data events at or
    /// before the requested resume position. One task per stream keeps
    /// per-vBucket delivery serialized.
    fn replay(
        state: &Arc<MockState>,
        vb_id: VbId,
        resume_seq_no: SeqNo,
        observer: Arc<dyn StreamObserver>,
    ) {
        let events = state
            .scripted_events
            .lock()
            .get(&vb_id)
            .cloned()
            .unwrap_or_default();
        let state = Arc::clone(state);

        tokio::spawn(async move {
            for event in events {
                match event {
                    ScriptedEvent::Marker(marker) => observer.snapshot_marker(vb_id, marker),
                    ScriptedEvent::Mutation { seq_no, key, value } => {
                        if seq_no > resume_seq_no {
                            observer.mutation(Mutation {
                                vb_id,
                                seq_no,
                                cas: seq_no,
                                collection_id: 0,
                                key,
                                value,
                                flags: 0,
                                expiry: 0,
                            });
                        }
                    }
                    ScriptedEvent::Deletion { seq_no, key } => {
                        if seq_no > resume_seq_no {
                            observer.deletion(Deletion {
                                vb_id,
                                seq_no,
                                cas: seq_no,
                                collection_id: 0,
                                key,
                            });
                        }
                    }
                    ScriptedEvent::Expiration { seq_no, key } => {
                        if seq_no > resume_seq_no {
                            observer.expiration(Expiration {
                                vb_id,
                                seq_no,
                                cas: seq_no,
                                collection_id: 0,
                                key,
                            });
                        }
                    }
                    ScriptedEvent::End(reason) => {
                        state.open_streams.lock().remove(&vb_id);
                        observer.stream_end(vb_id, reason);
                        break;
                    }
                }
            }
        });
    }
}

impl DcpAgent for MockDcpAgent {
    fn wait_until_ready(&self, cb: Completion<()>) {
        cb(Ok(()));
    }

    fn config_snapshot(&self) -> Result<ConfigSnapshot, DcpError> {
        Ok(ConfigSnapshot {
            num_vbuckets: self.num_vbuckets,
            bucket_uuid: self.state.bucket_uuid.lock().clone(),
        })
    }

    fn get_vbucket_seqnos(&self, cb: Completion<Vec<VbSeqNoEntry>>) {
        let seq_nos = self.state.seq_nos.lock();
        let entries = (0..self.num_vbuckets)
            .map(|vb_id| VbSeqNoEntry {
                vb_id,
                seq_no: seq_nos.get(&vb_id).copied().unwrap_or(0),
            })
            .collect();
        cb(Ok(entries));
    }

    fn get_failover_log(&self, vb_id: VbId, cb: Completion<Vec<FailoverEntry>>) {
        let logs = self.state.failover_logs.lock();
        cb(Ok(logs.get(&vb_id).cloned().unwrap_or_default()));
    }

    fn has_collections_support(&self) -> bool {
        self.state.collections_support.load(Ordering::SeqCst)
    }

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
    ) {
        self.state.open_requests.lock().push(OpenStreamRequest {
            vb_id,
            vb_uuid,
            start_seq_no,
            end_seq_no,
            snap_start_seq_no,
            snap_end_seq_no,
            filter,
        });

        if let Some(remaining) = self.state.transient_open_failures.lock().get_mut(&vb_id) {
            if *remaining > 0 {
                *remaining -= 1;
                cb(Err(DcpError::Transport("connection reset".into())));
                return;
            }
        }

        let rollback = self.state.rollbacks.lock().get(&vb_id).copied();
        if let Some(seq_no) = rollback {
            if vb_uuid != 0 {
                cb(Err(DcpError::Rollback { vb_id, seq_no }));
                return;
            }
        }

        self.state.open_streams.lock().insert(vb_id);
        let failover_logs = self
            .state
            .failover_logs
            .lock()
            .get(&vb_id)
            .cloned()
            .unwrap_or_default();
        cb(Ok(failover_logs));

        Self::replay(&self.state, vb_id, start_seq_no, observer);
    }

    fn close_stream(&self, vb_id: VbId, cb: Completion<()>) {
        self.state.close_requests.lock().push(vb_id);
        self.state.open_streams.lock().remove(&vb_id);
        cb(Ok(()));
    }

    fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Listener double
// ---------------------------------------------------------------------------

/// Records delivered events; can be told to reject specific positions.
#[derive(Default)]
pub struct CollectingListener {
    events: Mutex<Vec<(VbId, SeqNo)>>,
    reject: Mutex<HashSet<(VbId, SeqNo)>>,
}

impl CollectingListener {
    /// Creates an accepting listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next delivery of `(vb_id, seq_no)` once.
    pub fn reject_once(&self, vb_id: VbId, seq_no: SeqNo) {
        self.reject.lock().insert((vb_id, seq_no));
    }

    /// Delivered positions, in order of arrival.
    #[must_use]
    pub fn delivered(&self) -> Vec<(VbId, SeqNo)> {
        self.events.lock().clone()
    }

    /// Delivered seqnos of one vBucket, in order of arrival.
    #[must_use]
    pub fn delivered_for(&self, vb_id: VbId) -> Vec<SeqNo> {
        self.events
            .lock()
            .iter()
            .filter(|(vb, _)| *vb == vb_id)
            .map(|(_, seq_no)| *seq_no)
            .collect()
    }
}

impl Listener for CollectingListener {
    fn on_event(&self, event: DcpEvent) -> Result<(), DcpError> {
        let position = (event.vb_id(), event.seq_no());
        if self.reject.lock().remove(&position) {
            return Err(DcpError::ListenerFailed(format!(
                "rejected vb {} seq {}",
                position.0, position.1
            )));
        }
        self.events.lock().push(position);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loopback heartbeat transport
// ---------------------------------------------------------------------------

/// Shared in-process address space for [`LoopbackTransport`]s.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    handlers: Arc<Mutex<HashMap<String, HeartbeatHandler>>>,
}

impl LoopbackHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to `address` on this hub.
    #[must_use]
    pub fn transport(&self, address: &str) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            address: address.to_string(),
        }
    }
}

/// In-process heartbeat transport for multi-member tests.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    address: String,
}

#[async_trait]
impl HeartbeatTransport for LoopbackTransport {
    async fn serve(
        &self,
        handler: HeartbeatHandler,
        cancel: CancellationToken,
    ) -> Result<(), DcpError> {
        self.hub
            .handlers
            .lock()
            .insert(self.address.clone(), handler);
        cancel.cancelled().await;
        self.hub.handlers.lock().remove(&self.address);
        Ok(())
    }

    async fn exchange(&self, address: &str, heartbeat: Heartbeat) -> Result<Heartbeat, DcpError> {
        let handler = self.hub.handlers.lock().get(address).cloned();
        match handler {
            Some(handler) => Ok(handler(heartbeat)),
            None => Err(DcpError::Transport(format!("no listener at {address}"))),
        }
    }
}
