//! Cluster client: the engine-facing async RPC surface.
//!
//! Owns the three agent sessions (data, metadata, DCP) and wraps every
//! callback-based agent operation in an [`AsyncOp`] so callers get plain
//! awaited `Result`s bounded by configured deadlines. Server-initiated
//! rollbacks are recovered here; the engine only learns the seqno the
//! stream was rolled back to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::agent::{
    AgentFactory, Completion, DcpAgent, DcpAgentOptions, FailoverEntry, KvAgent, KvAgentOptions,
    PingReport, StreamFilter, StreamObserver, SubDocLookup, SubDocMutation, VbSeqNoEntry,
};
use crate::cluster::backoff::Backoff;
use crate::cluster::op::AsyncOp;
use crate::config::{DcpConfig, MetadataKind};
use crate::error::DcpError;
use crate::models::{Offset, SeqNo, VbId, SEQ_NO_MAX};

/// Result of a successful stream open.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOpenOutcome {
    /// Set when the server rolled the stream back; carries the seqno the
    /// stream now resumes from. The caller must reset its offset to it.
    pub rolled_back_to: Option<SeqNo>,
}

/// Async RPC surface over the agent sessions.
pub struct ClusterClient {
    config: Arc<DcpConfig>,
    factory: Arc<dyn AgentFactory>,
    agent: RwLock<Option<Arc<dyn KvAgent>>>,
    meta_agent: RwLock<Option<Arc<dyn KvAgent>>>,
    dcp_agent: RwLock<Option<Arc<dyn DcpAgent>>>,
}

impl ClusterClient {
    /// Creates a disconnected client.
    #[must_use]
    pub fn new(config: Arc<DcpConfig>, factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            config,
            factory,
            agent: RwLock::new(None),
            meta_agent: RwLock::new(None),
            dcp_agent: RwLock::new(None),
        }
    }

    fn data_agent(&self) -> Result<Arc<dyn KvAgent>, DcpError> {
        self.agent.read().clone().ok_or(DcpError::NotConnected)
    }

    fn metadata_agent(&self) -> Result<Arc<dyn KvAgent>, DcpError> {
        self.meta_agent.read().clone().ok_or(DcpError::NotConnected)
    }

    fn streaming_agent(&self) -> Result<Arc<dyn DcpAgent>, DcpError> {
        self.dcp_agent.read().clone().ok_or(DcpError::NotConnected)
    }

    /// Default deadline for one-shot cluster operations.
    fn op_deadline(&self) -> Duration {
        self.config.dcp.connection_timeout
    }

    /// Issues a callback operation, retrying with best-effort exponential
    /// backoff while it fails with transient errors. Bounded by the
    /// connection timeout overall, so the caller sees either success or a
    /// terminal error; permanent errors fail fast without retrying.
    async fn with_retry<T, F>(&self, issue: F) -> Result<T, DcpError>
    where
        T: Send + 'static,
        F: Fn(Completion<T>),
    {
        let limit = self.op_deadline();
        let started = Instant::now();
        let mut backoff = Backoff::new(Duration::from_secs(5));

        loop {
            let (op, cb) = AsyncOp::new();
            issue(cb);

            let Some(remaining) = limit.checked_sub(started.elapsed()) else {
                return Err(DcpError::Transport(format!(
                    "operation did not complete within {limit:?}"
                )));
            };
            match op.wait(Some(remaining)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    let Some(remaining) = limit.checked_sub(started.elapsed()) else {
                        return Err(e);
                    };
                    let delay = backoff.next_delay().min(remaining);
                    warn!(
                        attempt = backoff.attempt(),
                        error = %e,
                        "cluster operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Establishes the data session, and the metadata session when the
    /// checkpoint backend is cluster-backed.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::Transport`] when a session cannot be created or
    /// does not become ready within the connection timeout.
    pub async fn connect(&self) -> Result<(), DcpError> {
        let config = &self.config;

        // When the metadata bucket aliases the source bucket, a single
        // session serves both; size its buffer for the larger demand.
        let mut connection_buffer_size = config.dcp.connection_buffer_size;
        let metadata_aliases_source = config.metadata.kind == MetadataKind::Couchbase
            && config.metadata_bucket() == config.bucket_name;
        if metadata_aliases_source {
            connection_buffer_size =
                connection_buffer_size.max(config.metadata.connection_buffer_size);
        }

        let agent = self.factory.kv_agent(&KvAgentOptions {
            bucket_name: config.bucket_name.clone(),
            connection_buffer_size,
        })?;
        self.with_retry(|cb| agent.wait_until_ready(cb)).await?;
        *self.agent.write() = Some(Arc::clone(&agent));

        if config.metadata.kind == MetadataKind::Couchbase && !metadata_aliases_source {
            let meta_agent = self.factory.kv_agent(&KvAgentOptions {
                bucket_name: config.metadata_bucket().to_string(),
                connection_buffer_size: config.metadata.connection_buffer_size,
            })?;
            self.with_retry(|cb| meta_agent.wait_until_ready(cb))
                .await?;
            *self.meta_agent.write() = Some(meta_agent);
            info!(
                hosts = ?config.hosts,
                bucket = %config.bucket_name,
                meta_bucket = %config.metadata_bucket(),
                "connected"
            );
        } else {
            *self.meta_agent.write() = Some(agent);
            info!(hosts = ?config.hosts, bucket = %config.bucket_name, "connected");
        }

        Ok(())
    }

    /// Establishes the DCP session.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::Transport`] when the session cannot be created
    /// or does not become ready within the connection timeout.
    pub async fn dcp_connect(&self) -> Result<(), DcpError> {
        let config = &self.config;
        let connection_name = format!("{}_{}", config.dcp.group.name, Uuid::new_v4());

        let agent = self.factory.dcp_agent(&DcpAgentOptions {
            bucket_name: config.bucket_name.clone(),
            connection_name,
            buffer_size: config.dcp.buffer_size,
            connection_buffer_size: config.dcp.connection_buffer_size,
            use_collections: config.is_collection_mode_enabled(),
        })?;
        self.with_retry(|cb| agent.wait_until_ready(cb)).await?;
        *self.dcp_agent.write() = Some(agent);

        info!(hosts = ?config.hosts, bucket = %config.bucket_name, "connected as dcp");
        Ok(())
    }

    /// Tears down the data and metadata sessions.
    pub fn close(&self) {
        let meta = self.meta_agent.write().take();
        let data = self.agent.write().take();
        if let Some(meta) = &meta {
            meta.close();
        }
        if let Some(data) = data {
            let aliased = meta.is_some_and(|meta| Arc::ptr_eq(&meta, &data));
            if !aliased {
                data.close();
            }
        }
        info!(hosts = ?self.config.hosts, "connections closed");
    }

    /// Tears down the DCP session.
    pub fn dcp_close(&self) {
        if let Some(agent) = self.dcp_agent.write().take() {
            agent.close();
        }
        info!(hosts = ?self.config.hosts, "dcp connection closed");
    }

    /// Pings the cluster; healthy only when both the memcached and the
    /// management service report at least one healthy endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::UnhealthyServices`] when either service has no
    /// healthy endpoint, or a transport error when the ping itself fails.
    pub async fn ping(&self) -> Result<(), DcpError> {
        let agent = self.data_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.ping(cb);
        let report = op.wait(Some(self.config.health_check.timeout)).await?;

        let memd_ok = PingReport::any_healthy(&report.memd);
        let mgmt_ok = PingReport::any_healthy(&report.mgmt);
        if memd_ok && mgmt_ok {
            Ok(())
        } else {
            Err(DcpError::UnhealthyServices(format!(
                "memd healthy: {memd_ok}, mgmt healthy: {mgmt_ok}"
            )))
        }
    }

    /// Number of vBuckets in the source bucket.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::NotConnected`] before `dcp_connect`.
    pub fn get_num_vbuckets(&self) -> Result<u16, DcpError> {
        Ok(self.streaming_agent()?.config_snapshot()?.num_vbuckets)
    }

    /// UUID of the source bucket.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::NotConnected`] before `dcp_connect`.
    pub fn get_bucket_uuid(&self) -> Result<String, DcpError> {
        Ok(self.streaming_agent()?.config_snapshot()?.bucket_uuid)
    }

    /// Current high sequence number of every active vBucket.
    ///
    /// # Errors
    ///
    /// Propagates transport failures from the agent.
    pub async fn get_vbucket_seqnos(&self) -> Result<HashMap<VbId, SeqNo>, DcpError> {
        let agent = self.streaming_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.get_vbucket_seqnos(cb);
        let entries: Vec<VbSeqNoEntry> = op.wait(Some(self.op_deadline())).await?;
        Ok(entries.into_iter().map(|e| (e.vb_id, e.seq_no)).collect())
    }

    /// History branch points of one vBucket.
    ///
    /// # Errors
    ///
    /// Propagates transport failures from the agent.
    pub async fn get_failover_logs(&self, vb_id: VbId) -> Result<Vec<FailoverEntry>, DcpError> {
        let agent = self.streaming_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.get_failover_log(vb_id, cb);
        op.wait(Some(self.op_deadline())).await
    }

    /// Opens a DCP stream at `offset`, recovering server-initiated
    /// rollbacks by re-opening from the server-supplied seqno with
    /// `vb_uuid = 0`. Transient failures are retried with best-effort
    /// backoff inside the operation deadline, and the observer's
    /// failover-log cache is refreshed on every (re-)open.
    ///
    /// # Errors
    ///
    /// Surfaces terminal failures only; rollback is recovered here and
    /// transient errors are retried away.
    pub async fn open_stream(
        &self,
        vb_id: VbId,
        offset: &Offset,
        filter: Option<&StreamFilter>,
        observer: &Arc<dyn StreamObserver>,
    ) -> Result<StreamOpenOutcome, DcpError> {
        let agent = self.streaming_agent()?;
        let filter = if agent.has_collections_support() {
            filter.cloned()
        } else {
            None
        };

        let attempt = self
            .with_retry(|cb| {
                agent.open_stream(
                    vb_id,
                    offset.vb_uuid,
                    offset.seq_no,
                    SEQ_NO_MAX,
                    offset.snapshot.start_seq_no,
                    offset.snapshot.end_seq_no,
                    filter.clone(),
                    Arc::clone(observer),
                    cb,
                );
            })
            .await;

        match attempt {
            Ok(entries) => {
                observer.set_failover_logs(vb_id, entries);
                Ok(StreamOpenOutcome::default())
            }
            Err(DcpError::Rollback { seq_no, .. }) => {
                info!(vb_id, vb_uuid = offset.vb_uuid, "need to rollback");
                self.open_stream_with_rollback(
                    &agent,
                    vb_id,
                    offset.seq_no,
                    seq_no,
                    filter,
                    observer,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Re-opens after a rollback: history discarded (`vb_uuid = 0`), the
    /// position and snapshot window collapse onto the rollback seqno.
    async fn open_stream_with_rollback(
        &self,
        agent: &Arc<dyn DcpAgent>,
        vb_id: VbId,
        failed_seq_no: SeqNo,
        rollback_seq_no: SeqNo,
        filter: Option<StreamFilter>,
        observer: &Arc<dyn StreamObserver>,
    ) -> Result<StreamOpenOutcome, DcpError> {
        info!(vb_id, failed_seq_no, rollback_seq_no, "open stream with rollback");

        let entries = self
            .with_retry(|cb| {
                agent.open_stream(
                    vb_id,
                    0,
                    rollback_seq_no,
                    SEQ_NO_MAX,
                    rollback_seq_no,
                    rollback_seq_no,
                    filter.clone(),
                    Arc::clone(observer),
                    cb,
                );
            })
            .await?;
        observer.set_failover_logs(vb_id, entries);

        Ok(StreamOpenOutcome {
            rolled_back_to: Some(rollback_seq_no),
        })
    }

    /// Closes one stream, retrying transient failures inside the
    /// operation deadline.
    ///
    /// # Errors
    ///
    /// Surfaces terminal failures from the agent.
    pub async fn close_stream(&self, vb_id: VbId) -> Result<(), DcpError> {
        let agent = self.streaming_agent()?;
        self.with_retry(|cb| agent.close_stream(vb_id, cb)).await
    }

    /// Resolves collection names to their numeric IDs.
    ///
    /// # Errors
    ///
    /// Fails on the first unresolvable name.
    pub async fn get_collection_ids(
        &self,
        scope: &str,
        collection_names: &[String],
    ) -> Result<HashMap<u32, String>, DcpError> {
        let agent = self.data_agent()?;
        let mut collection_ids = HashMap::new();
        for name in collection_names {
            let (op, cb) = AsyncOp::new();
            agent.get_collection_id(scope, name, cb);
            let id = op.wait(Some(self.op_deadline())).await?;
            collection_ids.insert(id, name.clone());
        }
        Ok(collection_ids)
    }

    // -- KV operations against the metadata bucket --------------------------

    /// Fetches a document body.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::KeyNotFound`] for absent keys.
    pub async fn get(&self, key: &[u8]) -> Result<Bytes, DcpError> {
        let agent = self.metadata_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.get(key, cb);
        op.wait(Some(self.op_deadline())).await
    }

    /// Stores a document body.
    ///
    /// # Errors
    ///
    /// Propagates transport failures from the agent.
    pub async fn set(&self, key: &[u8], value: Bytes) -> Result<(), DcpError> {
        let agent = self.metadata_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.set(key, value, 0, cb);
        op.wait(Some(self.op_deadline())).await
    }

    /// Deletes a document.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::KeyNotFound`] for absent keys.
    pub async fn delete(&self, key: &[u8]) -> Result<(), DcpError> {
        let agent = self.metadata_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.delete(key, cb);
        op.wait(Some(self.op_deadline())).await
    }

    /// Applies sub-document mutations (including xattr paths) to one
    /// document.
    ///
    /// # Errors
    ///
    /// Propagates transport failures from the agent.
    pub async fn mutate_in(
        &self,
        key: &[u8],
        ops: Vec<SubDocMutation>,
        expiry: u32,
    ) -> Result<(), DcpError> {
        let agent = self.metadata_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.mutate_in(key, ops, expiry, cb);
        op.wait(Some(self.op_deadline())).await
    }

    /// Reads one sub-document path.
    ///
    /// # Errors
    ///
    /// Returns [`DcpError::KeyNotFound`] for absent keys or paths.
    pub async fn lookup_in(&self, key: &[u8], op_spec: SubDocLookup) -> Result<Bytes, DcpError> {
        let agent = self.metadata_agent()?;
        let (op, cb) = AsyncOp::new();
        agent.lookup_in(key, op_spec, cb);
        op.wait(Some(self.op_deadline())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotMarker;
    use crate::testing::MockCluster;

    fn test_config() -> Arc<DcpConfig> {
        let mut config = DcpConfig::default();
        config.hosts = vec!["mock:8091".into()];
        config.bucket_name = "orders".into();
        config.dcp.group.name = "group-1".into();
        Arc::new(config)
    }

    async fn connected(mock: &MockCluster) -> ClusterClient {
        let client = ClusterClient::new(test_config(), Arc::new(mock.clone()));
        client.connect().await.unwrap();
        client.dcp_connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_operations_require_sessions() {
        let mock = MockCluster::new(4, "uuid");
        let client = ClusterClient::new(test_config(), Arc::new(mock));
        assert!(matches!(client.ping().await, Err(DcpError::NotConnected)));
        assert!(matches!(
            client.get_num_vbuckets(),
            Err(DcpError::NotConnected)
        ));
        assert!(matches!(
            client.close_stream(0).await,
            Err(DcpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_topology_queries() {
        let mock = MockCluster::new(16, "uuid-7");
        mock.set_seq_no(3, 33);
        let client = connected(&mock).await;

        assert_eq!(client.get_num_vbuckets().unwrap(), 16);
        assert_eq!(client.get_bucket_uuid().unwrap(), "uuid-7");

        let seq_nos = client.get_vbucket_seqnos().await.unwrap();
        assert_eq!(seq_nos.len(), 16);
        assert_eq!(seq_nos[&3], 33);
        assert_eq!(seq_nos[&0], 0);
    }

    #[tokio::test]
    async fn test_ping_unhealthy_service() {
        let mock = MockCluster::new(4, "uuid");
        let client = connected(&mock).await;

        assert!(client.ping().await.is_ok());

        mock.fail_pings(1);
        assert!(matches!(
            client.ping().await,
            Err(DcpError::UnhealthyServices(_))
        ));
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_stream_rollback_recovery() {
        let mock = MockCluster::new(8, "uuid");
        mock.script_rollback(7, 42);
        let client = connected(&mock).await;

        let recording = Arc::new(RecordingObserver::default());
        let observer: Arc<dyn StreamObserver> = Arc::clone(&recording) as Arc<dyn StreamObserver>;
        let offset = Offset {
            vb_uuid: 0xAA,
            seq_no: 100,
            snapshot: SnapshotMarker {
                start_seq_no: 100,
                end_seq_no: 100,
            },
        };
        let outcome = client
            .open_stream(7, &offset, None, &observer)
            .await
            .unwrap();
        assert_eq!(outcome.rolled_back_to, Some(42));

        let requests = mock.open_stream_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].vb_uuid, 0);
        assert_eq!(requests[1].start_seq_no, 42);
        assert_eq!(requests[1].snap_start_seq_no, 42);
        assert_eq!(requests[1].snap_end_seq_no, 42);

        // The re-open refreshed the observer's failover-log cache.
        assert!(recording.failover_logs.lock().contains_key(&7));
    }

    #[tokio::test]
    async fn test_open_stream_retries_transient_failures() {
        let mock = MockCluster::new(4, "uuid");
        mock.fail_next_opens(2, 2);
        let client = connected(&mock).await;

        let recording = Arc::new(RecordingObserver::default());
        let observer: Arc<dyn StreamObserver> = Arc::clone(&recording) as Arc<dyn StreamObserver>;
        let outcome = client
            .open_stream(2, &Offset::default(), None, &observer)
            .await
            .unwrap();
        assert!(outcome.rolled_back_to.is_none());

        // Two failed attempts, then the successful one.
        let requests = mock.open_stream_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.vb_id == 2));
        assert!(recording.failover_logs.lock().contains_key(&2));
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let mock = MockCluster::new(4, "uuid");
        let client = connected(&mock).await;

        assert!(matches!(
            client.get(b"missing").await,
            Err(DcpError::KeyNotFound)
        ));

        client
            .set(b"key", Bytes::from_static(b"{\"v\":1}"))
            .await
            .unwrap();
        assert_eq!(&client.get(b"key").await.unwrap()[..], b"{\"v\":1}");

        client.delete(b"key").await.unwrap();
        assert!(matches!(
            client.get(b"key").await,
            Err(DcpError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_subdoc_round_trip() {
        let mock = MockCluster::new(4, "uuid");
        let client = connected(&mock).await;

        client
            .mutate_in(
                b"doc",
                vec![SubDocMutation {
                    path: "meta.rev".into(),
                    xattr: true,
                    value: b"3".to_vec(),
                }],
                0,
            )
            .await
            .unwrap();

        let value = client
            .lookup_in(
                b"doc",
                SubDocLookup {
                    path: "meta.rev".into(),
                    xattr: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(&value[..], b"3");
    }

    #[tokio::test]
    async fn test_collection_id_resolution() {
        let mock = MockCluster::new(4, "uuid");
        mock.set_collection_id("inventory", "orders", 8);
        mock.set_collection_id("inventory", "returns", 9);
        let client = connected(&mock).await;

        let ids = client
            .get_collection_ids("inventory", &["orders".into(), "returns".into()])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[&8], "orders");
        assert_eq!(ids[&9], "returns");

        let err = client
            .get_collection_ids("inventory", &["missing".into()])
            .await;
        assert!(err.is_err());
    }

    /// Observer that only caches failover logs.
    #[derive(Default)]
    struct RecordingObserver {
        failover_logs: parking_lot::Mutex<HashMap<VbId, Vec<FailoverEntry>>>,
    }

    impl StreamObserver for RecordingObserver {
        fn snapshot_marker(&self, _vb_id: VbId, _marker: SnapshotMarker) {}
        fn mutation(&self, _mutation: crate::models::Mutation) {}
        fn deletion(&self, _deletion: crate::models::Deletion) {}
        fn expiration(&self, _expiration: crate::models::Expiration) {}
        fn stream_end(&self, _vb_id: VbId, _reason: crate::cluster::agent::StreamEndReason) {}
        fn set_failover_logs(&self, vb_id: VbId, entries: Vec<FailoverEntry>) {
            self.failover_logs.lock().insert(vb_id, entries);
        }
    }
}
