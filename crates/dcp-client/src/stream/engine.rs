//! Stream engine.
//!
//! Orchestrates the per-vBucket stream lifecycle: opens streams for owned
//! vBuckets with resume offsets, feeds DCP traffic to the application
//! listener through its [`StreamObserver`] implementation, keeps the
//! [`OffsetLedger`] current, and rebalances ownership whenever membership
//! changes. Rebalances are serialized; membership events are consumed one
//! at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus, MEMBERSHIP_CHANGED};
use crate::cluster::agent::{FailoverEntry, StreamEndReason, StreamFilter, StreamObserver};
use crate::cluster::ClusterClient;
use crate::config::DcpConfig;
use crate::error::DcpError;
use crate::membership::Membership;
use crate::models::{
    DcpEvent, Deletion, Expiration, Listener, Mutation, Offset, SnapshotMarker, VbId,
};
use crate::stream::checkpoint::CheckpointManager;
use crate::stream::offsets::{LedgerSnapshot, OffsetLedger};
use crate::stream::vbucket::VBucketDiscovery;

/// Lifecycle state of one vBucket stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Opening,
    Open,
    Closing,
}

/// Cluster-aware DCP stream orchestrator.
pub struct StreamEngine {
    client: Arc<ClusterClient>,
    ledger: Arc<OffsetLedger>,
    checkpoint: Arc<CheckpointManager>,
    discovery: VBucketDiscovery,
    listener: Arc<dyn Listener>,
    filter: Option<StreamFilter>,
    open_streams: SyncMutex<HashMap<VbId, StreamState>>,
    membership: SyncMutex<Membership>,
    rebalance_lock: Mutex<()>,
    closing: AtomicBool,
    failover_logs: SyncMutex<HashMap<VbId, Vec<FailoverEntry>>>,
    /// vBuckets whose listener rejected an event. Delivery is suspended
    /// until the stream reopens, so the offset never advances past the
    /// failed event; the event is re-delivered after reconnect.
    failed_vbuckets: SyncMutex<HashSet<VbId>>,
    membership_events: SyncMutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
    membership_task: SyncMutex<Option<CancellationToken>>,
    weak_self: Weak<StreamEngine>,
}

impl StreamEngine {
    /// Wires an engine. Subscribes to `membership.changed` immediately so
    /// events published before [`StreamEngine::open`] are not lost.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &DcpConfig,
        client: Arc<ClusterClient>,
        ledger: Arc<OffsetLedger>,
        checkpoint: Arc<CheckpointManager>,
        discovery: VBucketDiscovery,
        listener: Arc<dyn Listener>,
        collection_ids: &HashMap<u32, String>,
        bus: &EventBus,
    ) -> Arc<Self> {
        let filter = if config.is_collection_mode_enabled() && !collection_ids.is_empty() {
            Some(StreamFilter {
                collection_ids: collection_ids.keys().copied().collect(),
            })
        } else {
            None
        };
        let membership_events = bus.subscribe(MEMBERSHIP_CHANGED);

        Arc::new_cyclic(|weak_self| Self {
            client,
            ledger,
            checkpoint,
            discovery,
            listener,
            filter,
            open_streams: SyncMutex::new(HashMap::new()),
            membership: SyncMutex::new(Membership::SINGLE),
            rebalance_lock: Mutex::new(()),
            closing: AtomicBool::new(false),
            failover_logs: SyncMutex::new(HashMap::new()),
            failed_vbuckets: SyncMutex::new(HashSet::new()),
            membership_events: SyncMutex::new(Some(membership_events)),
            membership_task: SyncMutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// This engine as the observer handed to the DCP session.
    fn observer(&self) -> Result<Arc<dyn StreamObserver>, DcpError> {
        self.weak_self
            .upgrade()
            .map(|engine| engine as Arc<dyn StreamObserver>)
            .ok_or(DcpError::ShutDown)
    }

    /// Loads checkpoints, opens a stream for every owned vBucket in
    /// parallel, starts the auto-save schedule, and begins consuming
    /// membership events.
    ///
    /// # Errors
    ///
    /// Checkpoint load failures and stream-open failures at startup are
    /// fatal.
    pub async fn open(&self, initial: Membership) -> Result<(), DcpError> {
        *self.membership.lock() = initial;
        self.checkpoint.load().await?;

        let change = self.discovery.rebalance(initial);
        let results = join_all(change.owned.iter().map(|vb_id| self.open_stream(*vb_id))).await;
        for result in results {
            result?;
        }

        Arc::clone(&self.checkpoint).start_schedule();
        self.start_membership_listener();

        info!(
            membership = %initial,
            streams = change.owned.len(),
            "dcp stream started"
        );
        Ok(())
    }

    /// Recomputes ownership and diffs it against the open streams: closes
    /// the removed, opens the added. Idempotent; concurrent invocations
    /// serialize, and individual stream failures are left for the next
    /// rebalance to repair.
    pub async fn rebalance(&self) {
        let _guard = self.rebalance_lock.lock().await;
        if self.closing.load(Ordering::SeqCst) {
            debug!("rebalance skipped, engine is closing");
            return;
        }

        let membership = *self.membership.lock();
        let change = self.discovery.rebalance(membership);
        let owned: HashSet<VbId> = change.owned.iter().copied().collect();
        let current: HashSet<VbId> = self.open_streams.lock().keys().copied().collect();

        let removed: Vec<VbId> = current.difference(&owned).copied().collect();
        let added: Vec<VbId> = owned.difference(&current).copied().collect();
        if removed.is_empty() && added.is_empty() {
            debug!("rebalance is a no-op");
            return;
        }

        info!(added = added.len(), removed = removed.len(), "rebalancing");

        let close_results = join_all(removed.iter().map(|vb_id| self.close_stream(*vb_id))).await;
        for (vb_id, result) in removed.iter().zip(close_results) {
            if let Err(e) = result {
                warn!(vb_id, error = %e, "stream close failed during rebalance");
            }
        }

        let open_results = join_all(added.iter().map(|vb_id| self.open_stream(*vb_id))).await;
        for (vb_id, result) in added.iter().zip(open_results) {
            if let Err(e) = result {
                warn!(vb_id, error = %e, "stream open failed during rebalance");
            }
        }

        info!("rebalance finished");
    }

    /// Opens one stream from the ledger offset. A server rollback reported
    /// by the client resets the ledger entry onto the rollback seqno.
    async fn open_stream(&self, vb_id: VbId) -> Result<(), DcpError> {
        self.open_streams.lock().insert(vb_id, StreamState::Opening);

        let offset = self.ledger.get(vb_id).unwrap_or_default();
        let observer = match self.observer() {
            Ok(observer) => observer,
            Err(e) => {
                self.open_streams.lock().remove(&vb_id);
                return Err(e);
            }
        };

        match self
            .client
            .open_stream(vb_id, &offset, self.filter.as_ref(), &observer)
            .await
        {
            Ok(outcome) => {
                if let Some(seq_no) = outcome.rolled_back_to {
                    self.ledger.set(vb_id, Offset::at(0, seq_no), true);
                }
                self.failed_vbuckets.lock().remove(&vb_id);
                self.open_streams.lock().insert(vb_id, StreamState::Open);
                debug!(vb_id, seq_no = offset.seq_no, "stream opened");
                Ok(())
            }
            Err(e) => {
                self.open_streams.lock().remove(&vb_id);
                Err(e)
            }
        }
    }

    /// Closes one stream and forgets its handle.
    async fn close_stream(&self, vb_id: VbId) -> Result<(), DcpError> {
        self.open_streams.lock().insert(vb_id, StreamState::Closing);
        let result = self.client.close_stream(vb_id).await;
        self.open_streams.lock().remove(&vb_id);
        result
    }

    /// Persists the current offsets through the checkpoint manager.
    pub async fn save(&self) {
        self.checkpoint.save().await;
    }

    /// Closes every stream and stops the schedulers. With `graceful`, a
    /// final save runs after the streams are down.
    pub async fn close(&self, graceful: bool) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(token) = self.membership_task.lock().take() {
            token.cancel();
        }
        self.checkpoint.stop_schedule();

        let open: Vec<VbId> = self.open_streams.lock().keys().copied().collect();
        let results = join_all(open.iter().map(|vb_id| self.close_stream(*vb_id))).await;
        for (vb_id, result) in open.iter().zip(results) {
            if let Err(e) = result {
                warn!(vb_id, error = %e, "stream close failed during shutdown");
            }
        }

        if graceful {
            self.checkpoint.save().await;
        }

        info!(graceful, "dcp stream closed");
    }

    /// Consumes `membership.changed` events one at a time; each event
    /// updates the stored membership and runs one rebalance, so rebalances
    /// never overlap.
    fn start_membership_listener(&self) {
        let Some(mut events) = self.membership_events.lock().take() else {
            return;
        };
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };

        let token = CancellationToken::new();
        *self.membership_task.lock() = Some(token.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(BusEvent::MembershipChanged(membership)) => {
                            if !membership.is_valid() {
                                warn!(membership = %membership, "ignoring invalid membership");
                                continue;
                            }
                            info!(membership = %membership, "membership changed");
                            *engine.membership.lock() = membership;
                            engine.rebalance().await;
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Current membership assignment.
    #[must_use]
    pub fn membership(&self) -> Membership {
        *self.membership.lock()
    }

    /// Number of streams currently tracked as open(ing).
    #[must_use]
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.lock().len()
    }

    /// vBuckets with a tracked stream, sorted.
    #[must_use]
    pub fn open_vbuckets(&self) -> Vec<VbId> {
        let mut ids: Vec<VbId> = self.open_streams.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cached failover log of one vBucket.
    #[must_use]
    pub fn failover_logs(&self, vb_id: VbId) -> Vec<FailoverEntry> {
        self.failover_logs
            .lock()
            .get(&vb_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ledger snapshot for observability.
    #[must_use]
    pub fn offset_snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Delivers one event to the listener; the offset advances only when
    /// the listener succeeds. After a failure the vBucket's delivery is
    /// suspended until its stream reopens, so the offset never moves past
    /// the failed event and it is re-delivered after reconnect.
    fn deliver(&self, event: DcpEvent) {
        let vb_id = event.vb_id();
        let seq_no = event.seq_no();
        if self.failed_vbuckets.lock().contains(&vb_id) {
            debug!(vb_id, seq_no, "dropping event, vbucket suspended after listener failure");
            return;
        }
        match self.listener.on_event(event) {
            Ok(()) => self.ledger.advance(vb_id, seq_no),
            Err(e) => {
                self.failed_vbuckets.lock().insert(vb_id);
                warn!(vb_id, seq_no, error = %e, "listener failed, offset not advanced");
            }
        }
    }
}

impl StreamObserver for StreamEngine {
    fn snapshot_marker(&self, vb_id: VbId, marker: SnapshotMarker) {
        self.ledger.mark_snapshot(vb_id, marker);
    }

    fn mutation(&self, mutation: Mutation) {
        self.deliver(DcpEvent::Mutation(mutation));
    }

    fn deletion(&self, deletion: Deletion) {
        self.deliver(DcpEvent::Deletion(deletion));
    }

    fn expiration(&self, expiration: Expiration) {
        self.deliver(DcpEvent::Expiration(expiration));
    }

    fn stream_end(&self, vb_id: VbId, reason: StreamEndReason) {
        self.open_streams.lock().remove(&vb_id);
        match reason {
            StreamEndReason::StateChanged => {
                // The vBucket moved server-side; the next rebalance decides
                // whether this member still owns it.
                info!(vb_id, "stream ended, vbucket state changed");
            }
            reason => debug!(vb_id, ?reason, "stream ended"),
        }
    }

    fn set_failover_logs(&self, vb_id: VbId, entries: Vec<FailoverEntry>) {
        self.failover_logs.lock().insert(vb_id, entries);
    }
}
