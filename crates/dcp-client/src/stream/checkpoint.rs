//! Checkpoint manager.
//!
//! Moves offsets between the [`OffsetLedger`] and the [`Metadata`] backend:
//! one load at startup (with the auto-reset-to-latest policy for empty
//! state), periodic saves on a timer in auto mode, and a final save on
//! graceful close. Save failures are logged and retried on the next tick;
//! load failures are fatal.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::ClusterClient;
use crate::config::{CheckpointAutoReset, CheckpointConfig, CheckpointKind};
use crate::error::DcpError;
use crate::metadata::Metadata;
use crate::models::{CheckpointDocument, Offset, VbId};
use crate::stream::offsets::OffsetLedger;

/// Reads and writes checkpoints through the metadata backend.
pub struct CheckpointManager {
    config: CheckpointConfig,
    client: Arc<ClusterClient>,
    metadata: Arc<dyn Metadata>,
    ledger: Arc<OffsetLedger>,
    bucket_uuid: String,
    vb_ids: Vec<VbId>,
    save_lock: Mutex<()>,
    load_lock: Mutex<()>,
    schedule: SyncMutex<Option<CancellationToken>>,
}

impl CheckpointManager {
    /// Creates a manager covering `vb_ids` (the full vBucket space, so
    /// rebalance-acquired vBuckets already have ledger entries).
    #[must_use]
    pub fn new(
        config: CheckpointConfig,
        client: Arc<ClusterClient>,
        metadata: Arc<dyn Metadata>,
        ledger: Arc<OffsetLedger>,
        bucket_uuid: String,
        vb_ids: Vec<VbId>,
    ) -> Self {
        Self {
            config,
            client,
            metadata,
            ledger,
            bucket_uuid,
            vb_ids,
            save_lock: Mutex::new(()),
            load_lock: Mutex::new(()),
            schedule: SyncMutex::new(None),
        }
    }

    /// Loads persisted offsets into the ledger. Called once at startup.
    ///
    /// With no usable persisted state and `auto_reset = latest`, offsets
    /// are initialized to each vBucket's current server seqno (branch from
    /// the failover-log head, or `0` when unavailable); vBuckets with a
    /// non-zero seqno start dirty so the reset position is persisted.
    ///
    /// # Errors
    ///
    /// Backend or topology failures during load are fatal.
    pub async fn load(&self) -> Result<(), DcpError> {
        let _guard = self.load_lock.lock().await;

        let (docs, existed) = self
            .metadata
            .load(&self.vb_ids, &self.bucket_uuid)
            .await?;
        info!(vbuckets = self.vb_ids.len(), existed, "loaded checkpoint");

        if !existed && self.config.auto_reset == CheckpointAutoReset::Latest {
            info!("no checkpoint found, auto reset checkpoint to latest");
            return self.reset_to_latest().await;
        }

        let mut offsets = HashMap::with_capacity(docs.len());
        let mut dirty = HashMap::with_capacity(docs.len());
        for (vb_id, doc) in &docs {
            offsets.insert(*vb_id, doc.to_offset());
            dirty.insert(*vb_id, false);
        }
        self.ledger.install(offsets, dirty);
        Ok(())
    }

    async fn reset_to_latest(&self) -> Result<(), DcpError> {
        let seq_nos = self.client.get_vbucket_seqnos().await?;

        let heads = join_all(self.vb_ids.iter().map(|vb_id| async {
            let head = match self.client.get_failover_logs(*vb_id).await {
                Ok(entries) => entries.first().map_or(0, |e| e.vb_uuid),
                Err(_) => 0,
            };
            (*vb_id, head)
        }))
        .await;
        let heads: HashMap<VbId, u64> = heads.into_iter().collect();

        let mut offsets = HashMap::with_capacity(self.vb_ids.len());
        let mut dirty = HashMap::with_capacity(self.vb_ids.len());
        for vb_id in &self.vb_ids {
            let current = seq_nos.get(vb_id).copied().unwrap_or(0);
            let vb_uuid = heads.get(vb_id).copied().unwrap_or(0);
            offsets.insert(*vb_id, Offset::at(vb_uuid, current));
            dirty.insert(*vb_id, current != 0);
        }
        self.ledger.install(offsets, dirty);
        Ok(())
    }

    /// Persists the dirty subset of the ledger. Never fails the caller:
    /// backend errors are logged and the dirty flags kept, so the next
    /// tick retries.
    pub async fn save(&self) {
        let _guard = self.save_lock.lock().await;

        let snapshot = self.ledger.snapshot();
        if !snapshot.any_dirty {
            debug!("no need to save checkpoint");
            return;
        }

        let docs: HashMap<VbId, CheckpointDocument> = snapshot
            .offsets
            .iter()
            .map(|(vb_id, offset)| {
                (*vb_id, CheckpointDocument::from_offset(offset, &self.bucket_uuid))
            })
            .collect();

        match self
            .metadata
            .save(&docs, &snapshot.dirty, &self.bucket_uuid)
            .await
        {
            Ok(()) => {
                self.ledger.unmark_dirty(&snapshot);
                debug!("saved checkpoint");
            }
            Err(e) => error!(error = %e, "error while saving checkpoint document"),
        }
    }

    /// Starts the periodic save loop (auto mode only).
    pub fn start_schedule(self: Arc<Self>) {
        if self.config.kind != CheckpointKind::Auto {
            return;
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.schedule.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => manager.save().await,
                }
            }
        });

        info!("started checkpoint schedule");
    }

    /// Stops the periodic save loop. Idempotent; an in-flight save always
    /// runs to completion.
    pub fn stop_schedule(&self) {
        if let Some(token) = self.schedule.lock().take() {
            token.cancel();
            info!("stopped checkpoint schedule");
        }
    }

    /// Deletes every known checkpoint document. Operator-only; the engine
    /// never calls this itself.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn clear(&self) -> Result<(), DcpError> {
        self.metadata.clear(&self.vb_ids).await?;
        info!("cleared checkpoint");
        Ok(())
    }
}
