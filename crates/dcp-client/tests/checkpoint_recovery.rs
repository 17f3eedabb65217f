//! Checkpoint persistence and recovery: restart equality, cluster-backed
//! round-trips, no-op saves, the bucket-UUID guard, and the health-check
//! driven graceful shutdown with a final save.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use dcp_client::cluster::ClusterClient;
use dcp_client::config::{CheckpointKind, MetadataKind};
use dcp_client::metadata::{checkpoint_key, CouchbaseMetadata, FileMetadata, Metadata};
use dcp_client::models::{CheckpointDocument, Offset, SnapshotMarker, VbId};
use dcp_client::stream::{CheckpointManager, OffsetLedger};
use dcp_client::testing::{CollectingListener, MockCluster, ScriptedEvent};
use dcp_client::{Dcp, DcpConfig, Listener, ShutdownCause};

const BUCKET_UUID: &str = "bucket-uuid-1";

fn base_config() -> DcpConfig {
    let mut config = DcpConfig::default();
    config.hosts = vec!["mock:8091".into()];
    config.bucket_name = "orders".into();
    config.dcp.group.name = "group-1".into();
    config.health_check.disabled = true;
    config
}

fn file_config(dir: &Path) -> DcpConfig {
    let mut config = base_config();
    config.metadata.kind = MetadataKind::File;
    config.metadata.file_path = Some(dir.join("checkpoints.json"));
    config
}

async fn connected_client(mock: &MockCluster, config: &Arc<DcpConfig>) -> Arc<ClusterClient> {
    let client = Arc::new(ClusterClient::new(
        Arc::clone(config),
        Arc::new(mock.clone()),
    ));
    client.connect().await.unwrap();
    client.dcp_connect().await.unwrap();
    client
}

fn manager_over(
    config: &Arc<DcpConfig>,
    client: Arc<ClusterClient>,
    metadata: Arc<dyn Metadata>,
    ledger: Arc<OffsetLedger>,
    vbuckets: u16,
) -> CheckpointManager {
    CheckpointManager::new(
        config.checkpoint.clone(),
        client,
        metadata,
        ledger,
        BUCKET_UUID.to_string(),
        (0..vbuckets).collect(),
    )
}

#[tokio::test]
async fn save_then_restart_restores_identical_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(8, BUCKET_UUID);
    let config = Arc::new(file_config(dir.path()));
    let client = connected_client(&mock, &config).await;
    let metadata = Arc::new(FileMetadata::new(dir.path().join("checkpoints.json")));

    let ledger = Arc::new(OffsetLedger::new());
    let manager = manager_over(
        &config,
        Arc::clone(&client),
        Arc::clone(&metadata) as Arc<dyn Metadata>,
        Arc::clone(&ledger),
        8,
    );
    manager.load().await.unwrap();

    for vb in 0u16..8 {
        ledger.set(
            vb,
            Offset {
                vb_uuid: 0x10 + u64::from(vb),
                seq_no: u64::from(vb) * 100 + 7,
                snapshot: SnapshotMarker {
                    start_seq_no: u64::from(vb) * 100,
                    end_seq_no: u64::from(vb) * 100 + 50,
                },
            },
            true,
        );
    }
    let saved = ledger.snapshot();
    manager.save().await;
    assert!(!ledger.snapshot().any_dirty, "successful save clears dirt");

    // Restart: a fresh ledger and manager over the same backend.
    let restarted = Arc::new(OffsetLedger::new());
    let manager = manager_over(
        &config,
        client,
        metadata,
        Arc::clone(&restarted),
        8,
    );
    manager.load().await.unwrap();

    let recovered = restarted.snapshot();
    for vb in 0u16..8 {
        assert_eq!(recovered.offsets[&vb], saved.offsets[&vb], "vb {vb}");
        assert!(!recovered.dirty[&vb]);
    }
    assert!(!recovered.any_dirty);
}

#[tokio::test]
async fn cluster_metadata_round_trips_documents() {
    let mock = MockCluster::new(4, BUCKET_UUID);
    let config = Arc::new(base_config());
    let client = connected_client(&mock, &config).await;
    let metadata = CouchbaseMetadata::new(client, "_connector:cbgo:".into(), "group-1".into());

    let docs: HashMap<VbId, CheckpointDocument> = (0u16..4)
        .map(|vb| {
            let offset = Offset {
                vb_uuid: 0xBEEF + u64::from(vb),
                seq_no: u64::from(vb) + 1,
                snapshot: SnapshotMarker {
                    start_seq_no: u64::from(vb),
                    end_seq_no: u64::from(vb) + 2,
                },
            };
            (vb, CheckpointDocument::from_offset(&offset, BUCKET_UUID))
        })
        .collect();
    let dirty: HashMap<VbId, bool> = (0u16..4).map(|vb| (vb, true)).collect();

    metadata.save(&docs, &dirty, BUCKET_UUID).await.unwrap();
    assert_eq!(mock.document_count(), 4);

    // Documents land under the CRC-suffixed key format.
    let key = checkpoint_key("_connector:cbgo:", "group-1", 0);
    let body = mock.document(key.as_bytes()).expect("vb 0 document");
    let stored: CheckpointDocument = serde_json::from_slice(&body).unwrap();
    assert_eq!(stored, docs[&0]);

    let (loaded, existed) = metadata.load(&[0, 1, 2, 3], BUCKET_UUID).await.unwrap();
    assert!(existed);
    assert_eq!(loaded, docs);
}

#[tokio::test]
async fn save_without_dirty_offsets_writes_nothing() {
    let mock = MockCluster::new(4, BUCKET_UUID);
    let config = Arc::new(base_config());
    let client = connected_client(&mock, &config).await;
    let metadata = Arc::new(CouchbaseMetadata::new(
        Arc::clone(&client),
        "_connector:cbgo:".into(),
        "group-1".into(),
    ));

    let ledger = Arc::new(OffsetLedger::new());
    let manager = manager_over(&config, client, metadata, Arc::clone(&ledger), 4);
    manager.load().await.unwrap();

    // Nothing dirty yet: no writes at all.
    manager.save().await;
    assert_eq!(mock.kv_set_call_count(), 0);

    ledger.advance(1, 11);
    ledger.advance(3, 13);
    manager.save().await;
    assert_eq!(mock.kv_set_call_count(), 2, "only the dirty subset is written");

    // No mutation in between: the second save is a no-op.
    manager.save().await;
    assert_eq!(mock.kv_set_call_count(), 2);
}

#[tokio::test]
async fn bucket_uuid_mismatch_loads_as_empty_state() {
    let mock = MockCluster::new(2, BUCKET_UUID);
    let config = Arc::new(base_config());
    let client = connected_client(&mock, &config).await;
    let metadata = CouchbaseMetadata::new(client, "_connector:cbgo:".into(), "group-1".into());

    let offset = Offset::at(7, 99);
    let docs: HashMap<VbId, CheckpointDocument> =
        [(0u16, CheckpointDocument::from_offset(&offset, "old-bucket"))].into();
    let dirty: HashMap<VbId, bool> = [(0u16, true)].into();
    metadata.save(&docs, &dirty, "old-bucket").await.unwrap();

    let (loaded, existed) = metadata.load(&[0, 1], BUCKET_UUID).await.unwrap();
    assert!(!existed, "stale documents must not count as state");
    assert_eq!(loaded[&0], CheckpointDocument::empty(BUCKET_UUID));
    assert_eq!(loaded[&1], CheckpointDocument::empty(BUCKET_UUID));
}

/// A Manual-mode client with one delivered mutation on vb 0, ready to be
/// committed or closed.
async fn manual_client_with_dirty_offset(dir: &Path, mock: &MockCluster) -> Dcp {
    mock.script_events(
        0,
        vec![
            ScriptedEvent::Marker(SnapshotMarker {
                start_seq_no: 1,
                end_seq_no: 1,
            }),
            ScriptedEvent::Mutation {
                seq_no: 1,
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"{}"),
            },
        ],
    );

    let mut config = file_config(dir);
    config.checkpoint.kind = CheckpointKind::Manual;

    let listener = Arc::new(CollectingListener::new());
    let mut dcp = Dcp::connect(config, Arc::clone(&listener) as Arc<dyn Listener>, Arc::new(mock.clone()))
        .await
        .unwrap();
    dcp.start().await.unwrap();

    for _ in 0..200 {
        if !listener.delivered_for(0).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listener.delivered_for(0), vec![1]);
    dcp
}

#[tokio::test]
async fn manual_checkpointing_does_not_save_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoints.json");
    let mock = MockCluster::new(2, BUCKET_UUID);
    let mut dcp = manual_client_with_dirty_offset(dir.path(), &mock).await;

    // Close with an uncommitted dirty offset: manual mode must not write.
    dcp.close().await;
    assert!(!checkpoint_path.exists(), "close must not save in manual mode");
    assert!(mock.open_streams().is_empty());
}

#[tokio::test]
async fn manual_checkpointing_saves_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoints.json");
    let mock = MockCluster::new(2, BUCKET_UUID);
    let mut dcp = manual_client_with_dirty_offset(dir.path(), &mock).await;

    dcp.commit().await;
    let metadata = FileMetadata::new(checkpoint_path);
    let (docs, existed) = metadata.load(&[0], BUCKET_UUID).await.unwrap();
    assert!(existed);
    assert_eq!(docs[&0].checkpoint.seq_no, 1);

    dcp.close().await;
    let (docs, _) = metadata.load(&[0], BUCKET_UUID).await.unwrap();
    assert_eq!(docs[&0].checkpoint.seq_no, 1);
}

#[tokio::test]
async fn health_check_failure_triggers_graceful_shutdown_with_final_save() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(2, BUCKET_UUID);
    mock.fail_pings(u32::MAX);
    mock.script_events(
        0,
        vec![
            ScriptedEvent::Marker(SnapshotMarker {
                start_seq_no: 1,
                end_seq_no: 2,
            }),
            ScriptedEvent::Mutation {
                seq_no: 1,
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"{}"),
            },
            ScriptedEvent::Mutation {
                seq_no: 2,
                key: Bytes::from_static(b"b"),
                value: Bytes::from_static(b"{}"),
            },
        ],
    );

    let mut config = file_config(dir.path());
    config.health_check.disabled = false;
    config.health_check.interval = Duration::from_millis(20);
    config.health_check.timeout = Duration::from_millis(200);
    config.health_check.attempts = 5;

    let listener = Arc::new(CollectingListener::new());
    let mut dcp = Dcp::connect(config, Arc::clone(&listener) as Arc<dyn Listener>, Arc::new(mock.clone()))
        .await
        .unwrap();
    dcp.start().await.unwrap();

    let cause = dcp.wait_for_shutdown().await.unwrap();
    assert_eq!(cause, ShutdownCause::HealthCheckFailed);
    dcp.close().await;

    // Streams are down and the final save captured the processed events.
    assert!(mock.open_streams().is_empty());
    let metadata = FileMetadata::new(dir.path().join("checkpoints.json"));
    let (docs, existed) = metadata.load(&[0], BUCKET_UUID).await.unwrap();
    assert!(existed);
    assert_eq!(docs[&0].checkpoint.seq_no, 2);
}
