//! End-to-end stream lifecycle against the in-memory cluster: fresh start
//! with auto-reset, resume from saved checkpoints, rollback recovery,
//! ordered delivery, listener failure, and rebalancing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use dcp_client::bus::{BusEvent, EventBus, MEMBERSHIP_CHANGED};
use dcp_client::cluster::ClusterClient;
use dcp_client::config::{CheckpointAutoReset, MetadataKind};
use dcp_client::metadata::{FileMetadata, Metadata};
use dcp_client::models::{
    CheckpointDocument, Offset, SnapshotMarker, VbId, SEQ_NO_MAX,
};
use dcp_client::stream::{CheckpointManager, OffsetLedger, StreamEngine, VBucketDiscovery};
use dcp_client::testing::{CollectingListener, MockCluster, ScriptedEvent};
use dcp_client::{Dcp, DcpConfig, Listener, Membership};

const BUCKET_UUID: &str = "bucket-uuid-1";

fn test_config(dir: &Path) -> DcpConfig {
    let mut config = DcpConfig::default();
    config.hosts = vec!["mock:8091".into()];
    config.bucket_name = "orders".into();
    config.dcp.group.name = "group-1".into();
    config.metadata.kind = MetadataKind::File;
    config.metadata.file_path = Some(dir.join("checkpoints.json"));
    config.health_check.disabled = true;
    config
}

/// Writes a checkpoint document for one vBucket straight through the file
/// backend, as a previous run would have.
async fn seed_checkpoint(dir: &Path, vb_id: VbId, offset: &Offset) {
    let metadata = FileMetadata::new(dir.join("checkpoints.json"));
    let docs: HashMap<VbId, CheckpointDocument> =
        [(vb_id, CheckpointDocument::from_offset(offset, BUCKET_UUID))].into();
    let dirty: HashMap<VbId, bool> = [(vb_id, true)].into();
    metadata.save(&docs, &dirty, BUCKET_UUID).await.unwrap();
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn fresh_start_auto_reset_latest_initializes_from_server_seqnos() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(4, BUCKET_UUID);
    mock.set_seq_no(0, 5);
    mock.set_seq_no(2, 12);
    mock.set_seq_no(3, 3);

    let mut config = test_config(dir.path());
    config.checkpoint.auto_reset = CheckpointAutoReset::Latest;

    let listener = Arc::new(CollectingListener::new());
    let mut dcp = Dcp::connect(config, listener, Arc::new(mock.clone()))
        .await
        .unwrap();
    dcp.start().await.unwrap();
    dcp.wait_until_ready().await;

    let engine = dcp.engine().unwrap();
    assert_eq!(engine.open_stream_count(), 4);

    let snapshot = engine.offset_snapshot();
    assert_eq!(snapshot.offsets[&0].seq_no, 5);
    assert_eq!(snapshot.offsets[&1].seq_no, 0);
    assert_eq!(snapshot.offsets[&2].seq_no, 12);
    assert_eq!(snapshot.offsets[&3].seq_no, 3);
    for vb in [0u16, 2, 3] {
        assert!(snapshot.dirty[&vb], "vb {vb} should start dirty");
        assert_eq!(
            snapshot.offsets[&vb].snapshot,
            SnapshotMarker::at(snapshot.offsets[&vb].seq_no)
        );
    }
    assert!(!snapshot.dirty[&1], "vb at seq 0 must not start dirty");
    assert!(snapshot.any_dirty);

    dcp.close().await;
}

#[tokio::test]
async fn resume_requests_stream_with_saved_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(4, BUCKET_UUID);

    seed_checkpoint(
        dir.path(),
        0,
        &Offset {
            vb_uuid: 0xAA,
            seq_no: 100,
            snapshot: SnapshotMarker {
                start_seq_no: 100,
                end_seq_no: 200,
            },
        },
    )
    .await;

    let listener = Arc::new(CollectingListener::new());
    let mut dcp = Dcp::connect(test_config(dir.path()), listener, Arc::new(mock.clone()))
        .await
        .unwrap();
    dcp.start().await.unwrap();

    let request = mock
        .open_stream_requests()
        .into_iter()
        .find(|r| r.vb_id == 0)
        .expect("stream for vb 0 must be requested");
    assert_eq!(request.vb_uuid, 0xAA);
    assert_eq!(request.start_seq_no, 100);
    assert_eq!(request.end_seq_no, SEQ_NO_MAX);
    assert_eq!(request.snap_start_seq_no, 100);
    assert_eq!(request.snap_end_seq_no, 200);

    dcp.close().await;
}

#[tokio::test]
async fn rollback_reopens_from_server_seqno_and_resets_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(8, BUCKET_UUID);
    mock.script_rollback(7, 42);

    seed_checkpoint(
        dir.path(),
        7,
        &Offset {
            vb_uuid: 0xAA,
            seq_no: 100,
            snapshot: SnapshotMarker {
                start_seq_no: 100,
                end_seq_no: 100,
            },
        },
    )
    .await;

    let listener = Arc::new(CollectingListener::new());
    let mut dcp = Dcp::connect(test_config(dir.path()), listener, Arc::new(mock.clone()))
        .await
        .unwrap();
    dcp.start().await.unwrap();

    let requests: Vec<_> = mock
        .open_stream_requests()
        .into_iter()
        .filter(|r| r.vb_id == 7)
        .collect();
    assert_eq!(requests.len(), 2, "failed open plus rollback re-open");
    assert_eq!(requests[0].vb_uuid, 0xAA);
    assert_eq!(requests[0].start_seq_no, 100);
    assert_eq!(requests[1].vb_uuid, 0);
    assert_eq!(requests[1].start_seq_no, 42);
    assert_eq!(requests[1].snap_start_seq_no, 42);
    assert_eq!(requests[1].snap_end_seq_no, 42);

    let snapshot = dcp.engine().unwrap().offset_snapshot();
    assert_eq!(snapshot.offsets[&7].vb_uuid, 0);
    assert_eq!(snapshot.offsets[&7].seq_no, 42);
    assert!(snapshot.dirty[&7]);

    dcp.close().await;
}

#[tokio::test]
async fn events_are_delivered_in_order_and_advance_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(2, BUCKET_UUID);
    mock.script_events(
        0,
        vec![
            ScriptedEvent::Marker(SnapshotMarker {
                start_seq_no: 1,
                end_seq_no: 3,
            }),
            ScriptedEvent::Mutation {
                seq_no: 1,
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"{}"),
            },
            ScriptedEvent::Deletion {
                seq_no: 2,
                key: Bytes::from_static(b"b"),
            },
            ScriptedEvent::Mutation {
                seq_no: 3,
                key: Bytes::from_static(b"c"),
                value: Bytes::from_static(b"{}"),
            },
        ],
    );

    let listener = Arc::new(CollectingListener::new());
    let mut dcp = Dcp::connect(
        test_config(dir.path()),
        Arc::clone(&listener) as Arc<dyn Listener>,
        Arc::new(mock.clone()),
    )
    .await
    .unwrap();
    dcp.start().await.unwrap();

    wait_until(|| listener.delivered_for(0).len() == 3, "event delivery").await;
    assert_eq!(listener.delivered_for(0), vec![1, 2, 3]);

    let snapshot = dcp.engine().unwrap().offset_snapshot();
    assert_eq!(snapshot.offsets[&0].seq_no, 3);
    assert_eq!(
        snapshot.offsets[&0].snapshot,
        SnapshotMarker {
            start_seq_no: 1,
            end_seq_no: 3,
        }
    );
    assert!(snapshot.dirty[&0]);

    dcp.close().await;
}

#[tokio::test]
async fn listener_failure_stops_offset_advancement() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(1, BUCKET_UUID);
    mock.script_events(
        0,
        vec![
            ScriptedEvent::Marker(SnapshotMarker {
                start_seq_no: 1,
                end_seq_no: 3,
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
            ScriptedEvent::Mutation {
                seq_no: 3,
                key: Bytes::from_static(b"c"),
                value: Bytes::from_static(b"{}"),
            },
        ],
    );

    let listener = Arc::new(CollectingListener::new());
    listener.reject_once(0, 2);

    let mut dcp = Dcp::connect(
        test_config(dir.path()),
        Arc::clone(&listener) as Arc<dyn Listener>,
        Arc::new(mock.clone()),
    )
    .await
    .unwrap();
    dcp.start().await.unwrap();

    wait_until(|| !listener.delivered_for(0).is_empty(), "first delivery").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Seq 1 was accepted; seq 2 failed, so neither 2 nor 3 may advance the
    // offset.
    assert_eq!(listener.delivered_for(0), vec![1]);
    let snapshot = dcp.engine().unwrap().offset_snapshot();
    assert_eq!(snapshot.offsets[&0].seq_no, 1);

    dcp.close().await;
}

#[tokio::test]
async fn rebalance_shrink_closes_unowned_streams() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockCluster::new(1024, BUCKET_UUID);
    let config = Arc::new(test_config(dir.path()));

    let client = Arc::new(ClusterClient::new(
        Arc::clone(&config),
        Arc::new(mock.clone()),
    ));
    client.connect().await.unwrap();
    client.dcp_connect().await.unwrap();

    let ledger = Arc::new(OffsetLedger::new());
    let metadata = Arc::new(FileMetadata::new(dir.path().join("checkpoints.json")));
    let checkpoint = Arc::new(CheckpointManager::new(
        config.checkpoint.clone(),
        Arc::clone(&client),
        metadata,
        Arc::clone(&ledger),
        BUCKET_UUID.to_string(),
        (0..1024).collect(),
    ));

    let bus = EventBus::new();
    let listener = Arc::new(CollectingListener::new());
    let engine = StreamEngine::new(
        &config,
        client,
        ledger,
        checkpoint,
        VBucketDiscovery::new(1024),
        listener,
        &HashMap::new(),
        &bus,
    );

    engine.open(Membership::SINGLE).await.unwrap();
    assert_eq!(engine.open_stream_count(), 1024);

    // A second member joins: this member keeps the first half.
    bus.publish(
        MEMBERSHIP_CHANGED,
        &BusEvent::MembershipChanged(Membership {
            member_number: 1,
            total_members: 2,
        }),
    );

    wait_until(|| engine.open_stream_count() == 512, "rebalance shrink").await;
    let expected: Vec<VbId> = (0..512).collect();
    assert_eq!(engine.open_vbuckets(), expected);
    assert_eq!(mock.open_streams(), expected);

    // Publishing the same membership again must not move anything.
    bus.publish(
        MEMBERSHIP_CHANGED,
        &BusEvent::MembershipChanged(Membership {
            member_number: 1,
            total_members: 2,
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.open_vbuckets(), expected);

    engine.close(true).await;
    assert_eq!(engine.open_stream_count(), 0);
}
