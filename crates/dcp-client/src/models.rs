//! Core value types: stream offsets, persisted checkpoint documents, and
//! the DCP events delivered to the application listener.
//!
//! [`Offset`] is the in-memory resume position of one vBucket. Its persisted
//! form is [`CheckpointDocument`], whose JSON field names are part of the
//! on-disk/on-cluster wire format and must not change.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::DcpError;

/// A vBucket identifier (hash partition of the key space).
pub type VbId = u16;

/// A DCP sequence number.
pub type SeqNo = u64;

/// Identifier of a vBucket history branch; changes on failover.
pub type VbUuid = u64;

/// The highest representable sequence number; streams are opened to this
/// end so they never terminate on their own.
pub const SEQ_NO_MAX: SeqNo = 0xFFFF_FFFF_FFFF_FFFF;

/// A server-declared `[start, end]` window of upcoming mutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotMarker {
    /// First sequence number covered by the snapshot.
    pub start_seq_no: SeqNo,
    /// Last sequence number covered by the snapshot.
    pub end_seq_no: SeqNo,
}

impl SnapshotMarker {
    /// A degenerate single-point window at `seq_no`.
    #[must_use]
    pub const fn at(seq_no: SeqNo) -> Self {
        Self {
            start_seq_no: seq_no,
            end_seq_no: seq_no,
        }
    }
}

/// Resume position of a single vBucket.
///
/// Invariant: `snapshot.start_seq_no <= seq_no <= snapshot.end_seq_no`
/// whenever the offset came from a live stream; freshly reset offsets use a
/// single-point snapshot window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Offset {
    /// History branch the position belongs to. `0` asks the server to pick
    /// the current branch.
    pub vb_uuid: VbUuid,
    /// Last successfully processed sequence number.
    pub seq_no: SeqNo,
    /// Snapshot window the position lies in.
    pub snapshot: SnapshotMarker,
}

impl Offset {
    /// Position at `seq_no` on branch `vb_uuid` with a single-point window.
    #[must_use]
    pub const fn at(vb_uuid: VbUuid, seq_no: SeqNo) -> Self {
        Self {
            vb_uuid,
            seq_no,
            snapshot: SnapshotMarker::at(seq_no),
        }
    }
}

/// Persisted checkpoint for one vBucket.
///
/// Serialized form (cluster mode: one document per vBucket; file mode: one
/// entry in a JSON map):
///
/// ```json
/// {"checkpoint":{"vbUUID":0,"seqNo":0,"snapshot":{"startSeqNo":0,"endSeqNo":0}},"bucketUUID":""}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    /// The stream position.
    pub checkpoint: CheckpointMark,
    /// UUID of the source bucket the position was taken from. Guards
    /// against resuming onto a recreated bucket with a colliding name.
    #[serde(rename = "bucketUUID")]
    pub bucket_uuid: String,
}

/// Position payload of a [`CheckpointDocument`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMark {
    /// History branch.
    #[serde(rename = "vbUUID")]
    pub vb_uuid: VbUuid,
    /// Last processed sequence number.
    #[serde(rename = "seqNo")]
    pub seq_no: SeqNo,
    /// Snapshot window.
    pub snapshot: CheckpointSnapshot,
}

/// Snapshot window payload of a [`CheckpointMark`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Window start.
    #[serde(rename = "startSeqNo")]
    pub start_seq_no: SeqNo,
    /// Window end.
    #[serde(rename = "endSeqNo")]
    pub end_seq_no: SeqNo,
}

impl CheckpointDocument {
    /// Builds the persisted form of `offset` stamped with `bucket_uuid`.
    #[must_use]
    pub fn from_offset(offset: &Offset, bucket_uuid: &str) -> Self {
        Self {
            checkpoint: CheckpointMark {
                vb_uuid: offset.vb_uuid,
                seq_no: offset.seq_no,
                snapshot: CheckpointSnapshot {
                    start_seq_no: offset.snapshot.start_seq_no,
                    end_seq_no: offset.snapshot.end_seq_no,
                },
            },
            bucket_uuid: bucket_uuid.to_string(),
        }
    }

    /// Zero-value document for vBuckets with no stored state.
    #[must_use]
    pub fn empty(bucket_uuid: &str) -> Self {
        Self {
            checkpoint: CheckpointMark::default(),
            bucket_uuid: bucket_uuid.to_string(),
        }
    }

    /// Reconstructs the in-memory offset.
    #[must_use]
    pub fn to_offset(&self) -> Offset {
        Offset {
            vb_uuid: self.checkpoint.vb_uuid,
            seq_no: self.checkpoint.seq_no,
            snapshot: SnapshotMarker {
                start_seq_no: self.checkpoint.snapshot.start_seq_no,
                end_seq_no: self.checkpoint.snapshot.end_seq_no,
            },
        }
    }
}

/// A document mutation streamed from the source bucket.
///
/// The value is an opaque byte slice; deserialization is the listener's
/// concern.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// vBucket the document lives in.
    pub vb_id: VbId,
    /// Sequence number of the mutation.
    pub seq_no: SeqNo,
    /// Compare-and-swap value at mutation time.
    pub cas: u64,
    /// Collection the document belongs to.
    pub collection_id: u32,
    /// Document key.
    pub key: Bytes,
    /// Document body.
    pub value: Bytes,
    /// Server-side format flags.
    pub flags: u32,
    /// Expiry as a unix timestamp, `0` for none.
    pub expiry: u32,
}

/// A document deletion streamed from the source bucket.
#[derive(Debug, Clone)]
pub struct Deletion {
    /// vBucket the document lived in.
    pub vb_id: VbId,
    /// Sequence number of the deletion.
    pub seq_no: SeqNo,
    /// Compare-and-swap value of the tombstone.
    pub cas: u64,
    /// Collection the document belonged to.
    pub collection_id: u32,
    /// Document key.
    pub key: Bytes,
}

/// A document expiration streamed from the source bucket.
#[derive(Debug, Clone)]
pub struct Expiration {
    /// vBucket the document lived in.
    pub vb_id: VbId,
    /// Sequence number of the expiration.
    pub seq_no: SeqNo,
    /// Compare-and-swap value of the tombstone.
    pub cas: u64,
    /// Collection the document belonged to.
    pub collection_id: u32,
    /// Document key.
    pub key: Bytes,
}

/// A change event delivered to the application [`Listener`].
#[derive(Debug, Clone)]
pub enum DcpEvent {
    /// Document created or updated.
    Mutation(Mutation),
    /// Document deleted.
    Deletion(Deletion),
    /// Document expired.
    Expiration(Expiration),
}

impl DcpEvent {
    /// vBucket the event belongs to.
    #[must_use]
    pub fn vb_id(&self) -> VbId {
        match self {
            Self::Mutation(m) => m.vb_id,
            Self::Deletion(d) => d.vb_id,
            Self::Expiration(e) => e.vb_id,
        }
    }

    /// Sequence number of the event.
    #[must_use]
    pub fn seq_no(&self) -> SeqNo {
        match self {
            Self::Mutation(m) => m.seq_no,
            Self::Deletion(d) => d.seq_no,
            Self::Expiration(e) => e.seq_no,
        }
    }

    /// Document key of the event.
    #[must_use]
    pub fn key(&self) -> &Bytes {
        match self {
            Self::Mutation(m) => &m.key,
            Self::Deletion(d) => &d.key,
            Self::Expiration(e) => &e.key,
        }
    }
}

/// Application callback receiving change events.
///
/// Delivery is at-least-once: an event whose handling fails is re-delivered
/// after the stream reconnects, so implementations must be idempotent.
/// Within a vBucket, events arrive in sequence-number order.
pub trait Listener: Send + Sync {
    /// Handles one change event. Returning an error leaves the vBucket
    /// offset un-advanced; the event will be delivered again.
    fn on_event(&self, event: DcpEvent) -> Result<(), DcpError>;
}

impl<F> Listener for F
where
    F: Fn(DcpEvent) -> Result<(), DcpError> + Send + Sync,
{
    fn on_event(&self, event: DcpEvent) -> Result<(), DcpError> {
        self(event)
    }
}
