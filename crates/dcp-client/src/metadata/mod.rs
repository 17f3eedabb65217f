//! Checkpoint persistence backends.
//!
//! [`Metadata`] is the pluggable seam for durably storing per-vBucket
//! checkpoint documents. Two implementations ship with the crate:
//! [`CouchbaseMetadata`] (one KV document per vBucket on the cluster) and
//! [`FileMetadata`] (a single JSON map on the local filesystem), plus the
//! [`ReadOnlyMetadata`] decorator that silently drops writes.

mod couchbase;
mod file;

pub use couchbase::CouchbaseMetadata;
pub use file::FileMetadata;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DcpError;
use crate::models::{CheckpointDocument, VbId};

/// Derives the storage key of one vBucket's checkpoint document.
///
/// Format: `{prefix}{group}:checkpoint:{vb_id}#{crc32(hex(vb_id)):08x}`.
/// The CRC suffix spreads keys across the cluster's hash partitions so the
/// dirty-subset writes of a save can proceed in parallel.
#[must_use]
pub fn checkpoint_key(prefix: &str, group_name: &str, vb_id: VbId) -> String {
    let crc = crc32fast::hash(format!("{vb_id:x}").as_bytes());
    format!("{prefix}{group_name}:checkpoint:{vb_id}#{crc:08x}")
}

/// `true` when `key` belongs to this client's metadata key space.
///
/// Lets listeners that stream the metadata bucket itself recognize and skip
/// the client's own bookkeeping documents.
#[must_use]
pub fn is_checkpoint_key(key: &[u8], prefix: &str) -> bool {
    key.starts_with(prefix.as_bytes())
}

/// Durable store for per-vBucket checkpoint documents.
///
/// Implementations may persist only the dirty subset on save, but must
/// present load as if a full map were stored: vBuckets without state (or
/// whose stored `bucketUUID` does not match the live one) come back as
/// zero-value documents. Save is atomic per vBucket, not across vBuckets.
#[async_trait]
pub trait Metadata: Send + Sync {
    /// Persists `docs`, at minimum the subset flagged in `dirty`.
    async fn save(
        &self,
        docs: &HashMap<VbId, CheckpointDocument>,
        dirty: &HashMap<VbId, bool>,
        bucket_uuid: &str,
    ) -> Result<(), DcpError>;

    /// Loads documents for `vb_ids`. The returned map covers every
    /// requested vBucket; `existed` reports whether any usable state was
    /// found.
    async fn load(
        &self,
        vb_ids: &[VbId],
        bucket_uuid: &str,
    ) -> Result<(HashMap<VbId, CheckpointDocument>, bool), DcpError>;

    /// Deletes the documents of `vb_ids`. Missing documents are not an
    /// error.
    async fn clear(&self, vb_ids: &[VbId]) -> Result<(), DcpError>;
}

/// Decorator that drops `save`/`clear` and delegates `load`.
pub struct ReadOnlyMetadata {
    inner: Arc<dyn Metadata>,
}

impl ReadOnlyMetadata {
    /// Wraps `inner`, making it read-only.
    #[must_use]
    pub fn new(inner: Arc<dyn Metadata>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Metadata for ReadOnlyMetadata {
    async fn save(
        &self,
        _docs: &HashMap<VbId, CheckpointDocument>,
        _dirty: &HashMap<VbId, bool>,
        _bucket_uuid: &str,
    ) -> Result<(), DcpError> {
        Ok(())
    }

    async fn load(
        &self,
        vb_ids: &[VbId],
        bucket_uuid: &str,
    ) -> Result<(HashMap<VbId, CheckpointDocument>, bool), DcpError> {
        self.inner.load(vb_ids, bucket_uuid).await
    }

    async fn clear(&self, _vb_ids: &[VbId]) -> Result<(), DcpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_key_format() {
        let key = checkpoint_key("_connector:cbgo:", "group-1", 0);
        let crc = crc32fast::hash(b"0");
        assert_eq!(key, format!("_connector:cbgo:group-1:checkpoint:0#{crc:08x}"));
    }

    #[test]
    fn test_checkpoint_key_hex_input() {
        // vBucket 255 hashes its hex form "ff", not "255".
        let key = checkpoint_key("p:", "g", 255);
        let crc = crc32fast::hash(b"ff");
        assert!(key.ends_with(&format!("255#{crc:08x}")));
    }

    #[test]
    fn test_checkpoint_keys_are_distinct() {
        let mut keys: Vec<String> = (0u16..1024)
            .map(|vb| checkpoint_key("p:", "g", vb))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 1024);
    }

    #[test]
    fn test_is_checkpoint_key() {
        assert!(is_checkpoint_key(b"_connector:cbgo:g:checkpoint:0#0", "_connector:cbgo:"));
        assert!(!is_checkpoint_key(b"orders:1234", "_connector:cbgo:"));
    }
}
