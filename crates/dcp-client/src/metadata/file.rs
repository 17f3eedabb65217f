//! Filesystem-backed checkpoint storage: a single JSON map.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Metadata;
use crate::error::DcpError;
use crate::models::{CheckpointDocument, VbId};

/// Stores all checkpoint documents in one JSON file
/// (`{vb_id: CheckpointDocument}`), replaced atomically on save.
pub struct FileMetadata {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileMetadata {
    /// Creates a backend persisting to `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: Mutex::new(()),
        }
    }

    /// Reads the stored map; a missing file is an empty map.
    async fn read_map(&self) -> Result<HashMap<VbId, CheckpointDocument>, DcpError> {
        match tokio::fs::read(&self.path).await {
            Ok(body) => {
                serde_json::from_slice(&body).map_err(|e| DcpError::MetadataIo(e.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(DcpError::MetadataIo(e.to_string())),
        }
    }

    /// Replaces the stored map atomically (temp file + rename).
    async fn write_map(&self, map: &HashMap<VbId, CheckpointDocument>) -> Result<(), DcpError> {
        let body = serde_json::to_vec(map).map_err(|e| DcpError::MetadataIo(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| DcpError::MetadataIo(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DcpError::MetadataIo(e.to_string()))
    }
}

#[async_trait]
impl Metadata for FileMetadata {
    async fn save(
        &self,
        docs: &HashMap<VbId, CheckpointDocument>,
        _dirty: &HashMap<VbId, bool>,
        _bucket_uuid: &str,
    ) -> Result<(), DcpError> {
        let _guard = self.io_lock.lock().await;
        self.write_map(docs).await
    }

    async fn load(
        &self,
        vb_ids: &[VbId],
        bucket_uuid: &str,
    ) -> Result<(HashMap<VbId, CheckpointDocument>, bool), DcpError> {
        let _guard = self.io_lock.lock().await;
        let stored = self.read_map().await?;

        let mut docs = HashMap::with_capacity(vb_ids.len());
        let mut existed = false;
        for vb_id in vb_ids {
            match stored.get(vb_id) {
                Some(doc) if doc.bucket_uuid == bucket_uuid => {
                    existed = true;
                    docs.insert(*vb_id, doc.clone());
                }
                // Absent, or stored against a recreated bucket.
                _ => {
                    docs.insert(*vb_id, CheckpointDocument::empty(bucket_uuid));
                }
            }
        }
        Ok((docs, existed))
    }

    async fn clear(&self, vb_ids: &[VbId]) -> Result<(), DcpError> {
        let _guard = self.io_lock.lock().await;
        let mut stored = self.read_map().await?;
        for vb_id in vb_ids {
            stored.remove(vb_id);
        }
        if stored.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(DcpError::MetadataIo(e.to_string())),
            }
        } else {
            self.write_map(&stored).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Offset;

    fn sample_docs(bucket_uuid: &str) -> HashMap<VbId, CheckpointDocument> {
        (0u16..4)
            .map(|vb| {
                let offset = Offset::at(u64::from(vb) + 1, u64::from(vb) * 10);
                (vb, CheckpointDocument::from_offset(&offset, bucket_uuid))
            })
            .collect()
    }

    fn all_dirty(vb_ids: impl Iterator<Item = VbId>) -> HashMap<VbId, bool> {
        vb_ids.map(|vb| (vb, true)).collect()
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = FileMetadata::new(dir.path().join("checkpoints.json"));
        let (docs, existed) = metadata.load(&[0, 1], "b").await.unwrap();
        assert!(!existed);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[&0], CheckpointDocument::empty("b"));
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = FileMetadata::new(dir.path().join("checkpoints.json"));

        let docs = sample_docs("b");
        metadata
            .save(&docs, &all_dirty(0..4), "b")
            .await
            .unwrap();

        let (loaded, existed) = metadata.load(&[0, 1, 2, 3], "b").await.unwrap();
        assert!(existed);
        assert_eq!(loaded, docs);
    }

    #[tokio::test]
    async fn test_bucket_uuid_mismatch_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = FileMetadata::new(dir.path().join("checkpoints.json"));

        let docs = sample_docs("old-bucket");
        metadata
            .save(&docs, &all_dirty(0..4), "old-bucket")
            .await
            .unwrap();

        let (loaded, existed) = metadata.load(&[0, 1, 2, 3], "new-bucket").await.unwrap();
        assert!(!existed);
        for vb in 0u16..4 {
            assert_eq!(loaded[&vb], CheckpointDocument::empty("new-bucket"));
        }
    }

    #[tokio::test]
    async fn test_clear_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let metadata = FileMetadata::new(path.clone());

        let docs = sample_docs("b");
        metadata
            .save(&docs, &all_dirty(0..4), "b")
            .await
            .unwrap();
        metadata.clear(&[0, 1, 2, 3]).await.unwrap();

        assert!(!path.exists());
        let (_, existed) = metadata.load(&[0, 1, 2, 3], "b").await.unwrap();
        assert!(!existed);
    }

    #[tokio::test]
    async fn test_partial_clear_keeps_other_vbuckets() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = FileMetadata::new(dir.path().join("checkpoints.json"));

        let docs = sample_docs("b");
        metadata
            .save(&docs, &all_dirty(0..4), "b")
            .await
            .unwrap();
        metadata.clear(&[0, 1]).await.unwrap();

        let (loaded, existed) = metadata.load(&[0, 1, 2, 3], "b").await.unwrap();
        assert!(existed);
        assert_eq!(loaded[&0], CheckpointDocument::empty("b"));
        assert_eq!(loaded[&2], docs[&2]);
    }

    #[tokio::test]
    async fn test_read_only_wrapper_drops_writes() {
        use std::sync::Arc;

        use crate::metadata::ReadOnlyMetadata;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let inner = Arc::new(FileMetadata::new(path.clone()));
        let read_only = ReadOnlyMetadata::new(inner);

        let docs = sample_docs("b");
        read_only
            .save(&docs, &all_dirty(0..4), "b")
            .await
            .unwrap();
        assert!(!path.exists());

        let (_, existed) = read_only.load(&[0, 1], "b").await.unwrap();
        assert!(!existed);
    }
}
