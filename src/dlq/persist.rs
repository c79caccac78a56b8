//! Dead-letter snapshot persistence
//!
//! The whole store is written as one checksummed snapshot by the
//! maintenance service as soon as an entry is recorded, before every gate
//! checkpoint, and once more on shutdown. Snapshot writes are serialized
//! so a newer snapshot is never overwritten by an older one.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{DeadLetterConfig, DeadLetterEntry, DeadLetterStore};
use crate::error::PersistenceError;
use crate::snapshot::{read_snapshot, write_snapshot};

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    taken_at: DateTime<Utc>,
    /// Arrival order
    entries: Vec<DeadLetterEntry>,
}

impl DeadLetterStore {
    /// Create a store and load its snapshot, if one is configured and exists
    pub async fn open(config: DeadLetterConfig) -> Result<Self, PersistenceError> {
        let path = config.snapshot_path.clone();
        let store = Self::new(config);
        if let Some(path) = path {
            store.load(&path).await?;
        }
        Ok(store)
    }

    /// Load entries from `path`, appending them after any current entries
    pub async fn load(&self, path: &Path) -> Result<usize, PersistenceError> {
        let Some(snapshot) = read_snapshot::<StoreSnapshot>(path).await? else {
            return Ok(0);
        };

        let count = snapshot.entries.len();
        {
            let mut inner = self.inner.write();
            for entry in snapshot.entries {
                if !inner.ids.contains_key(&entry.id) {
                    inner.insert(entry);
                }
            }
            inner.enforce_capacity(self.config.max_entries);
        }
        info!(
            path = %path.display(),
            entries = count,
            taken_at = %snapshot.taken_at,
            "Dead-letter snapshot loaded"
        );
        Ok(count)
    }

    /// Write the store to `path`
    pub async fn persist(&self, path: &Path) -> Result<usize, PersistenceError> {
        let _writing = self.persist_lock.lock().await;
        let snapshot = {
            let mut inner = self.inner.write();
            inner.dirty = false;
            StoreSnapshot {
                taken_at: Utc::now(),
                entries: inner.entries.values().cloned().collect(),
            }
        };

        let count = snapshot.entries.len();
        match write_snapshot(path, &snapshot).await {
            Ok(bytes) => {
                info!(path = %path.display(), entries = count, bytes, "Dead-letter snapshot written");
                Ok(count)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Dead-letter snapshot failed");
                self.inner.write().dirty = true;
                Err(e)
            }
        }
    }

    /// Persist to the configured path if anything changed
    pub async fn persist_if_dirty(&self) -> Result<Option<usize>, PersistenceError> {
        let Some(path) = self.config.snapshot_path.clone() else {
            return Ok(None);
        };
        if !self.is_dirty() {
            return Ok(None);
        }
        self.persist(&path).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{DeadLetterCategory, DeadLetterPayload, DeadLetterStatus};
    use super::*;
    use crate::types::{CanonicalRecord, MetricFamily};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DeadLetterConfig {
        DeadLetterConfig {
            snapshot_path: Some(dir.path().join("dlq.snapshot")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_persist_and_open() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        assert!(store.is_empty());

        let ts = chrono::DateTime::parse_from_rfc3339("2024-01-15T08:00:00+02:00").unwrap();
        let record = CanonicalRecord::builder(MetricFamily::Body, ts, "scale")
            .field("weight_kg", 70.5)
            .build();
        let a = store.record(
            DeadLetterPayload::Records(vec![record.clone()]),
            DeadLetterCategory::WriteError,
            "timeout",
        );
        let b = store.record(
            DeadLetterPayload::Raw("\u{fffd}bad".to_string()),
            DeadLetterCategory::UnicodeDecodeError,
            "invalid utf-8",
        );
        store.resolve(&b);

        assert_eq!(store.persist_if_dirty().await.unwrap(), Some(2));
        assert_eq!(store.persist_if_dirty().await.unwrap(), None);

        let reopened = DeadLetterStore::open(config(&dir)).await.unwrap();
        assert_eq!(reopened.len(), 2);
        let entry = reopened.get(&a).unwrap();
        assert_eq!(entry.payload, DeadLetterPayload::Records(vec![record]));
        assert_eq!(reopened.get(&b).unwrap().status, DeadLetterStatus::Resolved);
        assert_eq!(reopened.pending_count(), 1);

        // arrival order survives the round trip
        let listed = reopened.list(&Default::default());
        assert_eq!(listed[0].id, b);
    }

    #[tokio::test]
    async fn test_without_path_nothing_is_written() {
        let store = DeadLetterStore::new(DeadLetterConfig::default());
        store.record(
            DeadLetterPayload::Raw("x".into()),
            DeadLetterCategory::JsonParseError,
            "eof",
        );
        assert_eq!(store.persist_if_dirty().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_persists_keep_latest() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::open(config(&dir)).await.unwrap();
        store.record(
            DeadLetterPayload::Raw("first".into()),
            DeadLetterCategory::JsonParseError,
            "eof",
        );

        let path = dir.path().join("dlq.snapshot");
        let earlier = store.persist(&path);
        let later = async {
            store.record(
                DeadLetterPayload::Raw("second".into()),
                DeadLetterCategory::JsonParseError,
                "eof",
            );
            store.persist(&path).await
        };
        let (earlier, later) = tokio::join!(earlier, later);
        earlier.unwrap();
        assert_eq!(later.unwrap(), 2);

        let reopened = DeadLetterStore::open(config(&dir)).await.unwrap();
        assert_eq!(reopened.len(), 2);
    }
}
