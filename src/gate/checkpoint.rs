//! Gate checkpoint and restore
//!
//! Checkpoints are taken periodically by the gate checkpointer service and
//! on shutdown, never per admission. A record admitted after the last
//! checkpoint and re-presented after a crash is admitted again; the backend
//! write key makes that rewrite idempotent.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::DuplicateGate;
use crate::error::PersistenceError;
use crate::snapshot::{read_snapshot, write_snapshot};
use crate::types::Fingerprint;

#[derive(Debug, Serialize, Deserialize)]
struct GateSnapshot {
    taken_at: DateTime<Utc>,
    /// Least recently used first
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    fingerprint: Fingerprint,
    first_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl DuplicateGate {
    /// Write the live table to `path`
    ///
    /// Clears the dirty flag; a failed write sets it again so the next
    /// checkpoint retries.
    pub async fn checkpoint(&self, path: &Path) -> Result<usize, PersistenceError> {
        let snapshot = {
            let mut table = self.table.lock();
            let now = Utc::now();
            let entries: Vec<SnapshotEntry> = table
                .ordered()
                .filter(|(_, e)| e.expires_at > now)
                .map(|(fp, e)| SnapshotEntry {
                    fingerprint: *fp,
                    first_seen: e.first_seen,
                    expires_at: e.expires_at,
                })
                .collect();
            table.dirty = false;
            GateSnapshot {
                taken_at: now,
                entries,
            }
        };

        let count = snapshot.entries.len();
        match write_snapshot(path, &snapshot).await {
            Ok(bytes) => {
                info!(path = %path.display(), entries = count, bytes, "Gate checkpoint written");
                Ok(count)
            }
            Err(e) => {
                self.table.lock().dirty = true;
                Err(e)
            }
        }
    }

    /// Load a checkpoint, skipping entries that have expired
    pub async fn restore(&self, path: &Path) -> Result<usize, PersistenceError> {
        self.restore_at(path, Utc::now()).await
    }

    /// Load a checkpoint as of `now`
    ///
    /// A missing file restores nothing. Entries already in the table are
    /// kept; the capacity bound still applies.
    pub async fn restore_at(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let Some(snapshot) = read_snapshot::<GateSnapshot>(path).await? else {
            return Ok(0);
        };

        let mut table = self.table.lock();
        let mut restored = 0;
        let mut skipped = 0;
        for entry in snapshot.entries {
            if entry.expires_at <= now {
                skipped += 1;
                continue;
            }
            if table.entries.contains_key(&entry.fingerprint) {
                continue;
            }
            table.insert(entry.fingerprint, entry.first_seen, entry.expires_at);
            restored += 1;
        }
        let evicted = table.evict_lru(self.config.max_entries);
        if evicted > 0 {
            warn!(evicted, "Restored checkpoint exceeded gate capacity");
        }

        info!(
            path = %path.display(),
            restored,
            skipped,
            taken_at = %snapshot.taken_at,
            "Gate checkpoint restored"
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Admission, GateConfig};
    use super::*;
    use crate::types::{CanonicalRecord, MetricFamily};
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(v: f64) -> CanonicalRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap().fixed_offset();
        CanonicalRecord::builder(MetricFamily::Activity, ts, "phone")
            .field("steps", v)
            .build()
    }

    #[tokio::test]
    async fn test_checkpoint_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.ckpt");

        let gate = DuplicateGate::new(GateConfig::default());
        let now = Utc::now();
        gate.admit_at(&record(1.0), now);
        gate.admit_at(&record(2.0), now);
        assert!(gate.is_dirty());

        assert_eq!(gate.checkpoint(&path).await.unwrap(), 2);
        assert!(!gate.is_dirty());

        let restored = DuplicateGate::new(GateConfig::default());
        assert_eq!(restored.restore(&path).await.unwrap(), 2);
        assert_eq!(restored.admit_at(&record(1.0), now), Admission::Duplicate);
        assert_eq!(restored.admit_at(&record(3.0), now), Admission::Admitted);
    }

    #[tokio::test]
    async fn test_restore_skips_expired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.ckpt");

        let gate = DuplicateGate::new(GateConfig {
            ttl: Duration::from_secs(3600),
            ..Default::default()
        });
        let now = Utc::now();
        gate.admit_at(&record(1.0), now);
        gate.checkpoint(&path).await.unwrap();

        let restored = DuplicateGate::new(GateConfig::default());
        let later = now + chrono::Duration::hours(2);
        assert_eq!(restored.restore_at(&path, later).await.unwrap(), 0);
        assert!(restored.is_empty());
    }

    #[tokio::test]
    async fn test_restore_missing_file() {
        let dir = TempDir::new().unwrap();
        let gate = DuplicateGate::new(GateConfig::default());
        assert_eq!(gate.restore(&dir.path().join("absent")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_respects_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.ckpt");

        let gate = DuplicateGate::new(GateConfig::default());
        let now = Utc::now();
        for i in 0..5 {
            gate.admit_at(&record(i as f64), now);
        }
        gate.checkpoint(&path).await.unwrap();

        let small = DuplicateGate::new(GateConfig {
            max_entries: 3,
            ..Default::default()
        });
        small.restore_at(&path, now).await.unwrap();
        assert_eq!(small.len(), 3);
        // the oldest entries were evicted
        assert_eq!(small.admit_at(&record(4.0), now), Admission::Duplicate);
    }
}
