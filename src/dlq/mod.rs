//! Dead-letter store
//!
//! Holds everything the pipeline could not process, classified into a
//! closed set of categories, until it is replayed, purged or abandoned.
//!
//! Entries are kept in arrival order. Capacity pressure removes settled
//! entries (resolved or abandoned) oldest first, and only then the oldest
//! pending ones.

pub mod persist;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{CanonicalRecord, TimeRange};

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCategory {
    /// Payload bytes are not valid JSON
    JsonParseError,
    /// Payload bytes are not valid UTF-8
    UnicodeDecodeError,
    /// An item failed schema validation
    ValidationError,
    /// A handler failed to build a record
    TransformError,
    /// The backend did not accept a batch
    WriteError,
    /// Anything else, including unrecognized payload shapes
    UnknownError,
}

impl DeadLetterCategory {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterCategory::JsonParseError => "json_parse_error",
            DeadLetterCategory::UnicodeDecodeError => "unicode_decode_error",
            DeadLetterCategory::ValidationError => "validation_error",
            DeadLetterCategory::TransformError => "transform_error",
            DeadLetterCategory::WriteError => "write_error",
            DeadLetterCategory::UnknownError => "unknown_error",
        }
    }

    /// All categories
    pub fn all() -> [DeadLetterCategory; 6] {
        [
            DeadLetterCategory::JsonParseError,
            DeadLetterCategory::UnicodeDecodeError,
            DeadLetterCategory::ValidationError,
            DeadLetterCategory::TransformError,
            DeadLetterCategory::WriteError,
            DeadLetterCategory::UnknownError,
        ]
    }
}

impl fmt::Display for DeadLetterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown dead-letter category '{}'", s))
    }
}

/// Lifecycle of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Awaiting replay
    Pending,
    /// Replayed successfully
    Resolved,
    /// Replay retries exhausted
    Abandoned,
}

/// What was stored, tagged by the stage it failed at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    /// Undecodable input, lossily decoded
    Raw(String),
    /// A whole payload that failed before any item was extracted
    Payload(Value),
    /// A single normalized item
    Item(Value),
    /// Canonical records that could not be written
    Records(Vec<CanonicalRecord>),
}

impl DeadLetterPayload {
    /// Records held, zero for non-record payloads
    pub fn record_count(&self) -> usize {
        match self {
            DeadLetterPayload::Records(records) => records.len(),
            _ => 0,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterPayload::Raw(_) => "raw",
            DeadLetterPayload::Payload(_) => "payload",
            DeadLetterPayload::Item(_) => "item",
            DeadLetterPayload::Records(_) => "records",
        }
    }
}

/// One dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique id
    pub id: String,
    /// What failed
    pub payload: DeadLetterPayload,
    /// Failure category
    pub category: DeadLetterCategory,
    /// Most recent error message
    pub error_detail: String,
    /// When the first failure happened
    pub first_failed_at: DateTime<Utc>,
    /// Failed replay attempts
    pub retry_count: u32,
    /// When the last replay was attempted
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Lifecycle status
    pub status: DeadLetterStatus,
}

/// Dead-letter store configuration
#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    /// Entries kept before capacity purging
    pub max_entries: usize,
    /// Entries older than this are purged
    pub retention: Duration,
    /// Failed replays before an entry is abandoned
    pub max_retries: u32,
    /// Snapshot file, if persistence is enabled
    pub snapshot_path: Option<PathBuf>,
    /// Interval of the maintenance service
    pub maintenance_interval: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            retention: Duration::from_secs(30 * 24 * 3600),
            max_retries: 3,
            snapshot_path: None,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Query over entries
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Only this category
    pub category: Option<DeadLetterCategory>,
    /// Only this status
    pub status: Option<DeadLetterStatus>,
    /// Only entries first failing inside this range
    pub range: Option<TimeRange>,
    /// Maximum number returned
    pub limit: Option<usize>,
    /// Matching entries skipped before the first returned
    pub offset: usize,
}

impl DeadLetterFilter {
    /// Filter on one category
    pub fn category(category: DeadLetterCategory) -> Self {
        Self {
            category: Some(category),
            ..Default::default()
        }
    }

    /// Filter on one status
    pub fn status(status: DeadLetterStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.category.map_or(true, |c| c == entry.category)
            && self.status.map_or(true, |s| s == entry.status)
            && self.range.map_or(true, |r| r.contains(entry.first_failed_at))
    }
}

/// Which entries a replay covers
#[derive(Debug, Clone)]
pub enum ReplaySelector {
    /// Explicit ids
    Ids(Vec<String>),
    /// Every entry of a category
    Category(DeadLetterCategory),
    /// Entries matching a filter
    Filter(DeadLetterFilter),
}

/// Re-injects a dead-lettered payload into the pipeline
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Process the payload again; an error keeps the entry pending
    async fn replay(&self, payload: &DeadLetterPayload) -> Result<()>;
}

/// Result of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Pending entries selected
    pub selected: Vec<String>,
    /// Selected entries skipped because they are not pending
    pub skipped: usize,
    /// Entries now resolved
    pub resolved: usize,
    /// Entries that failed again and stay pending
    pub failed: usize,
    /// Entries that failed and were abandoned
    pub abandoned: usize,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    /// All entries
    pub total: usize,
    /// Pending entries
    pub pending: usize,
    /// Resolved entries
    pub resolved: usize,
    /// Abandoned entries
    pub abandoned: usize,
    /// Entries per category
    pub by_category: BTreeMap<DeadLetterCategory, usize>,
    /// Configured capacity
    pub max_entries: usize,
    /// Entries recorded since start
    pub total_recorded: u64,
    /// Successful replays since start
    pub total_replayed: u64,
    /// Failed replays since start
    pub total_failed_replays: u64,
    /// Entries purged since start
    pub total_purged: u64,
}

/// Purge result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Entries past retention
    pub aged_out: usize,
    /// Settled entries removed for capacity
    pub evicted_settled: usize,
    /// Pending entries removed for capacity
    pub evicted_pending: usize,
}

impl PurgeReport {
    /// Entries removed
    pub fn total(&self) -> usize {
        self.aged_out + self.evicted_settled + self.evicted_pending
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    /// arrival sequence -> entry
    entries: BTreeMap<u64, DeadLetterEntry>,
    ids: HashMap<String, u64>,
    /// sequences of resolved or abandoned entries
    settled: BTreeSet<u64>,
    next_seq: u64,
    dirty: bool,
    total_recorded: u64,
    total_replayed: u64,
    total_failed_replays: u64,
    total_purged: u64,
}

impl StoreInner {
    fn insert(&mut self, entry: DeadLetterEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if entry.status != DeadLetterStatus::Pending {
            self.settled.insert(seq);
        }
        self.ids.insert(entry.id.clone(), seq);
        self.entries.insert(seq, entry);
    }

    fn remove(&mut self, seq: u64) -> Option<DeadLetterEntry> {
        let entry = self.entries.remove(&seq)?;
        self.ids.remove(&entry.id);
        self.settled.remove(&seq);
        Some(entry)
    }

    fn set_status(&mut self, seq: u64, status: DeadLetterStatus) {
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.status = status;
            if status == DeadLetterStatus::Pending {
                self.settled.remove(&seq);
            } else {
                self.settled.insert(seq);
            }
        }
    }

    fn purge(&mut self, cutoff: DateTime<Utc>, max_entries: usize) -> PurgeReport {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.first_failed_at < cutoff)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &expired {
            self.remove(*seq);
        }

        let mut report = self.enforce_capacity(max_entries);
        report.aged_out = expired.len();
        if !expired.is_empty() {
            self.total_purged += expired.len() as u64;
            self.dirty = true;
        }
        report
    }

    fn enforce_capacity(&mut self, max_entries: usize) -> PurgeReport {
        let mut report = PurgeReport::default();
        while self.entries.len() > max_entries {
            if let Some(seq) = self.settled.first().copied() {
                self.remove(seq);
                report.evicted_settled += 1;
            } else if let Some(seq) = self.entries.keys().next().copied() {
                self.remove(seq);
                report.evicted_pending += 1;
            } else {
                break;
            }
        }
        let evicted = report.evicted_settled + report.evicted_pending;
        if evicted > 0 {
            self.total_purged += evicted as u64;
            self.dirty = true;
        }
        report
    }
}

/// Dead-letter store
#[derive(Debug)]
pub struct DeadLetterStore {
    config: DeadLetterConfig,
    inner: RwLock<StoreInner>,
    /// Signalled on every new entry
    recorded: Notify,
    /// Held for the whole of a snapshot write
    persist_lock: AsyncMutex<()>,
}

impl DeadLetterStore {
    /// Create an empty in-memory store
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(StoreInner::default()),
            recorded: Notify::new(),
            persist_lock: AsyncMutex::new(()),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Record a failure and return the new entry id
    pub fn record(
        &self,
        payload: DeadLetterPayload,
        category: DeadLetterCategory,
        detail: impl Into<String>,
    ) -> String {
        self.record_at(payload, category, detail, Utc::now())
    }

    /// Record a failure that happened at `now`
    pub fn record_at(
        &self,
        payload: DeadLetterPayload,
        category: DeadLetterCategory,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let entry = DeadLetterEntry {
            id: id.clone(),
            payload,
            category,
            error_detail: detail.into(),
            first_failed_at: now,
            retry_count: 0,
            last_retry_at: None,
            status: DeadLetterStatus::Pending,
        };
        debug!(
            entry_id = %id,
            category = category.as_str(),
            payload = entry.payload.kind(),
            "Dead-letter entry recorded"
        );

        let report = {
            let mut inner = self.inner.write();
            inner.insert(entry);
            inner.total_recorded += 1;
            inner.dirty = true;

            // Retention sweeps run periodically; here only capacity is enforced
            inner.enforce_capacity(self.config.max_entries)
        };
        if report.evicted_pending > 0 {
            warn!(
                evicted_pending = report.evicted_pending,
                max_entries = self.config.max_entries,
                "Dead-letter store full, pending entries evicted"
            );
        }
        self.recorded.notify_one();
        id
    }

    /// Wait until an entry is recorded
    ///
    /// A record made while nobody waits is remembered, so the next call
    /// returns at once.
    pub async fn recorded(&self) {
        self.recorded.notified().await
    }

    /// Fetch one entry
    pub fn get(&self, id: &str) -> Option<DeadLetterEntry> {
        let inner = self.inner.read();
        inner
            .ids
            .get(id)
            .and_then(|seq| inner.entries.get(seq))
            .cloned()
    }

    /// Entries matching `filter`, newest first
    pub fn list(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterEntry> {
        let inner = self.inner.read();
        inner
            .entries
            .values()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pending entries
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.read();
        inner.entries.len() - inner.settled.len()
    }

    /// Mark an entry resolved without replaying it
    pub fn resolve(&self, id: &str) -> bool {
        self.set_status(id, DeadLetterStatus::Resolved)
    }

    /// Mark an entry abandoned
    pub fn abandon(&self, id: &str) -> bool {
        self.set_status(id, DeadLetterStatus::Abandoned)
    }

    fn set_status(&self, id: &str, status: DeadLetterStatus) -> bool {
        let mut inner = self.inner.write();
        let Some(seq) = inner.ids.get(id).copied() else {
            return false;
        };
        inner.set_status(seq, status);
        inner.dirty = true;
        true
    }

    /// Remove an entry
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(seq) = inner.ids.get(id).copied() else {
            return false;
        };
        inner.remove(seq);
        inner.dirty = true;
        true
    }

    /// Remove every entry
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.ids.clear();
        inner.settled.clear();
        inner.dirty = true;
        info!(count, "Dead-letter store cleared");
        count
    }

    /// Apply retention and capacity limits as of `now`
    pub fn purge(&self, now: DateTime<Utc>) -> PurgeReport {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let report = self.inner.write().purge(cutoff, self.config.max_entries);
        if report.total() > 0 {
            info!(
                aged_out = report.aged_out,
                evicted_settled = report.evicted_settled,
                evicted_pending = report.evicted_pending,
                "Dead-letter store purged"
            );
        }
        report
    }

    /// Replay selected pending entries through `target`
    ///
    /// A dry run reports the selection without calling the target or
    /// changing any entry.
    pub async fn replay(
        &self,
        selector: &ReplaySelector,
        dry_run: bool,
        target: &dyn ReplayTarget,
    ) -> ReplayReport {
        let (selected, skipped) = self.select(selector);
        let mut report = ReplayReport {
            dry_run,
            selected: selected.iter().map(|(id, _)| id.clone()).collect(),
            skipped,
            ..Default::default()
        };
        if dry_run {
            info!(selected = report.selected.len(), skipped, "Dead-letter dry-run replay");
            return report;
        }

        for (id, payload) in selected {
            let result = target.replay(&payload).await;
            let now = Utc::now();

            let mut inner = self.inner.write();
            let Some(seq) = inner.ids.get(&id).copied() else {
                // Purged while the replay was running
                continue;
            };
            match result {
                Ok(()) => {
                    if let Some(entry) = inner.entries.get_mut(&seq) {
                        entry.last_retry_at = Some(now);
                    }
                    inner.set_status(seq, DeadLetterStatus::Resolved);
                    inner.total_replayed += 1;
                    report.resolved += 1;
                    debug!(entry_id = %id, "Dead-letter entry replayed");
                }
                Err(e) => {
                    let mut abandon = false;
                    if let Some(entry) = inner.entries.get_mut(&seq) {
                        entry.retry_count += 1;
                        entry.last_retry_at = Some(now);
                        entry.error_detail = e.to_string();
                        abandon = entry.retry_count >= self.config.max_retries;
                    }
                    inner.total_failed_replays += 1;
                    if abandon {
                        inner.set_status(seq, DeadLetterStatus::Abandoned);
                        report.abandoned += 1;
                        warn!(entry_id = %id, error = %e, "Dead-letter entry abandoned");
                    } else {
                        report.failed += 1;
                        debug!(entry_id = %id, error = %e, "Dead-letter replay failed");
                    }
                }
            }
            inner.dirty = true;
        }

        info!(
            resolved = report.resolved,
            failed = report.failed,
            abandoned = report.abandoned,
            skipped = report.skipped,
            "Dead-letter replay finished"
        );
        report
    }

    /// Pending entries covered by `selector` (oldest first), and the count of
    /// covered entries that are not pending
    fn select(&self, selector: &ReplaySelector) -> (Vec<(String, DeadLetterPayload)>, usize) {
        let inner = self.inner.read();
        let covered: Vec<&DeadLetterEntry> = match selector {
            ReplaySelector::Ids(ids) => ids
                .iter()
                .filter_map(|id| inner.ids.get(id).and_then(|seq| inner.entries.get(seq)))
                .collect(),
            ReplaySelector::Category(category) => inner
                .entries
                .values()
                .filter(|e| e.category == *category)
                .collect(),
            ReplaySelector::Filter(filter) => {
                let mut matched: Vec<&DeadLetterEntry> = inner
                    .entries
                    .values()
                    .rev()
                    .filter(|e| filter.matches(e))
                    .skip(filter.offset)
                    .take(filter.limit.unwrap_or(usize::MAX))
                    .collect();
                matched.reverse();
                matched
            }
        };

        let mut selected = Vec::new();
        let mut skipped = 0;
        for entry in covered {
            if entry.status == DeadLetterStatus::Pending {
                selected.push((entry.id.clone(), entry.payload.clone()));
            } else {
                skipped += 1;
            }
        }
        (selected, skipped)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> DeadLetterStats {
        let inner = self.inner.read();
        let mut stats = DeadLetterStats {
            total: inner.entries.len(),
            max_entries: self.config.max_entries,
            total_recorded: inner.total_recorded,
            total_replayed: inner.total_replayed,
            total_failed_replays: inner.total_failed_replays,
            total_purged: inner.total_purged,
            ..Default::default()
        };
        for entry in inner.entries.values() {
            match entry.status {
                DeadLetterStatus::Pending => stats.pending += 1,
                DeadLetterStatus::Resolved => stats.resolved += 1,
                DeadLetterStatus::Abandoned => stats.abandoned += 1,
            }
            *stats.by_category.entry(entry.category).or_insert(0) += 1;
        }
        stats
    }

    /// Whether anything changed since the last snapshot
    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, Error};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Target that fails until told otherwise
    struct ToggleTarget {
        healthy: Mutex<bool>,
        calls: Mutex<usize>,
    }

    impl ToggleTarget {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: Mutex::new(healthy),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ReplayTarget for ToggleTarget {
        async fn replay(&self, _payload: &DeadLetterPayload) -> Result<()> {
            *self.calls.lock() += 1;
            if *self.healthy.lock() {
                Ok(())
            } else {
                Err(Error::Backend(BackendError::Connection("down".into())))
            }
        }
    }

    fn item() -> DeadLetterPayload {
        DeadLetterPayload::Item(json!({"name": "heart_rate"}))
    }

    #[test]
    fn test_category_names() {
        assert_eq!(DeadLetterCategory::JsonParseError.as_str(), "json_parse_error");
        assert_eq!(
            serde_json::to_string(&DeadLetterCategory::UnicodeDecodeError).unwrap(),
            "\"unicode_decode_error\""
        );
        assert_eq!(
            "write_error".parse::<DeadLetterCategory>(),
            Ok(DeadLetterCategory::WriteError)
        );
        assert!("bogus".parse::<DeadLetterCategory>().is_err());
    }

    #[test]
    fn test_record_get_list() {
        let store = DeadLetterStore::new(DeadLetterConfig::default());
        let t0 = Utc::now();
        let a = store.record_at(item(), DeadLetterCategory::ValidationError, "a", t0);
        let b = store.record_at(
            item(),
            DeadLetterCategory::WriteError,
            "b",
            t0 + chrono::Duration::seconds(1),
        );

        let entry = store.get(&a).unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.id.len(), 32);

        let all = store.list(&DeadLetterFilter::default());
        assert_eq!(all.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec![b.clone(), a]);

        let writes = store.list(&DeadLetterFilter::category(DeadLetterCategory::WriteError));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].id, b);

        let paged = store.list(&DeadLetterFilter {
            limit: Some(1),
            offset: 1,
            ..Default::default()
        });
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].error_detail, "a");

        let ranged = store.list(&DeadLetterFilter {
            range: Some(TimeRange::new(t0 + chrono::Duration::milliseconds(500), t0 + chrono::Duration::seconds(2))),
            ..Default::default()
        });
        assert_eq!(ranged.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let store = DeadLetterStore::new(DeadLetterConfig::default());
        let id = store.record(item(), DeadLetterCategory::WriteError, "down");
        let target = ToggleTarget::new(true);

        let report = store
            .replay(&ReplaySelector::Ids(vec![id.clone()]), true, &target)
            .await;
        assert!(report.dry_run);
        assert_eq!(report.selected, vec![id.clone()]);
        assert_eq!(*target.calls.lock(), 0);
        assert_eq!(store.get(&id).unwrap().status, DeadLetterStatus::Pending);
    }

    #[tokio::test]
    async fn test_replay_resolves_when_condition_fixed() {
        let store = DeadLetterStore::new(DeadLetterConfig::default());
        let id = store.record(item(), DeadLetterCategory::WriteError, "down");
        let target = ToggleTarget::new(false);

        let report = store
            .replay(&ReplaySelector::Category(DeadLetterCategory::WriteError), false, &target)
            .await;
        assert_eq!(report.failed, 1);
        let entry = store.get(&id).unwrap();
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_retry_at.is_some());
        assert_eq!(entry.status, DeadLetterStatus::Pending);

        *target.healthy.lock() = true;
        let report = store
            .replay(&ReplaySelector::Category(DeadLetterCategory::WriteError), false, &target)
            .await;
        assert_eq!(report.resolved, 1);
        assert_eq!(store.get(&id).unwrap().status, DeadLetterStatus::Resolved);

        // resolved entries are skipped
        let report = store
            .replay(&ReplaySelector::Ids(vec![id]), false, &target)
            .await;
        assert_eq!(report.skipped, 1);
        assert!(report.selected.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_after_max_retries() {
        let store = DeadLetterStore::new(DeadLetterConfig {
            max_retries: 2,
            ..Default::default()
        });
        let id = store.record(item(), DeadLetterCategory::WriteError, "down");
        let target = ToggleTarget::new(false);
        let selector = ReplaySelector::Ids(vec![id.clone()]);

        store.replay(&selector, false, &target).await;
        let report = store.replay(&selector, false, &target).await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(store.get(&id).unwrap().status, DeadLetterStatus::Abandoned);

        let report = store.replay(&selector, false, &target).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(*target.calls.lock(), 2);
    }

    #[test]
    fn test_retention_purge() {
        let store = DeadLetterStore::new(DeadLetterConfig {
            retention: Duration::from_secs(3600),
            ..Default::default()
        });
        let now = Utc::now();
        store.record_at(item(), DeadLetterCategory::UnknownError, "old", now - chrono::Duration::hours(2));
        store.record_at(item(), DeadLetterCategory::UnknownError, "new", now);

        let report = store.purge(now);
        assert_eq!(report.aged_out, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().total_purged, 1);
    }

    #[test]
    fn test_capacity_purges_settled_before_pending() {
        let store = DeadLetterStore::new(DeadLetterConfig {
            max_entries: 3,
            ..Default::default()
        });
        let oldest = store.record(item(), DeadLetterCategory::WriteError, "1");
        let settled = store.record(item(), DeadLetterCategory::WriteError, "2");
        store.record(item(), DeadLetterCategory::WriteError, "3");
        store.resolve(&settled);

        store.record(item(), DeadLetterCategory::WriteError, "4");
        assert_eq!(store.len(), 3);
        assert!(store.get(&settled).is_none());
        assert!(store.get(&oldest).is_some());

        store.record(item(), DeadLetterCategory::WriteError, "5");
        assert!(store.get(&oldest).is_none());
    }

    #[test]
    fn test_stats_and_delete() {
        let store = DeadLetterStore::new(DeadLetterConfig::default());
        let a = store.record(item(), DeadLetterCategory::ValidationError, "a");
        let b = store.record(item(), DeadLetterCategory::TransformError, "b");
        store.abandon(&b);

        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.by_category[&DeadLetterCategory::ValidationError], 1);
        assert_eq!(store.pending_count(), 1);

        assert!(store.delete(&a));
        assert!(!store.delete(&a));
        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
    }
}
