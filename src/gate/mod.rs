//! Duplicate suppression gate
//!
//! A bounded fingerprint table with a TTL. Re-presenting a record whose
//! fingerprint is live yields [`Admission::Duplicate`]; once the entry has
//! expired the record is admitted again. When the table overflows, expired
//! entries are purged first and then the least recently used entries are
//! evicted regardless of TTL.

pub mod checkpoint;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::types::{CanonicalRecord, Fingerprint};

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// How long a fingerprint suppresses re-presentations
    pub ttl: Duration,
    /// Maximum number of live fingerprints
    pub max_entries: usize,
    /// Where checkpoints are written, if anywhere
    pub checkpoint_path: Option<PathBuf>,
    /// Interval between background checkpoints
    pub checkpoint_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            max_entries: 100_000,
            checkpoint_path: None,
            checkpoint_interval: Duration::from_secs(300),
        }
    }
}

/// Result of presenting a record to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First presentation inside the TTL window
    Admitted,
    /// A live entry with the same fingerprint exists
    Duplicate,
}

/// Gate counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    /// Live entries
    pub size: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Duplicates detected
    pub hits: u64,
    /// Records admitted
    pub misses: u64,
    /// Entries evicted by LRU pressure
    pub evictions: u64,
    /// Entries dropped after their TTL
    pub expirations: u64,
}

impl GateStats {
    /// Fraction of presentations that were duplicates
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateEntry {
    first_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_access: u64,
}

#[derive(Debug, Default)]
struct GateTable {
    entries: HashMap<Fingerprint, GateEntry>,
    /// access tick -> fingerprint, oldest first
    lru: BTreeMap<u64, Fingerprint>,
    /// (expiry, fingerprint), soonest first
    expiry: BTreeSet<(DateTime<Utc>, Fingerprint)>,
    tick: u64,
    dirty: bool,
    stats: GateStats,
}

impl GateTable {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, fp: Fingerprint, first_seen: DateTime<Utc>, expires_at: DateTime<Utc>) {
        let tick = self.next_tick();
        if let Some(old) = self.entries.insert(
            fp,
            GateEntry {
                first_seen,
                expires_at,
                last_access: tick,
            },
        ) {
            self.lru.remove(&old.last_access);
            self.expiry.remove(&(old.expires_at, fp));
        }
        self.lru.insert(tick, fp);
        self.expiry.insert((expires_at, fp));
    }

    fn remove(&mut self, fp: &Fingerprint) -> Option<GateEntry> {
        let entry = self.entries.remove(fp)?;
        self.lru.remove(&entry.last_access);
        self.expiry.remove(&(entry.expires_at, *fp));
        Some(entry)
    }

    fn touch(&mut self, fp: &Fingerprint) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(fp) {
            self.lru.remove(&entry.last_access);
            entry.last_access = tick;
            self.lru.insert(tick, *fp);
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some((expires_at, fp)) = self.expiry.first().copied() {
            if expires_at > now {
                break;
            }
            self.remove(&fp);
            removed += 1;
        }
        if removed > 0 {
            self.stats.expirations += removed as u64;
            self.dirty = true;
        }
        removed
    }

    fn evict_lru(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_entries {
            let Some((_, fp)) = self.lru.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&fp) {
                self.expiry.remove(&(entry.expires_at, fp));
            }
            evicted += 1;
        }
        if evicted > 0 {
            self.stats.evictions += evicted as u64;
            self.dirty = true;
        }
        evicted
    }

    /// Entries ordered least recently used first
    fn ordered(&self) -> impl Iterator<Item = (&Fingerprint, &GateEntry)> {
        self.lru
            .values()
            .filter_map(move |fp| self.entries.get(fp).map(|e| (fp, e)))
    }
}

/// Duplicate suppression gate
#[derive(Debug)]
pub struct DuplicateGate {
    config: GateConfig,
    ttl: chrono::Duration,
    table: Mutex<GateTable>,
}

impl DuplicateGate {
    /// Create an empty gate
    pub fn new(config: GateConfig) -> Self {
        let ttl = chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            config,
            ttl,
            table: Mutex::new(GateTable::default()),
        }
    }

    /// Gate configuration
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Present a record using the wall clock
    pub fn admit(&self, record: &CanonicalRecord) -> Admission {
        self.admit_at(record, Utc::now())
    }

    /// Present a record at an explicit instant
    pub fn admit_at(&self, record: &CanonicalRecord, now: DateTime<Utc>) -> Admission {
        self.admit_fingerprint_at(record.fingerprint(), now)
    }

    /// Present a bare fingerprint at an explicit instant
    pub fn admit_fingerprint_at(&self, fp: Fingerprint, now: DateTime<Utc>) -> Admission {
        let mut table = self.table.lock();

        if let Some(entry) = table.entries.get(&fp).copied() {
            if entry.expires_at > now {
                table.touch(&fp);
                table.stats.hits += 1;
                return Admission::Duplicate;
            }
            table.remove(&fp);
            table.stats.expirations += 1;
        }

        let expires_at = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        table.insert(fp, now, expires_at);
        table.stats.misses += 1;
        table.dirty = true;

        if table.entries.len() > self.config.max_entries {
            let expired = table.purge_expired(now);
            let evicted = table.evict_lru(self.config.max_entries);
            debug!(expired, evicted, size = table.entries.len(), "Gate overflow handled");
        }

        Admission::Admitted
    }

    /// Whether a fingerprint is currently live
    pub fn contains_at(&self, fp: &Fingerprint, now: DateTime<Utc>) -> bool {
        self.table
            .lock()
            .entries
            .get(fp)
            .map_or(false, |e| e.expires_at > now)
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    /// Drop entries expired at `now`
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let removed = self.table.lock().purge_expired(now);
        if removed > 0 {
            debug!(removed, "Expired gate entries cleaned up");
        }
        removed
    }

    /// Number of entries, live or not yet purged
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table changed since the last checkpoint
    pub fn is_dirty(&self) -> bool {
        self.table.lock().dirty
    }

    /// Counters snapshot
    pub fn stats(&self) -> GateStats {
        let table = self.table.lock();
        GateStats {
            size: table.entries.len(),
            capacity: self.config.max_entries,
            ..table.stats.clone()
        }
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.entries.clear();
        table.lru.clear();
        table.expiry.clear();
        table.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricFamily;
    use chrono::TimeZone;

    fn record(bpm: f64) -> CanonicalRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap().fixed_offset();
        CanonicalRecord::builder(MetricFamily::Heart, ts, "watch")
            .field("bpm", bpm)
            .build()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn gate(max_entries: usize) -> DuplicateGate {
        DuplicateGate::new(GateConfig {
            max_entries,
            ..Default::default()
        })
    }

    #[test]
    fn test_duplicate_inside_ttl() {
        let gate = gate(100);
        let r = record(72.0);
        assert_eq!(gate.admit_at(&r, t0()), Admission::Admitted);
        assert_eq!(
            gate.admit_at(&r, t0() + chrono::Duration::seconds(1)),
            Admission::Duplicate
        );
        let stats = gate.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_admitted_again_after_ttl() {
        let gate = gate(100);
        let r = record(72.0);
        assert_eq!(gate.admit_at(&r, t0()), Admission::Admitted);
        let later = t0() + chrono::Duration::hours(24) + chrono::Duration::seconds(1);
        assert_eq!(gate.admit_at(&r, later), Admission::Admitted);
        assert_eq!(gate.stats().expirations, 1);
    }

    #[test]
    fn test_duplicate_does_not_extend_ttl() {
        let gate = gate(100);
        let r = record(72.0);
        gate.admit_at(&r, t0());
        assert_eq!(
            gate.admit_at(&r, t0() + chrono::Duration::hours(23)),
            Admission::Duplicate
        );
        assert_eq!(
            gate.admit_at(&r, t0() + chrono::Duration::hours(25)),
            Admission::Admitted
        );
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let gate = gate(3);
        let (a, b, c, d) = (record(1.0), record(2.0), record(3.0), record(4.0));
        let now = t0();
        gate.admit_at(&a, now);
        gate.admit_at(&b, now);
        gate.admit_at(&c, now);
        // touching `a` makes `b` the least recently used
        assert_eq!(gate.admit_at(&a, now), Admission::Duplicate);
        gate.admit_at(&d, now);

        assert_eq!(gate.len(), 3);
        assert!(gate.contains_at(&a.fingerprint(), now));
        assert!(!gate.contains_at(&b.fingerprint(), now));
        assert!(gate.contains_at(&d.fingerprint(), now));
        assert_eq!(gate.stats().evictions, 1);
    }

    #[test]
    fn test_overflow_purges_expired_before_lru() {
        let gate = DuplicateGate::new(GateConfig {
            ttl: Duration::from_secs(60),
            max_entries: 2,
            ..Default::default()
        });
        let (a, b, c) = (record(1.0), record(2.0), record(3.0));
        gate.admit_at(&a, t0());
        gate.admit_at(&b, t0() + chrono::Duration::seconds(30));
        // `a` has expired; it goes, `b` survives even though it is older than `c`
        let now = t0() + chrono::Duration::seconds(61);
        gate.admit_at(&c, now);

        let stats = gate.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
        assert!(gate.contains_at(&b.fingerprint(), now));
    }

    #[test]
    fn test_cleanup_expired() {
        let gate = DuplicateGate::new(GateConfig {
            ttl: Duration::from_secs(10),
            ..Default::default()
        });
        gate.admit_at(&record(1.0), t0());
        gate.admit_at(&record(2.0), t0() + chrono::Duration::seconds(5));
        assert_eq!(gate.cleanup_expired_at(t0() + chrono::Duration::seconds(12)), 1);
        assert_eq!(gate.len(), 1);
    }
}
