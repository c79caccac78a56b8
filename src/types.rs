//! Core data types used throughout the ingestion pipeline

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metric family a canonical record belongs to
///
/// Each family is stored under its own measurement in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    /// Heart rate and HRV
    Heart,
    /// Walking analysis
    Mobility,
    /// Steps, energy, exercise and stand time
    Activity,
    /// Sleep analysis and stages
    Sleep,
    /// Workout sessions
    Workout,
    /// Body composition
    Body,
    /// SpO2, respiratory rate, blood pressure, temperature
    Vitals,
    /// Audio exposure
    Audio,
    /// Anything no specific handler claimed
    Other,
}

impl MetricFamily {
    /// Measurement name used by the storage backend
    pub fn measurement(&self) -> &'static str {
        match self {
            MetricFamily::Heart => "heart",
            MetricFamily::Mobility => "mobility",
            MetricFamily::Activity => "activity",
            MetricFamily::Sleep => "sleep",
            MetricFamily::Workout => "workout",
            MetricFamily::Body => "body",
            MetricFamily::Vitals => "vitals",
            MetricFamily::Audio => "audio",
            MetricFamily::Other => "other",
        }
    }

    /// All families
    pub fn all() -> &'static [MetricFamily] {
        &[
            MetricFamily::Heart,
            MetricFamily::Mobility,
            MetricFamily::Activity,
            MetricFamily::Sleep,
            MetricFamily::Workout,
            MetricFamily::Body,
            MetricFamily::Vitals,
            MetricFamily::Audio,
            MetricFamily::Other,
        ]
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.measurement())
    }
}

/// Normalized representation of one metric datapoint
///
/// Records are immutable once built; all access goes through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    family: MetricFamily,
    timestamp: DateTime<FixedOffset>,
    fields: BTreeMap<String, f64>,
    source_tag: String,
    extra_tags: BTreeMap<String, String>,
}

impl CanonicalRecord {
    /// Start building a record
    pub fn builder(
        family: MetricFamily,
        timestamp: DateTime<FixedOffset>,
        source_tag: impl Into<String>,
    ) -> CanonicalRecordBuilder {
        CanonicalRecordBuilder {
            record: CanonicalRecord {
                family,
                timestamp,
                fields: BTreeMap::new(),
                source_tag: source_tag.into(),
                extra_tags: BTreeMap::new(),
            },
        }
    }

    /// Metric family
    pub fn family(&self) -> MetricFamily {
        self.family
    }

    /// Measurement timestamp with its original offset
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    /// Field values, ordered by field name
    pub fn fields(&self) -> &BTreeMap<String, f64> {
        &self.fields
    }

    /// Single field value
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// Source tag
    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    /// Additional tags, ordered by key
    pub fn extra_tags(&self) -> &BTreeMap<String, String> {
        &self.extra_tags
    }

    /// Deterministic digest identifying this record for duplicate suppression
    ///
    /// Timestamps are normalized to UTC so the same instant reported with a
    /// different offset yields the same fingerprint. Field values are hashed by
    /// their bit pattern. Every string is length-prefixed and the tag and field
    /// sections carry their counts, so no choice of characters in a value can
    /// make two different records hash alike.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_str(&mut hasher, self.family.measurement());
        let utc = self.timestamp.with_timezone(&Utc);
        hasher.update(utc.timestamp().to_be_bytes());
        hasher.update(utc.timestamp_subsec_nanos().to_be_bytes());
        hash_str(&mut hasher, &self.source_tag);

        hasher.update((self.extra_tags.len() as u64).to_be_bytes());
        for (key, value) in &self.extra_tags {
            hash_str(&mut hasher, key);
            hash_str(&mut hasher, value);
        }
        hasher.update((self.fields.len() as u64).to_be_bytes());
        for (name, value) in &self.fields {
            hash_str(&mut hasher, name);
            hasher.update(value.to_bits().to_be_bytes());
        }

        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint(bytes)
    }

    /// Coordinate under which the backend stores this point
    pub fn write_key(&self) -> WriteKey {
        WriteKey {
            measurement: self.family.measurement(),
            timestamp_ns: timestamp_nanos(&self.timestamp),
            source_tag: self.source_tag.clone(),
            extra_tags: self.extra_tags.clone(),
        }
    }
}

/// Builder for [`CanonicalRecord`]
#[derive(Debug, Clone)]
pub struct CanonicalRecordBuilder {
    record: CanonicalRecord,
}

impl CanonicalRecordBuilder {
    /// Add a numeric field
    pub fn field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.record.fields.insert(name.into(), value);
        self
    }

    /// Add a numeric field if the value is present
    pub fn field_opt(self, name: impl Into<String>, value: Option<f64>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    /// Add an extra tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.record.extra_tags.insert(key.into(), value.into());
        self
    }

    /// Number of fields added so far
    pub fn field_count(&self) -> usize {
        self.record.fields.len()
    }

    /// Finish the record
    pub fn build(self) -> CanonicalRecord {
        self.record
    }
}

/// 128-bit record fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    /// Parse from the 32-character lowercase hex form
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint '{}'", s)))
    }
}

/// Idempotent write coordinate: rewriting the same key overwrites the point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteKey {
    /// Measurement name
    pub measurement: &'static str,
    /// Unix timestamp in nanoseconds
    pub timestamp_ns: i64,
    /// Source tag
    pub source_tag: String,
    /// Series tags beyond the source
    pub extra_tags: BTreeMap<String, String>,
}

/// Time range for dead-letter queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start (inclusive)
    pub start: DateTime<Utc>,
    /// End (inclusive)
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Check if an instant falls within this range
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Unix nanoseconds, saturating outside the representable range
pub(crate) fn timestamp_nanos(ts: &DateTime<FixedOffset>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or_else(|| {
        if ts.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}
