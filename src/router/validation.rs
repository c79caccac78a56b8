//! Schema validation for normalized metric items
//!
//! Turns a loosely typed JSON item into a [`MetricItem`] or a
//! [`SchemaError`] naming the offending field. Two schemas exist: the base
//! point schema (`name`, `date`, numeric value fields) and the workout schema
//! (`name`, `start`, `end`), selected by the presence of `start`/`end`.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::SchemaError;

/// Numeric keys every point item may carry
const VALUE_KEYS: &[&str] = &["qty", "min", "max", "avg"];

/// Aggregated sleep-analysis keys; an item carrying any of them needs no `qty`
pub(crate) const SLEEP_AGGREGATE_KEYS: &[&str] =
    &["asleep", "inBed", "deep", "rem", "core", "awake", "totalSleep"];

/// Numeric keys of a workout item
const WORKOUT_KEYS: &[&str] = &[
    "duration",
    "activeEnergy",
    "distance",
    "avgHeartRate",
    "maxHeartRate",
];

/// Optional timestamp keys validated when present
const OPTIONAL_TIME_KEYS: &[&str] = &["sleepStart", "sleepEnd"];

/// Shape of a validated item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Single timestamped sample
    Point,
    /// Session with a start and an end
    Workout,
}

/// A validated metric item ready for handler dispatch
#[derive(Debug, Clone)]
pub struct MetricItem {
    /// Metric name as sent by the exporter
    pub name: String,
    /// Item shape
    pub kind: ItemKind,
    /// Sample time, or workout start
    pub date: DateTime<FixedOffset>,
    /// Workout end
    pub end: Option<DateTime<FixedOffset>>,
    /// Primary quantity
    pub qty: Option<f64>,
    /// Minimum over the sample interval
    pub min: Option<f64>,
    /// Maximum over the sample interval
    pub max: Option<f64>,
    /// Average over the sample interval
    pub avg: Option<f64>,
    /// Units string
    pub units: Option<String>,
    /// Source device or app
    pub source: Option<String>,
    /// The full item, for family specific keys
    pub raw: Map<String, Value>,
}

impl MetricItem {
    /// Metric name lowercased with spaces and hyphens turned into underscores
    pub fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase().replace([' ', '-'], "_")
    }

    /// Numeric value of a family specific key (already validated)
    pub fn number(&self, key: &str) -> Option<f64> {
        self.raw.get(key).and_then(|v| parse_number(v).ok().flatten())
    }

    /// Units attached to a nested `{qty, units}` value
    pub fn nested_units(&self, key: &str) -> Option<String> {
        self.raw
            .get(key)
            .and_then(|v| v.get("units"))
            .and_then(Value::as_str)
            .map(str::to_lowercase)
    }

    /// Optional timestamp key (already validated)
    pub fn timestamp(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Whether any of the keys is present and non-null
    pub fn has_any(&self, keys: &[&str]) -> bool {
        keys.iter()
            .any(|k| self.raw.get(*k).map_or(false, |v| !v.is_null()))
    }

    /// Lowercased units, empty when absent
    pub fn units_lower(&self) -> String {
        self.units.as_deref().unwrap_or("").to_lowercase()
    }
}

/// Validate one normalized item located at `path`
pub fn validate_item(path: &str, value: &Value) -> Result<MetricItem, SchemaError> {
    let obj = value.as_object().ok_or_else(|| SchemaError::InvalidField {
        field: path.to_string(),
        reason: "metric item is not an object".to_string(),
    })?;

    let name = match obj.get("name") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            return Err(SchemaError::MissingField {
                field: join(path, "name"),
            })
        }
        Some(other) => {
            return Err(SchemaError::InvalidField {
                field: join(path, "name"),
                reason: format!("expected string, got {}", type_name(other)),
            })
        }
    };

    let is_workout = obj.contains_key("start") || obj.contains_key("end");
    let (kind, date, end) = if is_workout {
        let start = required_timestamp(obj, path, "start")?;
        let end = required_timestamp(obj, path, "end")?;
        if end < start {
            return Err(SchemaError::InvalidField {
                field: join(path, "end"),
                reason: "workout ends before it starts".to_string(),
            });
        }
        (ItemKind::Workout, start, Some(end))
    } else {
        (ItemKind::Point, required_timestamp(obj, path, "date")?, None)
    };

    for key in OPTIONAL_TIME_KEYS {
        match obj.get(*key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if parse_timestamp(s).is_some() => {}
            Some(other) => {
                return Err(SchemaError::InvalidField {
                    field: join(path, key),
                    reason: format!("unparseable timestamp {}", other),
                })
            }
        }
    }

    let workout_keys: &[&str] = if is_workout { WORKOUT_KEYS } else { &[] };
    for key in VALUE_KEYS
        .iter()
        .chain(SLEEP_AGGREGATE_KEYS)
        .chain(workout_keys)
    {
        if let Some(v) = obj.get(*key) {
            parse_number(v).map_err(|reason| SchemaError::InvalidField {
                field: join(path, key),
                reason,
            })?;
        }
    }

    let number = |key: &str| obj.get(key).and_then(|v| parse_number(v).ok().flatten());
    let qty = number("qty");
    let has_sleep_aggregate = SLEEP_AGGREGATE_KEYS
        .iter()
        .any(|k| obj.get(*k).map_or(false, |v| !v.is_null()));
    if kind == ItemKind::Point && qty.is_none() && !has_sleep_aggregate {
        return Err(SchemaError::MissingField {
            field: join(path, "qty"),
        });
    }

    Ok(MetricItem {
        name,
        kind,
        date,
        end,
        qty,
        min: number("min"),
        max: number("max"),
        avg: number("avg"),
        units: optional_string(obj, "units"),
        source: optional_string(obj, "source"),
        raw: obj.clone(),
    })
}

/// Parse an exporter timestamp
///
/// Accepts RFC 3339, the exporter's `YYYY-MM-DD HH:MM:SS ±hhmm`, naive
/// date-times (taken as UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

/// Parse a numeric JSON value
///
/// Numbers, numeric strings and `{"qty": n}` objects are accepted; `null`
/// yields `Ok(None)`.
pub fn parse_number(value: &Value) -> Result<Option<f64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("number {} is not representable", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("expected number, got string '{}'", s)),
        Value::Object(obj) => match obj.get("qty") {
            Some(inner @ (Value::Number(_) | Value::String(_) | Value::Null)) => {
                parse_number(inner)
            }
            _ => Err("expected number or {qty} object".to_string()),
        },
        other => Err(format!("expected number, got {}", type_name(other))),
    }
}

fn required_timestamp(
    obj: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<DateTime<FixedOffset>, SchemaError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(SchemaError::MissingField {
            field: join(path, key),
        }),
        Some(Value::String(s)) => parse_timestamp(s).ok_or_else(|| SchemaError::InvalidField {
            field: join(path, key),
            reason: format!("unparseable timestamp '{}'", s),
        }),
        Some(other) => Err(SchemaError::InvalidField {
            field: join(path, key),
            reason: format!("expected timestamp string, got {}", type_name(other)),
        }),
    }
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() || path == "$" {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_formats() {
        let exporter = parse_timestamp("2024-01-15 08:30:00 -0800").unwrap();
        assert_eq!(exporter.offset().local_minus_utc(), -8 * 3600);

        let rfc = parse_timestamp("2024-01-15T16:30:00Z").unwrap();
        assert_eq!(exporter, rfc);

        let naive = parse_timestamp("2024-01-15 16:30:00").unwrap();
        assert_eq!(naive, rfc);

        assert!(parse_timestamp("2024-01-15").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(&json!(72)), Ok(Some(72.0)));
        assert_eq!(parse_number(&json!("72.5")), Ok(Some(72.5)));
        assert_eq!(parse_number(&json!({"qty": 310, "units": "kcal"})), Ok(Some(310.0)));
        assert_eq!(parse_number(&Value::Null), Ok(None));
        assert!(parse_number(&json!("seventy")).is_err());
        assert!(parse_number(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_valid_point_item() {
        let item = validate_item(
            "data[0]",
            &json!({"name": "heart_rate", "date": "2024-01-15 08:30:00 -0800", "qty": 72, "source": "Watch"}),
        )
        .unwrap();
        assert_eq!(item.kind, ItemKind::Point);
        assert_eq!(item.qty, Some(72.0));
        assert_eq!(item.source.as_deref(), Some("Watch"));
    }

    #[test]
    fn test_missing_fields_are_named() {
        let err = validate_item("data[3]", &json!({"date": "2024-01-15", "qty": 1})).unwrap_err();
        assert_eq!(err.field(), "data[3].name");

        let err = validate_item("data[3]", &json!({"name": "steps", "qty": 1})).unwrap_err();
        assert_eq!(err.field(), "data[3].date");

        let err = validate_item("data[3]", &json!({"name": "steps", "date": "2024-01-15"})).unwrap_err();
        assert_eq!(err.field(), "data[3].qty");
    }

    #[test]
    fn test_invalid_numeric_field() {
        let err = validate_item(
            "$",
            &json!({"name": "steps", "date": "2024-01-15", "qty": 10, "max": "lots"}),
        )
        .unwrap_err();
        assert_eq!(err.field(), "max");
        assert!(matches!(err, SchemaError::InvalidField { .. }));
    }

    #[test]
    fn test_workout_schema() {
        let item = validate_item(
            "data.workouts[0]",
            &json!({"name": "Running", "start": "2024-01-15 07:00:00 +0000", "end": "2024-01-15 07:30:00 +0000"}),
        )
        .unwrap();
        assert_eq!(item.kind, ItemKind::Workout);
        assert!(item.end.is_some());

        let err = validate_item(
            "data.workouts[0]",
            &json!({"name": "Running", "start": "2024-01-15 07:00:00 +0000"}),
        )
        .unwrap_err();
        assert_eq!(err.field(), "data.workouts[0].end");

        let err = validate_item(
            "w",
            &json!({"name": "Running", "start": "2024-01-15 08:00:00 +0000", "end": "2024-01-15 07:00:00 +0000"}),
        )
        .unwrap_err();
        assert_eq!(err.field(), "w.end");
    }

    #[test]
    fn test_sleep_aggregate_needs_no_qty() {
        let item = validate_item(
            "$",
            &json!({"name": "sleep_analysis", "date": "2024-01-15", "asleep": 7.5, "inBed": 8.0}),
        )
        .unwrap();
        assert_eq!(item.qty, None);
        assert_eq!(item.number("inBed"), Some(8.0));
    }

    #[test]
    fn test_normalized_name() {
        let item = validate_item(
            "$",
            &json!({"name": "Walking Speed", "date": "2024-01-15", "qty": 1.2}),
        )
        .unwrap();
        assert_eq!(item.normalized_name(), "walking_speed");
    }
}
