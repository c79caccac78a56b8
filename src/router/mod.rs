//! Payload classifier and router
//!
//! Normalizes an exporter payload into individual metric items, validates
//! each item and dispatches it through the ordered [`HANDLERS`] table.
//! Routing is pure: it has no side effects and every item yields exactly
//! one canonical record or one [`RouteFailure`].

pub mod handlers;
pub mod validation;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::dlq::DeadLetterCategory;
use crate::error::{SchemaError, TransformError};
use crate::types::CanonicalRecord;

pub use handlers::{FamilyHandler, TransformContext, HANDLERS};
pub use validation::{validate_item, MetricItem};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Source tag for items that carry none
    pub default_source: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_source: "health_auto_export".to_string(),
        }
    }
}

/// An item the router could not turn into a record
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFailure {
    /// Location of the item inside the payload
    pub path: String,
    /// The normalized item as it was handed to validation
    pub item: Value,
    /// Failure category
    pub category: DeadLetterCategory,
    /// Human readable detail
    pub detail: String,
}

/// Result of routing one payload
#[derive(Debug, Clone, Default)]
pub struct RouteOutcome {
    /// Records in payload order
    pub records: Vec<CanonicalRecord>,
    /// Items that failed validation or transformation
    pub failures: Vec<RouteFailure>,
}

impl RouteOutcome {
    /// Number of items seen
    pub fn item_count(&self) -> usize {
        self.records.len() + self.failures.len()
    }
}

/// Payload router
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    handlers: &'static [FamilyHandler],
}

impl Router {
    /// Create a router over the default handler table
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            handlers: HANDLERS,
        }
    }

    /// Route a payload into canonical records
    ///
    /// Fails only when the payload as a whole has an unrecognized shape;
    /// per-item problems are reported in [`RouteOutcome::failures`].
    pub fn route(&self, payload: &Value) -> Result<RouteOutcome, SchemaError> {
        let items = normalize(payload)?;
        let mut outcome = RouteOutcome::default();

        for (path, item) in items {
            match validate_item(&path, &item) {
                Ok(metric) => match self.dispatch(&metric) {
                    Ok(record) => outcome.records.push(record),
                    Err(err) => outcome.failures.push(RouteFailure {
                        path,
                        item,
                        category: err.category(),
                        detail: err.to_string(),
                    }),
                },
                Err(err) => outcome.failures.push(RouteFailure {
                    path,
                    category: err.category(),
                    detail: err.to_string(),
                    item,
                }),
            }
        }

        debug!(
            records = outcome.records.len(),
            failures = outcome.failures.len(),
            "Routed payload"
        );
        Ok(outcome)
    }

    /// Run one validated item through the handler table
    ///
    /// Handlers owning the exact metric name are tried before handlers that
    /// only match by predicate; a decline falls through to the next
    /// candidate.
    pub fn dispatch(&self, item: &MetricItem) -> Result<CanonicalRecord, TransformError> {
        let ctx = TransformContext {
            default_source: &self.config.default_source,
        };
        let name = item.normalized_name();

        let exact = self.handlers.iter().filter(|h| h.owns_name(&name));
        let by_predicate = self
            .handlers
            .iter()
            .filter(|h| !h.owns_name(&name) && (h.matches)(item));

        let mut last_decline = None;
        for handler in exact.chain(by_predicate) {
            match (handler.transform)(item, &ctx) {
                Ok(record) => {
                    trace!(metric = %item.name, handler = handler.name, "Item transformed");
                    return Ok(record);
                }
                Err(err @ TransformError::Declined { .. }) => {
                    trace!(metric = %item.name, handler = handler.name, "Handler declined item");
                    last_decline = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_decline.unwrap_or_else(|| TransformError::Declined {
            handler: "router",
            reason: format!("no handler accepted '{}'", item.name),
        }))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

/// Flatten a payload into `(path, item)` pairs
///
/// Three shapes are recognized:
/// - nested `{"data": {"metrics": [{name, units, data: [..]}], "workouts": [..]}}`
/// - flat `{"data": [..], ..envelope}`, items inherit envelope keys
/// - a single unwrapped metric object
pub fn normalize(payload: &Value) -> Result<Vec<(String, Value)>, SchemaError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| SchemaError::UnrecognizedShape {
            field: "$".to_string(),
            reason: "payload is not a JSON object".to_string(),
        })?;

    match obj.get("data") {
        None => Ok(vec![("$".to_string(), payload.clone())]),
        Some(Value::Array(items)) => {
            let envelope: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "data")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(items
                .iter()
                .enumerate()
                .map(|(i, item)| (format!("data[{}]", i), inherit(&envelope, item)))
                .collect())
        }
        Some(Value::Object(inner))
            if inner.contains_key("metrics") || inner.contains_key("workouts") =>
        {
            let mut out = Vec::new();
            match inner.get("metrics") {
                None | Some(Value::Null) => {}
                Some(Value::Array(metrics)) => {
                    for (i, metric) in metrics.iter().enumerate() {
                        expand_metric(&format!("data.metrics[{}]", i), metric, &mut out);
                    }
                }
                Some(_) => return Err(shape_error("data.metrics", "expected a list of metrics")),
            }
            match inner.get("workouts") {
                None | Some(Value::Null) => {}
                Some(Value::Array(workouts)) => {
                    out.extend(
                        workouts
                            .iter()
                            .enumerate()
                            .map(|(i, w)| (format!("data.workouts[{}]", i), w.clone())),
                    );
                }
                Some(_) => {
                    return Err(shape_error("data.workouts", "expected a list of workouts"))
                }
            }
            Ok(out)
        }
        Some(_) => Err(shape_error(
            "data",
            "expected a list of items or an object with metrics",
        )),
    }
}

/// Expand one nested metric into its points, each carrying the metric name
/// and units
fn expand_metric(path: &str, metric: &Value, out: &mut Vec<(String, Value)>) {
    let Some(obj) = metric.as_object() else {
        out.push((path.to_string(), metric.clone()));
        return;
    };
    let points = match obj.get("data") {
        Some(Value::Array(points)) => points,
        // A metric without a points list is validated as a single item
        _ => {
            out.push((path.to_string(), metric.clone()));
            return;
        }
    };

    for (j, point) in points.iter().enumerate() {
        let point_path = format!("{}.data[{}]", path, j);
        let item = match point {
            Value::Object(p) => {
                let mut item = p.clone();
                if let Some(name) = obj.get("name") {
                    item.insert("name".to_string(), name.clone());
                }
                if let Some(units) = obj.get("units").filter(|u| !u.is_null()) {
                    item.entry("units").or_insert_with(|| units.clone());
                }
                Value::Object(item)
            }
            other => other.clone(),
        };
        out.push((point_path, item));
    }
}

/// Merge envelope keys under an item; keys already on the item win
fn inherit(envelope: &Map<String, Value>, item: &Value) -> Value {
    match item {
        Value::Object(fields) => {
            let mut merged = envelope.clone();
            for (k, v) in fields {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        other => other.clone(),
    }
}

fn shape_error(field: &str, reason: &str) -> SchemaError {
    SchemaError::UnrecognizedShape {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
