//! Metric-family handlers
//!
//! The handler table is plain data: an ordered slice of
//! [`FamilyHandler`] entries, each with an exact-name field table, a cheap
//! match predicate and a transform. The router tries handlers whose table
//! contains the metric name first, then handlers whose predicate matches, in
//! table order. The generic handler is last and matches everything.

use crate::error::TransformError;
use crate::types::{CanonicalRecord, CanonicalRecordBuilder, MetricFamily};

use super::validation::{ItemKind, MetricItem, SLEEP_AGGREGATE_KEYS};

/// Exact-name table mapping exporter metric names (lowercased) to fields
pub type FieldTable = &'static [(&'static str, &'static str)];

/// Per-call context handed to transforms
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// Source tag used when an item carries none
    pub default_source: &'a str,
}

impl TransformContext<'_> {
    fn source(&self, item: &MetricItem) -> String {
        item.source
            .clone()
            .unwrap_or_else(|| self.default_source.to_string())
    }
}

/// One entry of the dispatch table
#[derive(Clone, Copy)]
pub struct FamilyHandler {
    /// Handler name, used in logs and decline reasons
    pub name: &'static str,
    /// Family of the records it produces
    pub family: MetricFamily,
    /// Exact metric names this handler owns
    pub fields: FieldTable,
    /// Cheap predicate evaluated when no exact name matched
    pub matches: fn(&MetricItem) -> bool,
    /// Build the canonical record
    pub transform: fn(&MetricItem, &TransformContext<'_>) -> Result<CanonicalRecord, TransformError>,
}

impl FamilyHandler {
    /// Whether the metric name is in this handler's exact table
    pub fn owns_name(&self, normalized_name: &str) -> bool {
        lookup(self.fields, normalized_name).is_some()
    }
}

impl std::fmt::Debug for FamilyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyHandler")
            .field("name", &self.name)
            .field("family", &self.family)
            .finish()
    }
}

/// Default dispatch table, most specific first
pub static HANDLERS: &[FamilyHandler] = &[
    FamilyHandler {
        name: "workout",
        family: MetricFamily::Workout,
        fields: &[],
        matches: |item| item.kind == ItemKind::Workout,
        transform: transform_workout,
    },
    FamilyHandler {
        name: "heart",
        family: MetricFamily::Heart,
        fields: HEART_FIELDS,
        matches: |item| has_keyword(item, &["heart", "hrv", "pulse"]),
        transform: transform_heart,
    },
    FamilyHandler {
        name: "mobility",
        family: MetricFamily::Mobility,
        fields: MOBILITY_FIELDS,
        matches: |item| {
            has_keyword(
                item,
                &[
                    "walking_speed",
                    "walking_step",
                    "walking_asymmetry",
                    "walking_double",
                    "walking_steadiness",
                    "stair_speed",
                    "six_minute_walk",
                ],
            )
        },
        transform: transform_mobility,
    },
    FamilyHandler {
        name: "activity",
        family: MetricFamily::Activity,
        fields: ACTIVITY_FIELDS,
        matches: |item| {
            has_keyword(
                item,
                &["energy", "exercise", "stand", "flight", "walking_running"],
            )
        },
        transform: transform_activity,
    },
    FamilyHandler {
        name: "sleep",
        family: MetricFamily::Sleep,
        fields: &[],
        matches: |item| has_keyword(item, &["sleep", "inbed", "in_bed"]),
        transform: transform_sleep,
    },
    FamilyHandler {
        name: "body",
        family: MetricFamily::Body,
        fields: BODY_FIELDS,
        matches: |item| {
            has_keyword(
                item,
                &["body", "weight", "mass", "fat", "bmi", "lean", "waist", "height"],
            )
        },
        transform: transform_body,
    },
    FamilyHandler {
        name: "vitals",
        family: MetricFamily::Vitals,
        fields: VITALS_FIELDS,
        matches: |item| {
            has_keyword(
                item,
                &[
                    "oxygen",
                    "spo2",
                    "respiratory",
                    "blood_pressure",
                    "bloodpressure",
                    "systolic",
                    "diastolic",
                    "temperature",
                    "vo2",
                ],
            )
        },
        transform: transform_vitals,
    },
    FamilyHandler {
        name: "audio",
        family: MetricFamily::Audio,
        fields: AUDIO_FIELDS,
        matches: |item| {
            has_keyword(
                item,
                &[
                    "audio_exposure",
                    "audio_levels",
                    "headphone_audio",
                    "environmental_audio",
                ],
            )
        },
        transform: transform_audio,
    },
    FamilyHandler {
        name: "generic",
        family: MetricFamily::Other,
        fields: &[],
        matches: |_| true,
        transform: transform_generic,
    },
];

// ============================================================================
// Field tables
// ============================================================================

const HEART_FIELDS: FieldTable = &[
    ("heart_rate", "bpm"),
    ("heartrate", "bpm"),
    ("resting_heart_rate", "resting_bpm"),
    ("restingheartrate", "resting_bpm"),
    ("walking_heart_rate_average", "walking_bpm"),
    ("walkingheartrateaverage", "walking_bpm"),
    ("heart_rate_variability", "hrv_ms"),
    ("heartratevariabilitysdnn", "hrv_ms"),
    ("hrv", "hrv_ms"),
];

const MOBILITY_FIELDS: FieldTable = &[
    ("walking_speed", "speed_mps"),
    ("walkingspeed", "speed_mps"),
    ("walking_step_length", "step_length_cm"),
    ("walkingsteplength", "step_length_cm"),
    ("walking_asymmetry_percentage", "asymmetry_pct"),
    ("walkingasymmetrypercentage", "asymmetry_pct"),
    ("walking_double_support_percentage", "double_support_pct"),
    ("walkingdoublesupportpercentage", "double_support_pct"),
    ("stair_speed_up", "stair_ascent_speed"),
    ("stairspeedup", "stair_ascent_speed"),
    ("stair_speed_down", "stair_descent_speed"),
    ("stairspeeddown", "stair_descent_speed"),
    ("six_minute_walk_test_distance", "six_min_walk_m"),
    ("sixminutewalktestdistance", "six_min_walk_m"),
    ("walking_steadiness", "steadiness_pct"),
    ("walkingsteadiness", "steadiness_pct"),
];

const ACTIVITY_FIELDS: FieldTable = &[
    ("step_count", "steps"),
    ("stepcount", "steps"),
    ("steps", "steps"),
    ("active_energy", "active_calories"),
    ("activeenergy", "active_calories"),
    ("active_energy_burned", "active_calories"),
    ("activeenergyburned", "active_calories"),
    ("basal_energy_burned", "basal_calories"),
    ("basalenergyburned", "basal_calories"),
    ("distance_walking_running", "distance_m"),
    ("distancewalkingrunning", "distance_m"),
    ("walking_running_distance", "distance_m"),
    ("walkingrunningdistance", "distance_m"),
    ("exercise_time", "exercise_min"),
    ("exercisetime", "exercise_min"),
    ("apple_exercise_time", "exercise_min"),
    ("appleexercisetime", "exercise_min"),
    ("stand_time", "stand_min"),
    ("standtime", "stand_min"),
    ("apple_stand_time", "stand_min"),
    ("applestandtime", "stand_min"),
    ("stand_hour", "stand_hours"),
    ("standhour", "stand_hours"),
    ("apple_stand_hour", "stand_hours"),
    ("applestandhour", "stand_hours"),
    ("flights_climbed", "floors_climbed"),
    ("flightsclimbed", "floors_climbed"),
];

const BODY_FIELDS: FieldTable = &[
    ("body_mass", "weight_kg"),
    ("bodymass", "weight_kg"),
    ("weight", "weight_kg"),
    ("weight_body_mass", "weight_kg"),
    ("body_fat_percentage", "body_fat_pct"),
    ("bodyfatpercentage", "body_fat_pct"),
    ("body_mass_index", "bmi"),
    ("bodymassindex", "bmi"),
    ("bmi", "bmi"),
    ("lean_body_mass", "lean_mass_kg"),
    ("leanbodymass", "lean_mass_kg"),
    ("waist_circumference", "waist_cm"),
    ("waistcircumference", "waist_cm"),
    ("height", "height_cm"),
];

const VITALS_FIELDS: FieldTable = &[
    ("oxygen_saturation", "spo2_pct"),
    ("oxygensaturation", "spo2_pct"),
    ("blood_oxygen", "spo2_pct"),
    ("bloodoxygen", "spo2_pct"),
    ("blood_oxygen_saturation", "spo2_pct"),
    ("bloodoxygensaturation", "spo2_pct"),
    ("spo2", "spo2_pct"),
    ("respiratory_rate", "respiratory_rate"),
    ("respiratoryrate", "respiratory_rate"),
    ("blood_pressure_systolic", "bp_systolic"),
    ("bloodpressuresystolic", "bp_systolic"),
    ("systolic", "bp_systolic"),
    ("blood_pressure_diastolic", "bp_diastolic"),
    ("bloodpressurediastolic", "bp_diastolic"),
    ("diastolic", "bp_diastolic"),
    ("body_temperature", "temp_c"),
    ("bodytemperature", "temp_c"),
    ("temperature", "temp_c"),
    ("vo2max", "vo2max"),
    ("vo2_max", "vo2max"),
];

const AUDIO_FIELDS: FieldTable = &[
    ("headphone_audio_exposure", "headphone_db"),
    ("headphoneaudioexposure", "headphone_db"),
    ("headphone_audio_levels", "headphone_db"),
    ("headphoneaudiolevels", "headphone_db"),
    ("environmental_audio_exposure", "environmental_db"),
    ("environmentalaudioexposure", "environmental_db"),
];

// ============================================================================
// Transforms
// ============================================================================

fn transform_heart(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let name = item.normalized_name();
    let field = lookup(HEART_FIELDS, &name).unwrap_or("bpm");
    let builder = CanonicalRecord::builder(MetricFamily::Heart, item.date, ctx.source(item))
        .field_opt(field, item.qty)
        .field_opt(format!("{}_min", field), item.min)
        .field_opt(format!("{}_max", field), item.max)
        .field_opt(format!("{}_avg", field), item.avg);
    finish(builder, &item.name)
}

fn transform_mobility(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let name = item.normalized_name();
    let field = lookup(MOBILITY_FIELDS, &name).unwrap_or(name.as_str());
    let mut value = item.qty;
    if matches!(field, "asymmetry_pct" | "double_support_pct" | "steadiness_pct") {
        value = value.map(fraction_to_percent);
    }
    let builder = CanonicalRecord::builder(MetricFamily::Mobility, item.date, ctx.source(item))
        .field_opt(field, value);
    finish(builder, &item.name)
}

fn transform_activity(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let name = item.normalized_name();
    let field = lookup(ACTIVITY_FIELDS, &name).unwrap_or(name.as_str());
    let mut value = item.qty;
    if field == "distance_m" {
        value = value.map(|v| v * distance_multiplier(&item.units_lower()));
    }
    let builder = CanonicalRecord::builder(MetricFamily::Activity, item.date, ctx.source(item))
        .field_opt(field, value);
    finish(builder, &item.name)
}

fn transform_sleep(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    // The exporter reports sleep in hours; records are stored in minutes.
    let mul = if item.units_lower() == "hr" { 60.0 } else { 1.0 };
    let minutes = |v: Option<f64>| v.map(|v| v * mul);

    if item.has_any(SLEEP_AGGREGATE_KEYS) {
        let total = item.number("totalSleep").or_else(|| item.number("asleep"));
        let in_bed = item.number("inBed");
        let start = item.timestamp("sleepStart").unwrap_or(item.date);

        let mut builder = CanonicalRecord::builder(MetricFamily::Sleep, start, ctx.source(item))
            .field_opt("duration_min", minutes(total))
            .field_opt("deep_min", minutes(item.number("deep")))
            .field_opt("rem_min", minutes(item.number("rem")))
            .field_opt("core_min", minutes(item.number("core")))
            .field_opt("awake_min", minutes(item.number("awake")))
            .field_opt("in_bed_min", minutes(in_bed));
        if let (Some(total), Some(in_bed)) = (total, in_bed) {
            if in_bed > 0.0 && total > 0.0 {
                let quality = (total / in_bed * 1000.0).round() / 10.0;
                builder = builder.field("quality_score", quality);
            }
        }
        return finish(builder, &item.name);
    }

    let name = item.normalized_name();
    let field = if name.contains("asleep") && name.contains("deep") {
        "deep_min"
    } else if name.contains("asleep") && name.contains("rem") {
        "rem_min"
    } else if name.contains("asleep") && name.contains("core") {
        "core_min"
    } else if name.contains("awake") {
        "awake_min"
    } else if name.contains("inbed") || name.contains("in_bed") {
        "in_bed_min"
    } else if name.contains("asleep") {
        "duration_min"
    } else {
        return Err(TransformError::Declined {
            handler: "sleep",
            reason: format!("unrecognized sleep stage '{}'", item.name),
        });
    };

    let builder = CanonicalRecord::builder(MetricFamily::Sleep, item.date, ctx.source(item))
        .field_opt(field, minutes(item.qty));
    finish(builder, &item.name)
}

fn transform_workout(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let duration = item.number("duration").or_else(|| {
        item.end
            .map(|end| (end - item.date).num_milliseconds() as f64 / 60_000.0)
    });
    let distance = item.number("distance").map(|d| {
        d * item
            .nested_units("distance")
            .map_or(1.0, |u| distance_multiplier(&u))
    });

    let builder = CanonicalRecord::builder(MetricFamily::Workout, item.date, ctx.source(item))
        .tag("workout_type", sanitize_tag(&normalize_workout_type(&item.name)))
        .field_opt("duration_min", duration)
        .field_opt("calories", item.number("activeEnergy"))
        .field_opt("distance_m", distance)
        .field_opt("avg_hr", item.number("avgHeartRate"))
        .field_opt("max_hr", item.number("maxHeartRate"));
    finish(builder, &item.name)
}

fn transform_body(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let name = item.normalized_name();
    let field = lookup(BODY_FIELDS, &name).unwrap_or(name.as_str());
    let units = item.units_lower();
    let value = item.qty.map(|mut v| {
        if field == "weight_kg" && units.contains("lb") {
            v *= 0.453_592;
        }
        if matches!(field, "height_cm" | "waist_cm") && matches!(units.as_str(), "in" | "inch" | "inches") {
            v *= 2.54;
        }
        if matches!(field, "height_cm" | "waist_cm") && units == "m" {
            v *= 100.0;
        }
        v
    });
    let builder = CanonicalRecord::builder(MetricFamily::Body, item.date, ctx.source(item))
        .field_opt(field, value);
    finish(builder, &item.name)
}

fn transform_vitals(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let name = item.normalized_name();
    let field = lookup(VITALS_FIELDS, &name).unwrap_or(name.as_str());
    let units = item.units_lower();
    let convert = |v: f64| -> f64 {
        if field == "temp_c" && (units.contains("degf") || units.contains("°f") || units.contains("fahrenheit")) {
            (v - 32.0) * 5.0 / 9.0
        } else if field == "spo2_pct" {
            fraction_to_percent(v)
        } else {
            v
        }
    };
    let builder = CanonicalRecord::builder(MetricFamily::Vitals, item.date, ctx.source(item))
        .field_opt(field, item.qty.map(convert))
        .field_opt(format!("{}_min", field), item.min.map(convert))
        .field_opt(format!("{}_max", field), item.max.map(convert));
    finish(builder, &item.name)
}

fn transform_audio(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let name = item.normalized_name();
    let field = lookup(AUDIO_FIELDS, &name).unwrap_or(name.as_str());
    let builder = CanonicalRecord::builder(MetricFamily::Audio, item.date, ctx.source(item))
        .field_opt(field, item.qty);
    finish(builder, &item.name)
}

/// Catch-all: keeps unknown metrics as `{metric_type, unit, value}`
fn transform_generic(
    item: &MetricItem,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRecord, TransformError> {
    let mut builder = CanonicalRecord::builder(MetricFamily::Other, item.date, ctx.source(item))
        .tag("metric_type", sanitize_tag(&snake_case(&item.name)))
        .field_opt("value", item.qty)
        .field_opt("min", item.min)
        .field_opt("max", item.max)
        .field_opt("avg", item.avg);
    if let Some(units) = item.units.as_deref() {
        builder = builder.tag("unit", sanitize_tag(units));
    }
    finish(builder, &item.name)
}

// ============================================================================
// Helpers
// ============================================================================

fn finish(builder: CanonicalRecordBuilder, metric: &str) -> Result<CanonicalRecord, TransformError> {
    if builder.field_count() == 0 {
        return Err(TransformError::NoFields {
            metric: metric.to_string(),
        });
    }
    let record = builder.build();
    if let Some((field, _)) = record.fields().iter().find(|(_, v)| !v.is_finite()) {
        return Err(TransformError::NonFinite {
            field: field.clone(),
        });
    }
    Ok(record)
}

/// Case-insensitive lookup; `name` must already be normalized
fn lookup(table: FieldTable, name: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, field)| *field)
}

fn has_keyword(item: &MetricItem, keywords: &[&str]) -> bool {
    let name = item.normalized_name();
    keywords.iter().any(|k| name.contains(k))
}

/// Values at or below 1 are fractions and are scaled to percent
fn fraction_to_percent(v: f64) -> f64 {
    if v <= 1.0 {
        v * 100.0
    } else {
        v
    }
}

fn distance_multiplier(units: &str) -> f64 {
    match units {
        "km" => 1000.0,
        "mi" => 1609.344,
        _ => 1.0,
    }
}

/// Convert camelCase, spaces and hyphens to snake_case
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.map_or(false, |n| n.is_lowercase()),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c == ' ' || c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

/// Restrict tag values to a safe character set and bounded length
pub fn sanitize_tag(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '%' | '/') {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn normalize_workout_type(name: &str) -> String {
    let mut name = name.trim().to_lowercase();
    for prefix in ["hkworkoutactivitytype", "workout_"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest.to_string();
        }
    }
    let collapsed: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    let normalized = match collapsed.as_str() {
        "traditionalstrengthtraining" => "strength_training",
        "functionalstrengthtraining" => "functional_training",
        "highintensityintervaltraining" => "hiit",
        "stairclimbing" => "stair_climbing",
        "coretraining" => "core_training",
        "mindandbody" => "mind_and_body",
        _ => return name.replace(' ', "_"),
    };
    normalized.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::validation::validate_item;
    use serde_json::json;

    const CTX: TransformContext<'static> = TransformContext {
        default_source: "health_auto_export",
    };

    fn item(value: serde_json::Value) -> MetricItem {
        validate_item("$", &value).unwrap()
    }

    #[test]
    fn test_table_ends_with_catch_all() {
        let last = HANDLERS.last().unwrap();
        assert_eq!(last.family, MetricFamily::Other);
        let odd = item(json!({"name": "mindful_minutes", "date": "2024-01-15", "qty": 5}));
        assert!((last.matches)(&odd));
    }

    #[test]
    fn test_heart_with_min_max() {
        let record = transform_heart(
            &item(json!({"name": "heart_rate", "date": "2024-01-15 08:30:00 -0800", "qty": 72, "min": 60, "max": 90})),
            &CTX,
        )
        .unwrap();
        assert_eq!(record.family(), MetricFamily::Heart);
        assert_eq!(record.field("bpm"), Some(72.0));
        assert_eq!(record.field("bpm_min"), Some(60.0));
        assert_eq!(record.field("bpm_max"), Some(90.0));
        assert_eq!(record.source_tag(), "health_auto_export");
    }

    #[test]
    fn test_hrv_field_lookup() {
        let record = transform_heart(
            &item(json!({"name": "heartRateVariabilitySDNN", "date": "2024-01-15", "qty": 45})),
            &CTX,
        )
        .unwrap();
        assert_eq!(record.field("hrv_ms"), Some(45.0));
    }

    #[test]
    fn test_body_weight_pounds() {
        let record = transform_body(
            &item(json!({"name": "weight", "date": "2024-01-15", "qty": 100, "units": "lb"})),
            &CTX,
        )
        .unwrap();
        let kg = record.field("weight_kg").unwrap();
        assert!((kg - 45.3592).abs() < 1e-6);
    }

    #[test]
    fn test_vitals_conversions() {
        let temp = transform_vitals(
            &item(json!({"name": "body_temperature", "date": "2024-01-15", "qty": 98.6, "units": "degF"})),
            &CTX,
        )
        .unwrap();
        assert!((temp.field("temp_c").unwrap() - 37.0).abs() < 1e-9);

        let spo2 = transform_vitals(
            &item(json!({"name": "oxygen_saturation", "date": "2024-01-15", "qty": 0.97})),
            &CTX,
        )
        .unwrap();
        assert!((spo2.field("spo2_pct").unwrap() - 97.0).abs() < 1e-9);
    }

    #[test]
    fn test_sleep_aggregate() {
        let record = transform_sleep(
            &item(json!({
                "name": "sleep_analysis",
                "date": "2024-01-15",
                "sleepStart": "2024-01-14 23:00:00 +0000",
                "asleep": 7.0,
                "inBed": 8.0,
                "deep": 1.5,
                "units": "hr"
            })),
            &CTX,
        )
        .unwrap();
        assert_eq!(record.field("duration_min"), Some(420.0));
        assert_eq!(record.field("in_bed_min"), Some(480.0));
        assert_eq!(record.field("deep_min"), Some(90.0));
        assert_eq!(record.field("quality_score"), Some(87.5));
        assert_eq!(record.timestamp().to_rfc3339(), "2024-01-14T23:00:00+00:00");
    }

    #[test]
    fn test_sleep_unknown_stage_declines() {
        let err = transform_sleep(
            &item(json!({"name": "sleep_consistency", "date": "2024-01-15", "qty": 3})),
            &CTX,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::Declined { handler: "sleep", .. }));
    }

    #[test]
    fn test_workout_duration_derived() {
        let record = transform_workout(
            &item(json!({
                "name": "HKWorkoutActivityTypeTraditionalStrengthTraining",
                "start": "2024-01-15 07:00:00 +0000",
                "end": "2024-01-15 07:45:00 +0000",
                "activeEnergy": {"qty": 310, "units": "kcal"},
                "distance": {"qty": 2.5, "units": "km"}
            })),
            &CTX,
        )
        .unwrap();
        assert_eq!(record.field("duration_min"), Some(45.0));
        assert_eq!(record.field("calories"), Some(310.0));
        assert_eq!(record.field("distance_m"), Some(2500.0));
        assert_eq!(
            record.extra_tags().get("workout_type").map(String::as_str),
            Some("strength_training")
        );
    }

    #[test]
    fn test_generic_preserves_unknown_metric() {
        let record = transform_generic(
            &item(json!({"name": "mindfulMinutes", "date": "2024-01-15", "qty": 10, "units": "min"})),
            &CTX,
        )
        .unwrap();
        assert_eq!(record.family(), MetricFamily::Other);
        assert_eq!(record.field("value"), Some(10.0));
        assert_eq!(
            record.extra_tags().get("metric_type").map(String::as_str),
            Some("mindful_minutes")
        );
        assert_eq!(record.extra_tags().get("unit").map(String::as_str), Some("min"));
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("heartRateVariabilitySDNN"), "heart_rate_variability_sdnn");
        assert_eq!(snake_case("Walking Speed"), "walking_speed");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("HTTPServer"), "http_server");
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag("count/min"), "count/min");
        assert_eq!(sanitize_tag("a b,c=d"), "a_b_c_d");
        assert_eq!(sanitize_tag("  "), "unknown");
        assert_eq!(sanitize_tag(&"x".repeat(100)).len(), 64);
    }
}
