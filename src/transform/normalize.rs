//! Flattening of raw forecast payloads into [`NormalizedRow`]s.
//!
//! Every record is flattened into dotted paths (`main.temp`, `wind.deg`, ...)
//! and then passed through [`FIELD_MAP`], an explicit allow-list of the
//! paths this pipeline understands. Anything outside the allow-list is dropped
//! and reported once per batch, so upstream API drift shows up in the logs
//! instead of failing the run.

use super::RawForecastRecord;
use crate::db::models::NormalizedRow;
use crate::error::{AppError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Field {
    ForecastTs,
    TempK,
    FeelsLikeK,
    Humidity,
    TempMinK,
    TempMaxK,
    Weather,
    WindSpeed,
    WindDeg,
    PrecipProb,
    EntityId,
    EntityName,
}

/// Source path → column. Paths not listed here never reach the table.
const FIELD_MAP: &[(&str, Field)] = &[
    ("dt", Field::ForecastTs),
    ("main.temp", Field::TempK),
    ("main.feels_like", Field::FeelsLikeK),
    ("main.humidity", Field::Humidity),
    ("main.temp_min", Field::TempMinK),
    ("main.temp_max", Field::TempMaxK),
    ("weather", Field::Weather),
    ("wind.speed", Field::WindSpeed),
    ("wind.deg", Field::WindDeg),
    ("pop", Field::PrecipProb),
    ("city_id", Field::EntityId),
    ("city_name", Field::EntityName),
];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalizeStats {
    pub total_records: usize,
    pub rows: usize,
    /// Records without an entity id or forecast timestamp.
    pub missing_key: usize,
    pub unknown_paths: BTreeSet<String>,
}

/// Normalize a batch of raw records.
///
/// Returns `Ok(None)` when there is nothing to transform. Per-field absence is
/// never an error; only structurally unexpected input is.
pub fn normalize(records: &[RawForecastRecord]) -> Result<Option<Vec<NormalizedRow>>> {
    if records.is_empty() {
        warn!("No raw records to transform");
        return Ok(None);
    }

    let (rows, stats) = normalize_with_stats(records)?;

    if stats.missing_key > 0 {
        warn!(
            "Dropped {} of {} records without city_id or dt",
            stats.missing_key, stats.total_records
        );
    }

    if !stats.unknown_paths.is_empty() {
        debug!(
            "Ignored {} source fields outside the allow-list: {}",
            stats.unknown_paths.len(),
            stats
                .unknown_paths
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    debug!("Normalized {} rows from {} records", stats.rows, stats.total_records);
    Ok(Some(rows))
}

pub fn normalize_with_stats(
    records: &[RawForecastRecord],
) -> Result<(Vec<NormalizedRow>, NormalizeStats)> {
    let mut stats = NormalizeStats {
        total_records: records.len(),
        ..Default::default()
    };
    let mut rows = Vec::with_capacity(records.len());

    for (idx, record) in records.iter().enumerate() {
        let object = record.as_object().ok_or_else(|| {
            AppError::Transform(format!(
                "Record {} is not a JSON object: {}",
                idx,
                type_name(record)
            ))
        })?;

        let mut flat = BTreeMap::new();
        flatten("", object, &mut flat);

        let mut selected: BTreeMap<Field, &Value> = BTreeMap::new();
        for (path, value) in &flat {
            match FIELD_MAP.iter().find(|(p, _)| *p == path.as_str()) {
                Some((_, field)) => {
                    selected.insert(*field, *value);
                }
                None => {
                    stats.unknown_paths.insert(path.clone());
                }
            }
        }

        match build_row(&selected).map_err(|e| with_record_context(e, idx))? {
            Some(row) => rows.push(row),
            None => stats.missing_key += 1,
        }
    }

    stats.rows = rows.len();
    Ok((rows, stats))
}

fn flatten<'a>(prefix: &str, object: &'a Map<String, Value>, out: &mut BTreeMap<String, &'a Value>) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Object(inner) if !inner.is_empty() => flatten(&path, inner, out),
            _ => {
                out.insert(path, value);
            }
        }
    }
}

fn build_row(fields: &BTreeMap<Field, &Value>) -> Result<Option<NormalizedRow>> {
    let entity_id = integer_field(fields, Field::EntityId, "city_id")?;
    let forecast_time = match timestamp_field(fields, Field::ForecastTs, "dt")? {
        Some(ts) => Some(unix_to_utc(ts)?),
        None => None,
    };

    let (entity_id, forecast_time) = match (entity_id, forecast_time) {
        (Some(id), Some(time)) => (id, time),
        _ => return Ok(None),
    };

    let (weather_main, weather_description, weather_icon) =
        first_weather(fields.get(&Field::Weather).copied());

    Ok(Some(NormalizedRow {
        entity_id,
        entity_name: text_field(fields, Field::EntityName),
        forecast_time,
        temp_k: number_field(fields, Field::TempK, "main.temp")?,
        feels_like_k: number_field(fields, Field::FeelsLikeK, "main.feels_like")?,
        humidity: number_field(fields, Field::Humidity, "main.humidity")?,
        temp_min_k: number_field(fields, Field::TempMinK, "main.temp_min")?,
        temp_max_k: number_field(fields, Field::TempMaxK, "main.temp_max")?,
        wind_speed: number_field(fields, Field::WindSpeed, "wind.speed")?,
        wind_deg: number_field(fields, Field::WindDeg, "wind.deg")?,
        precip_prob: number_field(fields, Field::PrecipProb, "pop")?,
        weather_main,
        weather_description,
        weather_icon,
    }))
}

fn number_field(fields: &BTreeMap<Field, &Value>, field: Field, path: &str) -> Result<Option<f64>> {
    match fields.get(&field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(AppError::Transform(format!(
            "Field '{}' expected a number, got {}",
            path,
            type_name(other)
        ))),
    }
}

/// Integers may arrive as JSON integers, integral floats, or numeric strings.
fn integer_field(fields: &BTreeMap<Field, &Value>, field: Field, path: &str) -> Result<Option<i64>> {
    let invalid = |value: &Value| {
        AppError::Transform(format!("Field '{}' is not an integer: {}", path, value))
    };

    match fields.get(&field) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                return Ok(Some(i));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
                _ => Err(invalid(value)),
            }
        }
        Some(value @ Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid(value)),
        Some(other) => Err(invalid(*other)),
    }
}

/// Unix seconds; fractional values are truncated to whole seconds.
fn timestamp_field(fields: &BTreeMap<Field, &Value>, field: Field, path: &str) -> Result<Option<i64>> {
    match fields.get(&field) {
        Some(value @ Value::Number(n)) if n.as_i64().is_none() => match n.as_f64() {
            Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(Some(f.trunc() as i64)),
            _ => Err(AppError::Transform(format!(
                "Field '{}' is not a timestamp: {}",
                path, value
            ))),
        },
        _ => integer_field(fields, field, path),
    }
}

fn text_field(fields: &BTreeMap<Field, &Value>, field: Field) -> Option<String> {
    match fields.get(&field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `main`/`description`/`icon` of the first weather condition, if any.
fn first_weather(value: Option<&Value>) -> (Option<String>, Option<String>, Option<String>) {
    let first = match value.and_then(Value::as_array).and_then(|list| list.first()) {
        Some(Value::Object(obj)) => obj,
        _ => return (None, None, None),
    };

    let text = |key: &str| first.get(key).and_then(Value::as_str).map(str::to_string);
    (text("main"), text("description"), text("icon"))
}

fn unix_to_utc(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| AppError::Transform(format!("Timestamp {} is out of range", ts)))
}

fn with_record_context(err: AppError, idx: usize) -> AppError {
    match err {
        AppError::Transform(msg) => AppError::Transform(format!("Record {}: {}", idx, msg)),
        other => other,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
