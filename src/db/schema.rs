//! Column layout and DDL for the forecast tables.
//!
//! The same declared column list backs the target table, the staging table,
//! the staging insert and the merge statement, so the staged batch can never
//! drift from the target's types.

use chrono::{Duration, NaiveDate};

/// Columns of the target table in projection order.
pub const COLUMNS: &[(&str, &str)] = &[
    ("entity_id", "BIGINT NOT NULL"),
    ("entity_name", "TEXT"),
    ("forecast_time", "TIMESTAMPTZ NOT NULL"),
    ("temp_c", "DOUBLE PRECISION"),
    ("temp_f", "DOUBLE PRECISION"),
    ("feels_like_c", "DOUBLE PRECISION"),
    ("humidity", "DOUBLE PRECISION"),
    ("temp_min_k", "DOUBLE PRECISION"),
    ("temp_max_k", "DOUBLE PRECISION"),
    ("wind_speed", "DOUBLE PRECISION"),
    ("wind_deg", "DOUBLE PRECISION"),
    ("precip_prob", "DOUBLE PRECISION"),
    ("weather_main", "TEXT"),
    ("weather_description", "TEXT"),
    ("weather_icon", "TEXT"),
    ("load_time", "TIMESTAMPTZ NOT NULL"),
    ("daily_avg_temp_c", "DOUBLE PRECISION"),
    ("daily_avg_feels_like_c", "DOUBLE PRECISION"),
    ("humidity_trend", "DOUBLE PRECISION"),
];

/// Composite natural key used by the merge.
pub const KEY_COLUMNS: &[&str] = &["entity_id", "forecast_time"];

pub fn column_list() -> String {
    COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_definitions() -> String {
    COLUMNS
        .iter()
        .map(|(name, ty)| format!("{} {}", name, ty))
        .collect::<Vec<_>>()
        .join(",\n    ")
}

pub fn create_target_table(target: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n) PARTITION BY RANGE (forecast_time)",
        target,
        column_definitions()
    )
}

/// Clustering index on the entity id, propagated to every partition.
pub fn create_cluster_index(target: &str, table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {}_entity_id_idx ON {} (entity_id, forecast_time)",
        table, target
    )
}

pub fn create_staging_table(staging: &str) -> String {
    format!(
        "CREATE UNLOGGED TABLE {} (\n    {}\n)",
        staging,
        column_definitions()
    )
}

/// Length of the `_pYYYYMMDD` suffix appended to the table name.
const PARTITION_SUFFIX_LEN: usize = 10;

/// Longest table name whose partition names fit PostgreSQL's 63-byte
/// identifier limit.
pub const MAX_TABLE_NAME_LEN: usize = 63 - PARTITION_SUFFIX_LEN;

pub fn partition_name(table: &str, day: NaiveDate) -> String {
    format!("{}_p{}", table, day.format("%Y%m%d"))
}

/// DDL for the daily partition covering `day` (UTC midnight to midnight).
pub fn create_partition(schema: &str, table: &str, day: NaiveDate) -> String {
    let next = day + Duration::days(1);
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} PARTITION OF {}.{} \
         FOR VALUES FROM ('{} 00:00:00+00') TO ('{} 00:00:00+00')",
        schema,
        partition_name(table, day),
        schema,
        table,
        day.format("%Y-%m-%d"),
        next.format("%Y-%m-%d")
    )
}

/// Single-statement upsert of the staging table into the target.
///
/// Matched keys get every non-key column overwritten from staging; new keys
/// are inserted.
pub fn merge_statement(target: &str, staging: &str) -> String {
    let on_clause = KEY_COLUMNS
        .iter()
        .map(|c| format!("target.{c} = source.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let update_set = COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !KEY_COLUMNS.contains(name))
        .map(|c| format!("{c} = source.{c}"))
        .collect::<Vec<_>>()
        .join(",\n        ");

    let source_values = COLUMNS
        .iter()
        .map(|(name, _)| format!("source.{}", name))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "MERGE INTO {target} AS target\n\
         USING {staging} AS source\n\
         ON {on_clause}\n\
         WHEN MATCHED THEN\n    UPDATE SET\n        {update_set}\n\
         WHEN NOT MATCHED THEN\n    INSERT ({columns})\n    VALUES ({source_values})",
        columns = column_list(),
    )
}
