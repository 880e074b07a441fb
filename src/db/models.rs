use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// One forecast slot after flattening and field selection.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub entity_id: i64,
    pub entity_name: Option<String>,
    pub forecast_time: DateTime<Utc>,

    pub temp_k: Option<f64>,
    pub feels_like_k: Option<f64>,
    pub humidity: Option<f64>,
    pub temp_min_k: Option<f64>,
    pub temp_max_k: Option<f64>,

    pub wind_speed: Option<f64>,
    pub wind_deg: Option<f64>,
    pub precip_prob: Option<f64>,

    pub weather_main: Option<String>,
    pub weather_description: Option<String>,
    pub weather_icon: Option<String>,
}

/// A row of the target table, in column order.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct EnrichedRow {
    pub entity_id: i64,
    pub entity_name: Option<String>,
    pub forecast_time: DateTime<Utc>,

    pub temp_c: Option<f64>,
    pub temp_f: Option<f64>,
    pub feels_like_c: Option<f64>,
    pub humidity: Option<f64>,
    pub temp_min_k: Option<f64>,
    pub temp_max_k: Option<f64>,

    pub wind_speed: Option<f64>,
    pub wind_deg: Option<f64>,
    pub precip_prob: Option<f64>,

    pub weather_main: Option<String>,
    pub weather_description: Option<String>,
    pub weather_icon: Option<String>,

    pub load_time: DateTime<Utc>,

    pub daily_avg_temp_c: Option<f64>,
    pub daily_avg_feels_like_c: Option<f64>,
    pub humidity_trend: Option<f64>,
}

impl EnrichedRow {
    pub fn key(&self) -> (i64, DateTime<Utc>) {
        (self.entity_id, self.forecast_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub partitions_created: usize,
    pub rows_affected: u64,
}
