//! Per-(entity, day) derived metrics and their join back onto each row.

use super::units::{kelvin_to_celsius, kelvin_to_fahrenheit};
use crate::db::models::{EnrichedRow, NormalizedRow};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use std::collections::BTreeMap;

pub const TREND_START_HOUR: u32 = 0;
pub const TREND_END_HOUR: u32 = 12;

type GroupKey = (i64, NaiveDate);

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DailyAggregate {
    pub avg_temp_c: Option<f64>,
    pub avg_feels_like_c: Option<f64>,
    pub humidity_trend: Option<f64>,
}

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    temp_c: Mean,
    feels_like_c: Mean,
    humidity_start: Mean,
    humidity_end: Mean,
}

fn group_key(row: &NormalizedRow) -> GroupKey {
    (row.entity_id, row.forecast_time.date_naive())
}

/// Compute daily means and the 00h→12h humidity trend per entity and UTC day.
pub fn daily_aggregates(rows: &[NormalizedRow]) -> BTreeMap<GroupKey, DailyAggregate> {
    let mut acc: BTreeMap<GroupKey, Accumulator> = BTreeMap::new();

    for row in rows {
        let entry = acc.entry(group_key(row)).or_default();
        entry.temp_c.push(row.temp_k.map(kelvin_to_celsius));
        entry.feels_like_c.push(row.feels_like_k.map(kelvin_to_celsius));

        match row.forecast_time.hour() {
            TREND_START_HOUR => entry.humidity_start.push(row.humidity),
            TREND_END_HOUR => entry.humidity_end.push(row.humidity),
            _ => {}
        }
    }

    acc.into_iter()
        .map(|(key, a)| {
            let humidity_trend = match (a.humidity_end.value(), a.humidity_start.value()) {
                (Some(end), Some(start)) => Some(end - start),
                _ => None,
            };

            (
                key,
                DailyAggregate {
                    avg_temp_c: a.temp_c.value(),
                    avg_feels_like_c: a.feels_like_c.value(),
                    humidity_trend,
                },
            )
        })
        .collect()
}

/// Enrich every row with unit conversions, the batch load time and its
/// group's daily aggregates.
pub fn aggregate(rows: Vec<NormalizedRow>, load_time: DateTime<Utc>) -> Vec<EnrichedRow> {
    let daily = daily_aggregates(&rows);

    rows.into_iter()
        .map(|row| {
            let agg = daily.get(&group_key(&row)).copied().unwrap_or_default();
            enrich(row, load_time, agg)
        })
        .collect()
}

fn enrich(row: NormalizedRow, load_time: DateTime<Utc>, agg: DailyAggregate) -> EnrichedRow {
    EnrichedRow {
        entity_id: row.entity_id,
        entity_name: row.entity_name,
        forecast_time: row.forecast_time,
        temp_c: row.temp_k.map(kelvin_to_celsius),
        temp_f: row.temp_k.map(kelvin_to_fahrenheit),
        feels_like_c: row.feels_like_k.map(kelvin_to_celsius),
        humidity: row.humidity,
        temp_min_k: row.temp_min_k,
        temp_max_k: row.temp_max_k,
        wind_speed: row.wind_speed,
        wind_deg: row.wind_deg,
        precip_prob: row.precip_prob,
        weather_main: row.weather_main,
        weather_description: row.weather_description,
        weather_icon: row.weather_icon,
        load_time,
        daily_avg_temp_c: agg.avg_temp_c,
        daily_avg_feels_like_c: agg.avg_feels_like_c,
        humidity_trend: agg.humidity_trend,
    }
}
