pub mod aggregate;
pub mod normalize;
pub mod quality;
pub mod units;

use crate::db::models::EnrichedRow;
use crate::error::Result;
use chrono::{DateTime, Utc};
use tracing::info;

/// One forecast slot as returned by the API, with `city_id`/`city_name`
/// injected by the fetcher.
pub type RawForecastRecord = serde_json::Value;

/// Normalize, filter and enrich a raw batch.
///
/// `Ok(None)` means there was nothing to transform. Any error means the batch
/// must not be loaded.
pub fn transform_batch(
    records: &[RawForecastRecord],
    load_time: DateTime<Utc>,
) -> Result<Option<Vec<EnrichedRow>>> {
    let Some(rows) = normalize::normalize(records)? else {
        return Ok(None);
    };

    let rows = quality::filter(rows);
    let enriched = aggregate::aggregate(rows, load_time);

    info!(
        "Transformation complete: {} rows ready to load from {} raw records",
        enriched.len(),
        records.len()
    );

    Ok(Some(enriched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_empty_batch() {
        let load_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(transform_batch(&[], load_time).unwrap().is_none());
    }

    #[test]
    fn test_rows_without_temperature_are_not_loaded() {
        let load_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let records = vec![
            json!({"dt": 1705276800, "city_id": 1, "main": {"temp": 290.0, "humidity": 50}}),
            json!({"dt": 1705287600, "city_id": 1, "main": {"humidity": 50}}),
        ];

        let rows = transform_batch(&records, load_time).unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].forecast_time.timestamp(), 1705276800);
    }
}
