//! Completeness and outlier filtering.

use super::units::kelvin_to_celsius;
use crate::db::models::NormalizedRow;
use std::collections::BTreeMap;
use tracing::debug;

/// Rows further than this many standard deviations from their entity's mean
/// are dropped.
pub const OUTLIER_SIGMAS: f64 = 3.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QualityStats {
    pub input_rows: usize,
    pub missing_temperature: usize,
    pub outliers: usize,
}

/// Mean and sample standard deviation of one entity's temperatures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupStats {
    pub mean: f64,
    /// `None` when fewer than two readings exist.
    pub std_dev: Option<f64>,
}

impl GroupStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std_dev = if values.len() < 2 {
            None
        } else {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            Some(variance.sqrt()).filter(|s| s.is_finite())
        };

        Some(Self { mean, std_dev })
    }

    /// Whether `value` lies within `OUTLIER_SIGMAS` of the mean. An undefined
    /// deviation admits everything.
    pub fn admits(&self, value: f64) -> bool {
        match self.std_dev {
            Some(sigma) => (value - self.mean).abs() <= OUTLIER_SIGMAS * sigma,
            None => true,
        }
    }
}

pub fn filter(rows: Vec<NormalizedRow>) -> Vec<NormalizedRow> {
    filter_with_stats(rows).0
}

/// Completeness pass followed by the per-entity outlier pass.
///
/// Output is ordered by entity id; the relative order of rows within an
/// entity is preserved.
pub fn filter_with_stats(rows: Vec<NormalizedRow>) -> (Vec<NormalizedRow>, QualityStats) {
    let mut stats = QualityStats {
        input_rows: rows.len(),
        ..Default::default()
    };

    let mut groups: BTreeMap<i64, Vec<(f64, NormalizedRow)>> = BTreeMap::new();
    for row in rows {
        match row.temp_k {
            Some(k) => groups
                .entry(row.entity_id)
                .or_default()
                .push((kelvin_to_celsius(k), row)),
            None => stats.missing_temperature += 1,
        }
    }

    let mut kept = Vec::new();
    for (entity_id, group) in groups {
        let temps: Vec<f64> = group.iter().map(|(t, _)| *t).collect();
        let Some(group_stats) = GroupStats::from_values(&temps) else {
            continue;
        };

        let before = kept.len();
        kept.extend(
            group
                .into_iter()
                .filter(|(t, _)| group_stats.admits(*t))
                .map(|(_, row)| row),
        );

        let removed = temps.len() - (kept.len() - before);
        if removed > 0 {
            debug!(
                "Entity {}: removed {} outliers (mean {:.2}C, sd {:.2})",
                entity_id,
                removed,
                group_stats.mean,
                group_stats.std_dev.unwrap_or(0.0)
            );
        }
        stats.outliers += removed;
    }

    debug!(
        "Quality filter kept {}/{} rows ({} missing temperature, {} outliers)",
        kept.len(),
        stats.input_rows,
        stats.missing_temperature,
        stats.outliers
    );

    (kept, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn row(entity_id: i64, hour_offset: i64, temp_c: Option<f64>) -> NormalizedRow {
        NormalizedRow {
            entity_id,
            entity_name: Some(format!("city-{}", entity_id)),
            forecast_time: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
                + Duration::hours(3 * hour_offset),
            temp_k: temp_c.map(|c| c + 273.15),
            feels_like_k: None,
            humidity: Some(60.0),
            temp_min_k: None,
            temp_max_k: None,
            wind_speed: None,
            wind_deg: None,
            precip_prob: None,
            weather_main: None,
            weather_description: None,
            weather_icon: None,
        }
    }

    #[test]
    fn test_drops_missing_temperature() {
        let rows = vec![row(1, 0, Some(20.0)), row(1, 1, None), row(1, 2, Some(21.0))];
        let (kept, stats) = filter_with_stats(rows);
        assert_eq!(kept.len(), 2);
        assert_eq!(stats.missing_temperature, 1);
        assert!(kept.iter().all(|r| r.temp_k.is_some()));
    }

    #[test]
    fn test_removes_outlier_beyond_three_sigma() {
        let mut rows: Vec<_> = (0..20).map(|i| row(1, i, Some(20.0 + (i % 3) as f64 * 0.5))).collect();
        rows.push(row(1, 20, Some(60.0)));

        let (kept, stats) = filter_with_stats(rows);
        assert_eq!(stats.outliers, 1);
        assert_eq!(kept.len(), 20);
        assert!(kept.iter().all(|r| r.temp_k.unwrap() < 273.15 + 30.0));
    }

    #[test]
    fn test_survivors_within_bounds() {
        let mut rows: Vec<_> = (0..30)
            .map(|i| row(5, i, Some(15.0 + ((i * 7) % 11) as f64)))
            .collect();
        rows.push(row(5, 31, Some(-40.0)));
        let temps: Vec<f64> = rows.iter().map(|r| kelvin_to_celsius(r.temp_k.unwrap())).collect();
        let stats = GroupStats::from_values(&temps).unwrap();
        let sigma = stats.std_dev.unwrap();
        assert!(sigma > 0.0);

        for r in filter(rows) {
            let t = kelvin_to_celsius(r.temp_k.unwrap());
            assert!((t - stats.mean).abs() <= 3.0 * sigma);
        }
    }

    #[test]
    fn test_identical_values_keep_all_rows() {
        let rows: Vec<_> = (0..8).map(|i| row(2, i, Some(18.0))).collect();
        let (kept, stats) = filter_with_stats(rows);
        assert_eq!(kept.len(), 8);
        assert_eq!(stats.outliers, 0);
    }

    #[test]
    fn test_single_row_group_passes_through() {
        let rows = vec![row(9, 0, Some(-80.0))];
        assert_eq!(filter(rows).len(), 1);
        assert_eq!(GroupStats::from_values(&[4.0]).unwrap().std_dev, None);
    }

    #[test]
    fn test_groups_are_independent() {
        // Entity 1 is cold, entity 2 is hot; neither is an outlier of its own group.
        let mut rows: Vec<_> = (0..10).map(|i| row(1, i, Some(-5.0 + (i % 2) as f64))).collect();
        rows.extend((0..10).map(|i| row(2, i, Some(35.0 + (i % 2) as f64))));
        assert_eq!(filter(rows).len(), 20);
    }

    #[test]
    fn test_output_ordered_by_entity_and_stable_within() {
        let rows = vec![
            row(2, 0, Some(10.0)),
            row(1, 1, Some(11.0)),
            row(2, 2, Some(12.0)),
            row(1, 0, Some(13.0)),
        ];
        let kept = filter(rows);
        let order: Vec<(i64, i64)> = kept
            .iter()
            .map(|r| (r.entity_id, r.forecast_time.timestamp()))
            .collect();
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap().timestamp();
        assert_eq!(
            order,
            vec![
                (1, base + 3 * 3600),
                (1, base),
                (2, base),
                (2, base + 6 * 3600),
            ]
        );
    }

    #[test]
    fn test_sample_standard_deviation() {
        let stats = GroupStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((stats.mean - 5.0).abs() < 1e-12);
        // sample variance = 32 / 7
        assert!((stats.std_dev.unwrap() - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }
}
