//! Staged merge-upsert of an enriched batch into the partitioned store.
//!
//! The loader writes the whole batch to a disposable staging table, checks
//! that it landed, then applies one atomic merge keyed by
//! (`entity_id`, `forecast_time`). Failures are logged and reported through
//! [`LoadOutcome`]; they never propagate to the caller.

use crate::db::models::{EnrichedRow, MergeResult};
use crate::error::Result;
use std::collections::HashMap;
use std::fmt;
use tracing::{error, info, warn};

/// Storage operations the loader needs from the backing store.
#[allow(async_fn_in_trait)]
pub trait ForecastStore {
    /// Human-readable target name for log lines.
    fn target_name(&self) -> String;

    /// Create the target table if it is missing. Returns `true` if created.
    async fn ensure_target_table(&self) -> Result<bool>;

    /// Replace the staging table's contents with `rows`. Returns rows written.
    async fn overwrite_staging(&self, rows: &[EnrichedRow]) -> Result<u64>;

    async fn staging_row_count(&self) -> Result<i64>;

    /// Upsert staging into the target in a single transaction.
    async fn merge_staging(&self) -> Result<MergeResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Provision,
    Stage,
    Verify,
    Merge,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStage::Provision => write!(f, "provision"),
            LoadStage::Stage => write!(f, "stage"),
            LoadStage::Verify => write!(f, "verify"),
            LoadStage::Merge => write!(f, "merge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Empty batch; the store was not touched.
    Skipped,
    /// The staging write reported success but left no rows.
    StagingEmpty,
    Merged {
        staged: u64,
        rows_affected: u64,
        partitions_created: usize,
    },
    Failed {
        stage: LoadStage,
        message: String,
    },
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoadOutcome::Merged { .. } | LoadOutcome::Skipped)
    }
}

pub struct Loader<S> {
    store: S,
}

impl<S: ForecastStore> Loader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn load(&self, rows: &[EnrichedRow]) -> LoadOutcome {
        if rows.is_empty() {
            warn!("Empty batch, nothing to load into {}", self.store.target_name());
            return LoadOutcome::Skipped;
        }

        match self.try_load(rows).await {
            Ok(outcome) => outcome,
            Err((stage, e)) => {
                error!(
                    "Load into {} failed during {} ({} rows in batch): {:?}",
                    self.store.target_name(),
                    stage,
                    rows.len(),
                    e
                );
                LoadOutcome::Failed {
                    stage,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn try_load(
        &self,
        rows: &[EnrichedRow],
    ) -> std::result::Result<LoadOutcome, (LoadStage, crate::error::AppError)> {
        let target = self.store.target_name();

        let created = self
            .store
            .ensure_target_table()
            .await
            .map_err(|e| (LoadStage::Provision, e))?;
        if created {
            info!("Created {} with daily partitions and entity_id clustering", target);
        } else {
            info!("Target table {} already exists", target);
        }

        let batch = dedupe_by_key(rows);
        if batch.len() < rows.len() {
            warn!(
                "Collapsed {} duplicate (entity_id, forecast_time) rows, last occurrence wins",
                rows.len() - batch.len()
            );
        }

        info!("Staging {} rows for {}", batch.len(), target);
        let written = self
            .store
            .overwrite_staging(&batch)
            .await
            .map_err(|e| (LoadStage::Stage, e))?;
        info!("Staging load finished: {} rows written", written);

        let staged = self
            .store
            .staging_row_count()
            .await
            .map_err(|e| (LoadStage::Verify, e))?;
        if staged <= 0 {
            warn!("Staging table is empty after load, merge aborted");
            return Ok(LoadOutcome::StagingEmpty);
        }

        info!("Staging holds {} rows, merging into {}", staged, target);
        let merged = self
            .store
            .merge_staging()
            .await
            .map_err(|e| (LoadStage::Merge, e))?;
        info!(
            "Merge complete: {} rows affected, {} new partitions",
            merged.rows_affected, merged.partitions_created
        );

        Ok(LoadOutcome::Merged {
            staged: staged as u64,
            rows_affected: merged.rows_affected,
            partitions_created: merged.partitions_created,
        })
    }
}

/// Keep one row per composite key; a later row replaces an earlier one in
/// place.
pub fn dedupe_by_key(rows: &[EnrichedRow]) -> Vec<EnrichedRow> {
    let mut index = HashMap::with_capacity(rows.len());
    let mut out: Vec<EnrichedRow> = Vec::with_capacity(rows.len());

    for row in rows {
        match index.get(&row.key()) {
            Some(&pos) => out[pos] = row.clone(),
            None => {
                index.insert(row.key(), out.len());
                out.push(row.clone());
            }
        }
    }

    out
}
