use crate::config::StorageConfig;
use crate::db::models::{EnrichedRow, MergeResult};
use crate::db::schema;
use crate::error::Result;
use crate::loader::ForecastStore;
use chrono::NaiveDate;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

/// Rows per INSERT statement; 19 binds per row stays well under the
/// protocol's 65535 parameter limit.
const BATCH_SIZE: usize = 1000;

pub struct Repository {
    pool: PgPool,
    storage: StorageConfig,
}

impl Repository {
    pub fn new(pool: PgPool, storage: StorageConfig) -> Self {
        Self { pool, storage }
    }

    pub async fn table_exists(&self, qualified_name: &str) -> Result<bool> {
        relation_exists(&mut *self.pool.acquire().await?, qualified_name).await
    }

    /// Number of rows currently in the target table
    pub async fn target_row_count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.storage.target());
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Fetch a single target row by its composite key
    pub async fn get_forecast(
        &self,
        entity_id: i64,
        forecast_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<EnrichedRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_id = $1 AND forecast_time = $2",
            schema::column_list(),
            self.storage.target()
        );
        let row = sqlx::query_as::<_, EnrichedRow>(&sql)
            .bind(entity_id)
            .bind(forecast_time)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Daily partitions currently attached to the target table
    pub async fn list_partitions(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT child.relname::text
            FROM pg_inherits
            JOIN pg_class parent ON parent.oid = pg_inherits.inhparent
            JOIN pg_class child ON child.oid = pg_inherits.inhrelid
            JOIN pg_namespace ns ON ns.oid = parent.relnamespace
            WHERE ns.nspname = $1 AND parent.relname = $2
            ORDER BY child.relname
            "#,
        )
        .bind(&self.storage.schema)
        .bind(&self.storage.table)
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }
}

async fn relation_exists(conn: &mut PgConnection, qualified_name: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, Option<String>>("SELECT to_regclass($1)::text")
        .bind(qualified_name)
        .fetch_one(conn)
        .await?;
    Ok(found.is_some())
}

impl ForecastStore for Repository {
    fn target_name(&self) -> String {
        self.storage.target()
    }

    async fn ensure_target_table(&self) -> Result<bool> {
        let target = self.storage.target();
        let mut tx = self.pool.begin().await?;

        if relation_exists(&mut *tx, &target).await? {
            tx.commit().await?;
            return Ok(false);
        }

        info!("Creating {} partitioned by day on forecast_time", target);
        sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.storage.schema))
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(&schema::create_target_table(&target))
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(&schema::create_cluster_index(&target, &self.storage.table))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Replace the staging table with a fresh one built from the declared
    /// columns, then load it, in one transaction
    async fn overwrite_staging(&self, rows: &[EnrichedRow]) -> Result<u64> {
        let staging = self.storage.staging();
        let mut tx = self.pool.begin().await?;

        sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.storage.schema))
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", staging))
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(&schema::create_staging_table(&staging))
            .execute(&mut *tx)
            .await?;

        let mut written = 0u64;
        let batches = rows.len().div_ceil(BATCH_SIZE);

        for (batch_idx, chunk) in rows.chunks(BATCH_SIZE).enumerate() {
            debug!(
                "Staging batch {}/{} ({} rows)",
                batch_idx + 1,
                batches,
                chunk.len()
            );

            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                staging,
                schema::column_list()
            ));

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.entity_id)
                    .push_bind(&row.entity_name)
                    .push_bind(row.forecast_time)
                    .push_bind(row.temp_c)
                    .push_bind(row.temp_f)
                    .push_bind(row.feels_like_c)
                    .push_bind(row.humidity)
                    .push_bind(row.temp_min_k)
                    .push_bind(row.temp_max_k)
                    .push_bind(row.wind_speed)
                    .push_bind(row.wind_deg)
                    .push_bind(row.precip_prob)
                    .push_bind(&row.weather_main)
                    .push_bind(&row.weather_description)
                    .push_bind(&row.weather_icon)
                    .push_bind(row.load_time)
                    .push_bind(row.daily_avg_temp_c)
                    .push_bind(row.daily_avg_feels_like_c)
                    .push_bind(row.humidity_trend);
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn staging_row_count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.storage.staging());
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Create any missing daily partitions, then MERGE staging into the
    /// target, all in one transaction
    async fn merge_staging(&self) -> Result<MergeResult> {
        let target = self.storage.target();
        let staging = self.storage.staging();
        let mut tx = self.pool.begin().await?;

        let days = sqlx::query_scalar::<_, NaiveDate>(&format!(
            "SELECT DISTINCT (forecast_time AT TIME ZONE 'UTC')::date FROM {} ORDER BY 1",
            staging
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut partitions_created = 0;
        for day in days {
            let partition = format!(
                "{}.{}",
                self.storage.schema,
                schema::partition_name(&self.storage.table, day)
            );
            if relation_exists(&mut *tx, &partition).await? {
                continue;
            }

            debug!("Creating partition {}", partition);
            sqlx::raw_sql(&schema::create_partition(
                &self.storage.schema,
                &self.storage.table,
                day,
            ))
            .execute(&mut *tx)
            .await?;
            partitions_created += 1;
        }

        let result = sqlx::raw_sql(&schema::merge_statement(&target, &staging))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(MergeResult {
            partitions_created,
            rows_affected: result.rows_affected(),
        })
    }
}
