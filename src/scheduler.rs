use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::loader::{ForecastStore, LoadOutcome, Loader};
use crate::secrets;
use crate::transform;
use chrono::Utc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The batch was merged (or was empty after transformation).
    Completed(LoadOutcome),
    /// Nothing was extracted or nothing was left to transform.
    NoData,
    /// The run stopped before loading.
    Failed(String),
    /// Transformation succeeded but the load did not.
    Degraded(LoadOutcome),
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }
}

/// One extract → transform → load pass.
pub struct Pipeline<S> {
    config: Config,
    loader: Loader<S>,
}

impl<S: ForecastStore> Pipeline<S> {
    pub fn new(config: Config, store: S) -> Self {
        Self {
            config,
            loader: Loader::new(store),
        }
    }

    pub fn loader(&self) -> &Loader<S> {
        &self.loader
    }

    pub async fn run_once(&self) -> RunOutcome {
        info!("--- Forecast ETL run starting ---");
        let started = Instant::now();

        let outcome = self.execute().await;

        info!(
            "--- Forecast ETL run finished in {:.2}s: {:?} ---",
            started.elapsed().as_secs_f64(),
            outcome
        );
        outcome
    }

    async fn execute(&self) -> RunOutcome {
        let secrets_cfg = &self.config.secrets;
        let Some(api_key) =
            secrets::get_api_key(&secrets_cfg.project_id, &secrets_cfg.secret_id, &secrets_cfg.dir)
        else {
            error!("Could not obtain the API key, aborting");
            return RunOutcome::Failed("API key not found".to_string());
        };

        let fetcher = match Fetcher::new(&self.config.source) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                error!("Failed to build HTTP client: {}", e);
                return RunOutcome::Failed(e.to_string());
            }
        };

        let raw = fetcher.fetch_forecasts(&api_key, &self.config.entities).await;
        if raw.is_empty() {
            warn!("No data extracted, finishing");
            return RunOutcome::NoData;
        }

        let load_time = Utc::now();
        let rows = match transform::transform_batch(&raw, load_time) {
            Ok(Some(rows)) => rows,
            Ok(None) => return RunOutcome::NoData,
            Err(e) => {
                error!("Transformation failed, load aborted: {:?}", e);
                return RunOutcome::Failed(e.to_string());
            }
        };

        let load = self.loader.load(&rows).await;
        if load.is_success() {
            RunOutcome::Completed(load)
        } else {
            RunOutcome::Degraded(load)
        }
    }
}

/// Repeats the pipeline on a fixed interval until shutdown.
pub struct Scheduler<S> {
    pipeline: Pipeline<S>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: ForecastStore> Scheduler<S> {
    pub fn new(pipeline: Pipeline<S>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            pipeline,
            shutdown_rx,
        }
    }

    pub async fn run(&mut self, interval_minutes: u64) {
        let scheduler_cfg = &self.pipeline.config.scheduler;
        let initial_delay = Duration::from_secs(scheduler_cfg.initial_delay_seconds);
        let poll_interval = Duration::from_secs(interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            scheduler_cfg.initial_delay_seconds, interval_minutes
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return;
            }
        }

        // Run immediately, then on interval
        self.pipeline.run_once().await;

        let mut ticker = interval(poll_interval);
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pipeline.run_once().await;
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::memory::MemoryStore;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str, secrets_dir: &std::path::Path) -> Config {
        let yaml = format!(
            r#"
database:
  host: localhost
  name: weather
  user: etl
  password: secret
secrets:
  project_id: demo
  secret_id: fetest-pipeline-key
  dir: {}
source:
  base_url: {}
  initial_backoff_ms: 1
entities:
  Salvador: 3450554
"#,
            secrets_dir.display(),
            base_url
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn forecast_body() -> serde_json::Value {
        json!({
            "cod": "200",
            "list": [
                {"dt": 1714608000, "main": {"temp": 300.15, "feels_like": 302.0, "humidity": 60}, "weather": [{"main": "Clear", "description": "céu limpo", "icon": "01n"}]},
                {"dt": 1714651200, "main": {"temp": 303.15, "feels_like": 306.0, "humidity": 72}, "weather": []}
            ],
            "city": {"id": 3450554, "name": "Salvador"}
        })
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            config("https://api.example.com/forecast", dir.path()),
            MemoryStore::default(),
        );

        assert!(pipeline.run_once().await.is_failure());
        assert!(pipeline.loader().store().target.lock().unwrap().is_none());
    }

    // The mock server speaks plain HTTP, so the config is built without
    // validation here.
    #[tokio::test]
    async fn test_full_run_merges_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("id", "3450554"))
            .and(query_param("appid", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(forecast_body()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fetest-pipeline-key"), "test-key").unwrap();

        let pipeline = Pipeline::new(config(&server.uri(), dir.path()), MemoryStore::default());

        match pipeline.run_once().await {
            RunOutcome::Completed(LoadOutcome::Merged { staged, .. }) => assert_eq!(staged, 2),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let store = pipeline.loader().store();
        assert_eq!(store.target_len(), 2);
        let target = store.target.lock().unwrap();
        let rows: Vec<_> = target.as_ref().unwrap().values().cloned().collect();
        // 00:00 humidity 60, 12:00 humidity 72 on 2024-05-02
        assert!(rows.iter().all(|r| r.humidity_trend == Some(12.0)));
        assert!(rows.iter().all(|r| r.entity_name.as_deref() == Some("Salvador")));
    }

    #[tokio::test]
    async fn test_client_error_yields_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fetest-pipeline-key"), "bad-key").unwrap();

        let pipeline = Pipeline::new(config(&server.uri(), dir.path()), MemoryStore::default());
        assert_eq!(pipeline.run_once().await, RunOutcome::NoData);
    }

    #[tokio::test]
    async fn test_malformed_payload_blocks_load() {
        let server = MockServer::start().await;
        let body = json!({
            "list": [{"dt": 1714608000, "main": {"temp": "warm"}}],
            "city": {"id": 3450554, "name": "Salvador"}
        });
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fetest-pipeline-key"), "test-key").unwrap();

        let pipeline = Pipeline::new(config(&server.uri(), dir.path()), MemoryStore::default());
        assert!(pipeline.run_once().await.is_failure());
        assert!(pipeline.loader().store().target.lock().unwrap().is_none());
    }
}
