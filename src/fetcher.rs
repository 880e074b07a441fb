use crate::config::SourceConfig;
use crate::error::{AppError, Result};
use crate::transform::RawForecastRecord;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Fetcher {
    client: Client,
    base_url: String,
    lang: String,
    max_retries: u32,
    initial_backoff: Duration,
    request_delay: Duration,
}

impl Fetcher {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("forecast-etl/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(source.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: source.base_url.trim_end_matches('/').to_string(),
            lang: source.lang.clone(),
            max_retries: source.max_retries,
            initial_backoff: Duration::from_millis(source.initial_backoff_ms),
            request_delay: Duration::from_millis(source.request_delay_ms),
        })
    }

    /// Fetch forecasts for every entity, one at a time.
    ///
    /// Entities that fail are logged and skipped, so the result may be
    /// partial or empty.
    pub async fn fetch_forecasts(
        &self,
        api_key: &str,
        entities: &BTreeMap<String, i64>,
    ) -> Vec<RawForecastRecord> {
        let mut all_records = Vec::new();

        for (idx, (name, id)) in entities.iter().enumerate() {
            if idx > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            match self.fetch_entity(api_key, name, *id).await {
                Ok(records) => {
                    info!("Extracted {} records for {}", records.len(), name);
                    all_records.extend(records);
                }
                Err(AppError::Extraction(msg)) => {
                    warn!("{}", msg);
                }
                Err(e) => {
                    error!("Giving up on {} ({}): {}", name, id, e);
                }
            }
        }

        info!("Extraction finished: {} records total", all_records.len());
        all_records
    }

    pub async fn fetch_entity(
        &self,
        api_key: &str,
        name: &str,
        entity_id: i64,
    ) -> Result<Vec<RawForecastRecord>> {
        let body = retry_with_backoff(self.max_retries, self.initial_backoff, || async {
            self.request(api_key, entity_id).await
        })
        .await?;

        split_response(body).ok_or_else(|| {
            AppError::Extraction(format!("Unexpected response for {}: 'list' or 'city' missing", name))
        })
    }

    async fn request(&self, api_key: &str, entity_id: i64) -> Result<Value> {
        debug!("Requesting forecast for entity {} from {}", entity_id, self.base_url);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("id", entity_id.to_string()),
                ("appid", api_key.to_string()),
                ("lang", self.lang.clone()),
            ])
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<Value>().await?)
    }
}

/// Turn a forecast response into per-slot records tagged with the city.
///
/// Returns `None` when the payload lacks `list` or `city`.
pub fn split_response(body: Value) -> Option<Vec<RawForecastRecord>> {
    let Value::Object(mut body) = body else {
        return None;
    };

    let city = body.remove("city")?;
    let list = match body.remove("list")? {
        Value::Array(items) => items,
        _ => return None,
    };

    let city_id = city.get("id").cloned().unwrap_or(Value::Null);
    let city_name = city.get("name").cloned().unwrap_or(Value::Null);

    let records = list
        .into_iter()
        .map(|mut item| {
            if let Value::Object(fields) = &mut item {
                fields.insert("city_id".to_string(), city_id.clone());
                fields.insert("city_name".to_string(), city_name.clone());
            }
            item
        })
        .collect();

    Some(records)
}

/// Retry a future with exponential backoff, making at most `max_attempts`
/// calls in total
async fn retry_with_backoff<F, Fut, T>(
    max_attempts: u32,
    initial_backoff: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempts += 1;

                if attempts >= max_attempts {
                    return Err(e);
                }

                if !is_transient(&e) {
                    return Err(e);
                }

                let delay = initial_backoff * 2u32.pow(attempts - 1);
                warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempts, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Timeouts, connection failures and 5xx responses are worth retrying;
/// any other HTTP status is final for that entity.
fn is_transient(e: &AppError) -> bool {
    match e {
        AppError::Http(reqwest_err) => match reqwest_err.status() {
            Some(status) => status.is_server_error(),
            None => {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            }
        },
        _ => false,
    }
}
