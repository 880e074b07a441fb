use crate::db::schema::MAX_TABLE_NAME_LEN;
use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_entities")]
    pub entities: BTreeMap<String, i64>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Where the forecast API key lives.
#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    pub project_id: String,
    pub secret_id: String,
    #[serde(default = "default_secrets_dir")]
    pub dir: PathBuf,
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/run/secrets")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default)]
    pub request_delay_ms: u64,
}

fn default_base_url() -> String {
    "https://api.openweathermap.org/data/2.5/forecast".to_string()
}

fn default_lang() -> String {
    "pt_br".to_string()
}

fn default_timeout_seconds() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            lang: default_lang(),
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            request_delay_ms: 0,
        }
    }
}

/// Target and staging table names. All three must be plain SQL identifiers.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_staging_table")]
    pub staging_table: String,
}

fn default_schema() -> String {
    "weather_insights".to_string()
}

fn default_table() -> String {
    "forecasts".to_string()
}

fn default_staging_table() -> String {
    "forecasts_staging".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            table: default_table(),
            staging_table: default_staging_table(),
        }
    }
}

impl StorageConfig {
    pub fn target(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn staging(&self) -> String {
        format!("{}.{}", self.schema, self.staging_table)
    }
}

/// Without `interval_minutes` the pipeline runs once and exits.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
}

fn default_initial_delay() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: None,
            initial_delay_seconds: default_initial_delay(),
        }
    }
}

fn default_entities() -> BTreeMap<String, i64> {
    [
        ("Sao Paulo", 3448439),
        ("Rio de Janeiro", 3451190),
        ("Salvador", 3450554),
        ("Curitiba", 3464975),
        ("Porto Alegre", 3452925),
    ]
    .into_iter()
    .map(|(name, id)| (name.to_string(), id))
    .collect()
}

pub(crate) fn is_sql_identifier(name: &str) -> bool {
    regex_lite::Regex::new(r"^[a-z_][a-z0-9_]{0,62}$")
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration text, expanding `${VAR}` references first
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Valid port and pool ranges
    /// - Non-empty required fields
    /// - HTTPS source URL
    /// - Table names usable as bare SQL identifiers
    /// - A non-empty entity list
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
            ("PROJECT_ID", &self.secrets.project_id),
            ("SECRET_NAME", &self.secrets.secret_id),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        if self.secrets.project_id.is_empty() || self.secrets.secret_id.is_empty() {
            return Err(AppError::Config(
                "secrets.project_id and secrets.secret_id are required".to_string(),
            ));
        }

        match url::Url::parse(&self.source.base_url) {
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Invalid source base_url '{}': {}",
                    self.source.base_url, e
                )));
            }
            Ok(parsed) if parsed.scheme() != "https" => {
                return Err(AppError::Config(format!(
                    "Source base_url must use HTTPS, got: {}",
                    parsed.scheme()
                )));
            }
            Ok(_) => {}
        }

        if self.source.timeout_seconds == 0 {
            return Err(AppError::Config(
                "Source timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.source.max_retries == 0 {
            return Err(AppError::Config(
                "Source max_retries must allow at least one attempt".to_string(),
            ));
        }

        for (label, name) in [
            ("storage.schema", &self.storage.schema),
            ("storage.table", &self.storage.table),
            ("storage.staging_table", &self.storage.staging_table),
        ] {
            if !is_sql_identifier(name) {
                return Err(AppError::Config(format!(
                    "{} '{}' must be a lowercase SQL identifier (letters, digits, underscore)",
                    label, name
                )));
            }
        }

        if self.storage.table.len() > MAX_TABLE_NAME_LEN {
            return Err(AppError::Config(format!(
                "storage.table '{}' is longer than {} characters; daily partition names would be truncated",
                self.storage.table, MAX_TABLE_NAME_LEN
            )));
        }

        if self.storage.table == self.storage.staging_table {
            return Err(AppError::Config(
                "storage.table and storage.staging_table must differ".to_string(),
            ));
        }

        if self.entities.is_empty() {
            return Err(AppError::Config(
                "At least one entry is required under entities".to_string(),
            ));
        }

        if let Some(interval) = self.scheduler.interval_minutes {
            if interval == 0 {
                return Err(AppError::Config(
                    "Scheduler interval_minutes must be greater than 0".to_string(),
                ));
            }

            if interval < 60 {
                tracing::warn!(
                    "Scheduler interval of {} minutes is shorter than the 3-hour forecast step",
                    interval
                );
            }
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid expansion pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
database:
  host: localhost
  name: weather
  user: etl
  password: secret
secrets:
  project_id: demo
  secret_id: openweather_api_key
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.storage.target(), "weather_insights.forecasts");
        assert_eq!(config.storage.staging(), "weather_insights.forecasts_staging");
        assert_eq!(config.source.max_retries, 3);
        assert_eq!(config.source.initial_backoff_ms, 2000);
        assert_eq!(config.entities.len(), 5);
        assert_eq!(config.entities.get("Curitiba"), Some(&3464975));
        assert!(config.scheduler.interval_minutes.is_none());
    }

    #[test]
    fn test_custom_entities_replace_defaults() {
        let yaml = format!("{}entities:\n  Recife: 3390760\n", MINIMAL);
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entities.get("Recife"), Some(&3390760));
    }

    #[test]
    fn test_rejects_non_identifier_table() {
        let yaml = format!("{}storage:\n  table: \"forecasts; DROP\"\n", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("storage.table"));
    }

    #[test]
    fn test_rejects_table_name_without_room_for_partition_suffix() {
        let longest = "f".repeat(MAX_TABLE_NAME_LEN);
        let yaml = format!("{}storage:\n  table: {}\n", MINIMAL, longest);
        assert!(Config::from_yaml(&yaml).is_ok());

        let too_long = "f".repeat(MAX_TABLE_NAME_LEN + 1);
        let yaml = format!("{}storage:\n  table: {}\n", MINIMAL, too_long);
        let err = Config::from_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("storage.table"));
        assert!(err.contains("partition"));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let yaml = format!("{}source:\n  max_retries: 0\n", MINIMAL);
        let err = Config::from_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("max_retries"));
    }

    #[test]
    fn test_rejects_same_target_and_staging() {
        let yaml = format!(
            "{}storage:\n  table: forecasts\n  staging_table: forecasts\n",
            MINIMAL
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_rejects_http_base_url() {
        let yaml = format!(
            "{}source:\n  base_url: http://api.openweathermap.org/data/2.5/forecast\n",
            MINIMAL
        );
        let err = Config::from_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("HTTPS"));
    }

    #[test]
    fn test_missing_env_var_is_reported() {
        let yaml = MINIMAL.replace("secret\n", "${FORECAST_ETL_TEST_UNSET_VAR}\n");
        let err = Config::from_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("FORECAST_ETL_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_identifier_shape() {
        assert!(is_sql_identifier("forecasts_staging"));
        assert!(is_sql_identifier("_p2024"));
        assert!(!is_sql_identifier("Forecasts"));
        assert!(!is_sql_identifier("1forecasts"));
        assert!(!is_sql_identifier("weather.forecasts"));
    }

    #[test]
    fn test_port_deserialize_from_string() {
        let yaml = r#"
host: localhost
port: "5433"
name: test
user: test
password: test
"#;
        let config: DatabaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 5433);
    }

    #[test]
    fn test_port_deserialize_invalid_string() {
        let yaml = r#"
host: localhost
port: "not_a_number"
name: test
user: test
password: test
"#;
        let result: std::result::Result<DatabaseConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Invalid port number") || err_msg.contains("not_a_number"));
    }
}
