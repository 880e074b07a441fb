use forecast_etl::config::Config;
use forecast_etl::db::Repository;
use forecast_etl::scheduler::{Pipeline, Scheduler};
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,forecast_etl=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Forecast ETL starting...");

    // Optional trigger payload, accepted for compatibility with event-driven invocation
    if let Some(payload) = std::env::args().nth(1) {
        match serde_json::from_str::<serde_json::Value>(&payload) {
            Ok(value) => debug!("Trigger payload: {}", value),
            Err(e) => debug!("Ignoring non-JSON trigger payload ({}): {}", e, payload),
        }
    }

    let config_path =
        std::env::var("FORECAST_ETL_CONFIG").unwrap_or_else(|_| "config/config.yaml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists (or point FORECAST_ETL_CONFIG at your file)\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            config_path
        )
    })?;
    info!(
        "Configuration loaded: {} entities, target {}",
        config.entities.len(),
        config.storage.target()
    );

    let connection_string = config.database.connection_string();
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&connection_string)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database: {}\n\n\
                 Host: {}:{}\n\
                 Database: {}\n\
                 User: {}\n\n\
                 Common fixes:\n\
                 1. Ensure PostgreSQL 15+ is running\n\
                 2. Check username/password are correct (DB_USER, DB_PASSWORD)\n\
                 3. Verify database exists: createdb {}\n\
                 4. Check host and port (DB_HOST, DB_PORT)",
                e,
                config.database.host,
                config.database.port,
                config.database.name,
                config.database.user,
                config.database.name
            )
        })?;

    info!(
        "Connected to database: {}@{}:{}/{}",
        config.database.user, config.database.host, config.database.port, config.database.name
    );

    let repository = Repository::new(pool, config.storage.clone());
    let interval_minutes = config.scheduler.interval_minutes;
    let pipeline = Pipeline::new(config, repository);

    let Some(interval_minutes) = interval_minutes else {
        let outcome = pipeline.run_once().await;
        if outcome.is_failure() {
            error!("Forecast ETL failed: {:?}", outcome);
            return Ok(ExitCode::FAILURE);
        }
        return Ok(ExitCode::SUCCESS);
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut scheduler = Scheduler::new(pipeline, shutdown_rx);
    scheduler.run(interval_minutes).await;

    info!("Forecast ETL shutting down");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
