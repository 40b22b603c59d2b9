mod config;
mod db;
mod geo;
mod models;
mod providers;
mod services;
mod sync;

use config::Config;
use providers::transit::TransitClient;
use sync::Tracker;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trip_tracker=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    info!(path = %config_path, "Loading configuration");
    let config = Config::load(&config_path)?;

    info!(
        stations = config.stations.len(),
        duration_minutes = config.duration_minutes,
        retention_minutes = config.retention_minutes,
        transfer_time = %config.transfer_time,
        timezone = %config.timezone,
        "Configuration loaded"
    );

    let pool = db::connect(&config.database_url).await?;
    let client = TransitClient::new(&config.api_base_url, config.request_timeout())?;

    Tracker::new(pool, Box::new(client), config).run().await;

    info!("Tracker stopped");
    Ok(())
}
