use std::{sync::Arc, time::Duration};

use engine::{Engine, HttpLoyaltyClient};
use migration::{Migrator, MigratorTrait};
use settings::Database;

mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = settings::Settings::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "wheelhouse={level},engine={level}",
            level = settings.app.level
        ))
        .init();

    let db = parse_database(&settings.database).await?;
    let interval = Duration::from_secs(settings.engine.reconcile.interval_secs.max(1));

    let mut builder = Engine::builder().database(db).config(settings.engine);
    match settings.loyalty {
        Some(loyalty) => {
            tracing::info!(base_url = %loyalty.base_url, "Found loyalty settings...");
            let client = HttpLoyaltyClient::new(
                loyalty.base_url,
                loyalty.channel,
                loyalty.token,
                Duration::from_millis(loyalty.timeout_ms),
            )?;
            builder = builder.loyalty(Arc::new(client));
        }
        None => tracing::warn!("no loyalty settings, external syncs will not be retried"),
    }
    let engine = builder.build().await?;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.run_sweep().await {
                    Ok(report) => tracing::debug!(?report, "sweep finished"),
                    Err(err) => tracing::error!("sweep failed: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn parse_database(
    config: &Database,
) -> Result<sea_orm::DatabaseConnection, Box<dyn std::error::Error + Send + Sync>> {
    let url = match config {
        Database::Memory => String::from("sqlite::memory:"),
        Database::Sqlite(path) => format!("sqlite:{}?mode=rwc", path),
    };

    let database = sea_orm::Database::connect(url).await?;
    Migrator::up(&database, None).await?;
    Ok(database)
}
