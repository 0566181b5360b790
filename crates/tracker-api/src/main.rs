//! Tracker REST API server: audited entity CRUD, bulk import and activity log.

use std::sync::Arc;
use tracker_api::config::{ApiConfig, Backend};
use tracker_api::server::{self, AppState};
use tracker_store::{InMemoryTrackerStore, SqliteTrackerStore, TrackerStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ApiConfig::from_env()?;
    let store: Arc<dyn TrackerStore> = match config.backend {
        Backend::Memory => Arc::new(InMemoryTrackerStore::new()),
        Backend::Sqlite => {
            tracing::info!(path = %config.sqlite_path.display(), "opening SQLite store");
            Arc::new(SqliteTrackerStore::new(&config.sqlite_path)?)
        }
    };

    let app = server::router(Arc::new(AppState { store }));
    tracing::info!(backend = ?config.backend, "tracker API listening on {}", config.listen);
    axum::serve(
        tokio::net::TcpListener::bind(config.listen).await?,
        app.into_make_service(),
    )
    .await?;
    Ok(())
}
