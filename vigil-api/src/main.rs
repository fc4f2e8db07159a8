//! VIGIL API Server Entry Point
//!
//! Loads configuration, initializes telemetry, connects the PostgreSQL pool
//! and runs the background sync loops until ctrl-c.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vigil_api::telemetry::init_tracing;
use vigil_api::{
    ApiResult, AppConfig, AppState, PgNotificationStore, PgUserStore, UserTables,
};
use vigil_events::{InMemoryEventBus, InMemoryKeyValue};

#[tokio::main]
async fn main() -> ApiResult<()> {
    let config = AppConfig::from_env();
    init_tracing(&config.telemetry)?;

    let pool = config.db.create_pool()?;
    let tables = UserTables::default();
    let user_store = Arc::new(PgUserStore::new(pool.clone(), tables.clone()));
    let notifications = Arc::new(PgNotificationStore::new(pool, tables));

    let bus = Arc::new(InMemoryEventBus::new());
    let kv = Arc::new(InMemoryKeyValue::new());

    let state = AppState::build(config, user_store, notifications, bus.clone(), kv)?;

    let shutdown = CancellationToken::new();
    let tasks = state.start_background_tasks(shutdown.clone())?;
    tracing::info!(
        service = %state.config.telemetry.service_name,
        "VIGIL API running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }

    shutdown.cancel();
    tasks.join().await;
    bus.close();

    tracing::info!("VIGIL API stopped");
    Ok(())
}
