mod problem;
mod router;
mod telemetry;

use std::net::SocketAddr;

use taskdesk_storage::{Database, DEFAULT_MAX_CONNECTIONS};
use taskdesk_util::{load_env_file, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let max_connections = config
        .database_max_connections
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);
    let database = Database::connect_with(&config.database_url, max_connections).await?;
    database.run_migrations().await?;
    database.verify_employee_schema().await?;
    info!(stage = "storage", max_connections, "database ready");

    let state = router::AppState::new(metrics, database);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
