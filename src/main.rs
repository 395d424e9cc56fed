use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use rag_assistant::core::config::{AppPaths, ConfigService};
use rag_assistant::core::logging;
use rag_assistant::server;
use rag_assistant::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = Arc::new(AppPaths::from_env());
    paths
        .ensure_dirs()
        .with_context(|| format!("Failed to create {}", paths.data_dir.display()))?;
    logging::init(&paths.log_dir);

    let config_service = ConfigService::new(paths.clone());
    let config = config_service
        .load()
        .with_context(|| format!("Failed to load {}", config_service.config_path().display()))?;
    tracing::debug!(
        "Effective configuration: {}",
        config_service.redact_sensitive_values(&config)
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::initialize(config, paths).await?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    let addr = listener.local_addr()?;

    println!("RAG_ASSISTANT_PORT={}", addr.port());
    tracing::info!("Listening on {}", addr);

    let app: Router = server::router::router(state);
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
