mod api;
mod artifact_store;
mod config;
mod error;
mod history;
mod models;
mod progress;
mod registry;
mod runner;
mod work;
mod workers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use config::Config;
use history::HistoryStore;
use registry::TaskRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<TaskRegistry>,
    pub history: Arc<HistoryStore>,
}

fn app(state: AppState) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/api/download", post(api::start_download))
        .route("/api/convert-video", post(api::convert_video))
        .route("/api/convert-text", post(api::convert_text))
        .route("/api/tasks/{task_id}", get(api::get_task))
        .route("/api/tasks/{task_id}/cancel", post(api::cancel_task))
        .route("/api/history", get(api::get_history))
        .route(
            "/api/reviews",
            get(api::list_reviews).post(api::add_review),
        )
        .route("/files/{file_name}", get(api::download_file))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediaforge_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    artifact_store::ensure_storage_root(&config.storage_root).await?;

    let history = HistoryStore::open(&config.history_db)
        .with_context(|| format!("Failed to open history db {}", config.history_db.display()))?;

    let state = AppState {
        config: config.clone(),
        registry: Arc::new(TaskRegistry::new()),
        history: Arc::new(history),
    };

    artifact_store::spawn_cleanup_worker(config.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("mediaforge-api listening on {}", config.bind_addr);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
