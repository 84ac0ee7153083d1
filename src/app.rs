use std::{sync::Arc, time::Duration};

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::automation::AnalysisClient;
use crate::background::Background;
use crate::config::Config;
use crate::error::IngestError;
use crate::gateway::GatewayClient;
use crate::media::{serve_stored_media, LocalBlobStore};
use crate::store::PgStore;
use crate::types::AppState;
use crate::webhook::receive_webhook;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wa_ingest={log_level},tower_http=warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(receive_webhook))
        .route("/webhook/evolution", post(receive_webhook))
        .route("/api/media/{instance}/{file_name}", get(serve_stored_media))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn run() -> Result<(), IngestError> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    tokio::fs::create_dir_all(&config.media_storage_dir).await?;

    let db = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let background = Background::new(config.background_concurrency);
    let state = Arc::new(AppState {
        store: Arc::new(PgStore::new(db)),
        gateway: GatewayClient::new()?,
        blobs: Arc::new(LocalBlobStore::new(
            &config.media_storage_dir,
            &config.public_base_url,
        )),
        analysis: AnalysisClient::new(
            config.analysis_base_url.clone(),
            config.analysis_api_key.clone(),
        )?,
        background: background.clone(),
        automation_threshold: config.automation_threshold,
        media_storage_dir: config.media_storage_dir.clone(),
    });
    if !state.analysis.is_enabled() {
        tracing::warn!("ANALYSIS_BASE_URL not set; automation and transcription requests are disabled");
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "webhook ingestion listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    tracing::info!(in_flight = background.in_flight(), "draining background tasks");
    if tokio::time::timeout(SHUTDOWN_DRAIN, background.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(in_flight = background.in_flight(), "shutdown with background tasks still running");
    }
    Ok(())
}
