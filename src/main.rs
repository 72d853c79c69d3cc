mod agent;
mod config;
mod db;
mod errors;
mod models;
mod routes;
mod service;
mod tree;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::transcriber::{Transcriber, WhisperTranscriber};
use crate::agent::OllamaGenerator;
use crate::config::AppConfig;
use crate::db::{ChatStore, MemoryChatStore, PgChatStore};
use crate::routes::api_routes::{
    chat_messages_handler, health_handler, list_chats_handler, transcribe_handler,
    upload_audio_handler,
};
use crate::routes::ws_routes::ws_chat_handler;
use crate::routes::AppState;
use crate::service::{ChatService, SessionStore, TranscriptionService};

const MAX_AUDIO_BODY: usize = 25 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "branching_chat=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // ── Persistence ───────────────────────────────────────────────────────────
    let store: Arc<dyn ChatStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to PostgreSQL")?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;

            info!("Database connection established and migrations applied");
            Arc::new(PgChatStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL is not set; chats are kept in memory and lost on restart");
            Arc::new(MemoryChatStore::new())
        }
    };

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let generator = OllamaGenerator::new(
        &config.ollama_base_url,
        config.system_prompt.clone(),
        config.model.clone(),
    );
    info!("Generating with {} at {}", config.model.model_name, config.ollama_base_url);

    let transcriber: Option<Arc<dyn Transcriber>> = match &config.whisper_api_url {
        Some(url) => Some(Arc::new(WhisperTranscriber::new(url))),
        None => {
            warn!("WHISPER_API_URL is not set; transcription is disabled");
            None
        }
    };

    let state = AppState {
        chat: ChatService::new(Arc::new(SessionStore::new(store)), Arc::new(generator)),
        transcription: TranscriptionService::new(transcriber),
    };

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/ws", get(ws_chat_handler))
        .route("/api/chats", get(list_chats_handler))
        .route("/api/chats/{id}", get(chat_messages_handler))
        .route(
            "/api/upload_audio",
            post(upload_audio_handler).layer(DefaultBodyLimit::max(MAX_AUDIO_BODY)),
        )
        .route("/api/transcribe", post(transcribe_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
