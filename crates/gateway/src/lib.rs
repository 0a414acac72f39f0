//! HTTP API gateway for Distillery.
//!
//! Exposes the orchestrator over REST: run lifecycle, steps, forced
//! compression, memory and event inspection, and the scripted demos.
//!
//! Built on Axum for high performance async HTTP.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, header},
    response::Json,
    routing::get,
};
use distillery_agent::{LlmStrategy, Orchestrator};
use distillery_config::{AppConfig, StoreBackend};
use distillery_core::store::RunStore;
use distillery_memory::{FileSnapshotSink, InMemoryStore, SqliteStore};
use distillery_providers::FallbackProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use api_v1::{ApiV1State, SharedApiState};

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - CORS restricted to the local dashboard origin
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("http://localhost:8080"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Wire an orchestrator from configuration: the configured run store, file
/// snapshots, and an LLM strategy when a provider key is present.
pub async fn build_orchestrator(config: &AppConfig) -> distillery_core::Result<Orchestrator> {
    let store: Arc<dyn RunStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        StoreBackend::Sqlite => {
            let path = config.store.sqlite_path();
            if let Some(parent) = std::path::Path::new(&path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    distillery_core::Error::Config {
                        message: format!("cannot create store directory: {e}"),
                    }
                })?;
            }
            Arc::new(SqliteStore::new(&path).await?)
        }
    };

    let snapshots = Arc::new(FileSnapshotSink::new(&config.snapshots.dir));
    let mut orchestrator = Orchestrator::new(store, snapshots)
        .with_call_timeout(Duration::from_secs(config.llm_timeout_secs));

    if config.has_api_key() {
        if let Some(chain) = distillery_providers::build_from_config(config).chain() {
            orchestrator = attach_chain(orchestrator, chain, config);
        }
    }

    info!(
        store = orchestrator.store_name(),
        snapshots = %config.snapshots.dir,
        llm = orchestrator.has_llm(),
        "Orchestrator ready"
    );
    Ok(orchestrator)
}

/// Hand the provider chain to the orchestrator as its LLM strategy. Each agent
/// call may walk the whole chain, so the call timeout is the chain's budget.
fn attach_chain(
    orchestrator: Orchestrator,
    chain: Arc<FallbackProvider>,
    config: &AppConfig,
) -> Orchestrator {
    let budget = chain.budget();
    orchestrator.with_call_timeout(budget).with_llm(Arc::new(
        LlmStrategy::new(chain, &config.default_model).with_max_tokens(config.default_max_tokens),
    ))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let orchestrator = build_orchestrator(&config).await?;
    let state = Arc::new(ApiV1State::new(Arc::new(orchestrator), config));
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting with v1 API");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub llm_configured: bool,
    pub uptime_secs: u64,
}

async fn health_handler(State(state): State<SharedApiState>) -> Json<HealthResponse> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.start_time)
        .num_seconds()
        .max(0) as u64;

    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        store: state.orchestrator.store_name().into(),
        llm_configured: state.orchestrator.has_llm(),
        uptime_secs: uptime,
    })
}
