//! WebSocket gateway for ClawLink.
//!
//! Exposes:
//! - `GET /health`               — liveness check
//! - `GET /v1/ws?session=<code>` — the agent session protocol (see [`protocol`])
//!
//! Built on Axum.

pub mod protocol;
mod ws;

use axum::{Router, extract::State, response::Json, routing::get};
use clawlink_agent::AgentRuntime;
use clawlink_config::{AppConfig, PersistenceBackend, PersistenceConfig};
use clawlink_memory::{InMemoryTurnStore, JsonlTurnStore, NoopTurnStore, PersistenceWriter, TurnStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub runtime: Arc<AgentRuntime>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/ws", get(ws::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// The turn store selected by the `[persistence]` section.
pub fn build_store(config: &PersistenceConfig) -> Arc<dyn TurnStore> {
    match config.backend {
        PersistenceBackend::Memory => Arc::new(InMemoryTurnStore::new()),
        PersistenceBackend::Jsonl => Arc::new(JsonlTurnStore::new(config.resolved_dir())),
        PersistenceBackend::None => Arc::new(NoopTurnStore),
    }
}

/// Periodically close sessions idle for longer than `idle_timeout`.
pub fn spawn_idle_sweeper(runtime: Arc<AgentRuntime>, idle_timeout: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let closed = runtime.sweep_idle(idle_timeout);
            if !closed.is_empty() {
                debug!(sessions = ?closed, "Idle sessions closed");
            }
        }
    })
}

/// Start the gateway server and run until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let provider = clawlink_providers::from_config(&config.provider)?;
    let tools = Arc::new(clawlink_tools::builtin_registry(&config.agent.approval_tools));
    let store = build_store(&config.persistence);
    info!(
        provider = %provider.name(),
        model = %config.provider.model,
        store = %store.name(),
        "Building agent runtime"
    );

    let runtime = AgentRuntime::from_config(&config, provider, tools).with_store(store.clone());
    let writer = PersistenceWriter::spawn(store, runtime.dispatcher());
    let runtime = Arc::new(runtime.with_flusher(writer.flusher()));
    let sweeper = spawn_idle_sweeper(
        runtime.clone(),
        Duration::from_secs(config.gateway.idle_timeout_secs),
        Duration::from_secs(config.gateway.sweep_interval_secs),
    );

    let app = build_router(Arc::new(GatewayState {
        runtime: runtime.clone(),
    }));

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    sweeper.abort();
    writer.shutdown(runtime.dispatcher()).await;
    info!("Gateway stopped");
    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.runtime.session_count(),
    })
}
