//! Server module
//!
//! HTTP routes, the WebSocket endpoint and the shared state every connection
//! task is handed.

pub mod broadcast;
pub mod connect_info;
pub mod protocol;
pub mod ws;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::polls::SessionState;
use crate::registry::{ClientRegistry, Role};
use broadcast::Broadcaster;

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionState>,
    pub registry: Arc<ClientRegistry>,
    pub broadcaster: Broadcaster,
    pub config: Arc<Config>,
    /// Cancelled when the server is asked to stop.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let options = config.vote_options()?;
        let registry = Arc::new(ClientRegistry::new());
        let session = Arc::new(SessionState::new(options, Arc::clone(&registry)));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        Ok(Self {
            session,
            registry,
            broadcaster,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handle to a running server.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the server to stop. Open connections are closed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the serve loop to finish.
    pub async fn wait(self) -> std::io::Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(std::io::Error::other(err)),
        }
    }
}

/// Bind the listener and start serving in the background.
pub async fn start(state: AppState) -> std::io::Result<ServerHandle> {
    let bind = state.config.server.bind.clone();
    let port = state.config.server.port;
    let listener = TcpListener::bind((bind.as_str(), port)).await?;
    let local_addr = listener.local_addr()?;

    let shutdown = state.shutdown.clone();
    let signal = shutdown.clone();
    let router = build_router(state);

    info!(%local_addr, "pollcast server listening");

    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown,
        task,
    })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.session.snapshot();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.registry.len(),
        "admins": state.registry.count_role(Role::Admin),
        "voters": state.registry.count_role(Role::Voter),
        "question": snapshot.curr_question,
        "voteAllowed": snapshot.vote_allowed,
        "round": snapshot.round,
    }))
}
