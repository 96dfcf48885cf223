use std::{future::Future, net::SocketAddr, process::ExitCode, sync::Arc};

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod catalog;
pub mod child;
pub mod config;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod namespace;
pub mod registry;

use config::ConfigError;
use http::sessions::SessionManager;
use mcp::router::RequestRouter;
use registry::ServerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub router: RequestRouter,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            router: RequestRouter::new(registry.clone()),
            registry,
            sessions: SessionManager::new(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/",
            get(http::handlers::mcp_get)
                .post(http::handlers::mcp_post)
                .delete(http::handlers::mcp_delete),
        )
        .route("/health", get(http::handlers::health))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

/// Binds the HTTP listener. Failure here is fatal for the process.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ConfigError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ConfigError::PortUnavailable { addr, source })
}

/// How a [`run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Served until shutdown with at least one child ready.
    Served,
    NoServerReady,
    ServeFailed,
}

impl From<RunOutcome> for ExitCode {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Served => ExitCode::SUCCESS,
            RunOutcome::NoServerReady | RunOutcome::ServeFailed => ExitCode::FAILURE,
        }
    }
}

/// Starts every child, serves until `shutdown` resolves, then stops the
/// children. Gives up without serving when no child reached `ready`.
pub async fn run(
    listener: TcpListener,
    registry: Arc<ServerRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> RunOutcome {
    let configured = registry.descriptors().len();
    let ready = registry.start_all().await;
    if ready == 0 {
        error!(configured, "no MCP server could be started");
        registry.shutdown().await;
        return RunOutcome::NoServerReady;
    }

    let state = AppState::new(registry.clone());
    let sessions = state.sessions.clone();
    let app = build_app(state);

    match listener.local_addr() {
        Ok(bind_addr) => info!(bind_addr = %bind_addr, ready, configured, "aggregator listening"),
        Err(_) => info!(ready, configured, "aggregator listening"),
    }

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            // Open SSE streams would otherwise hold graceful shutdown forever.
            sessions.close_all();
        })
        .await;

    registry.shutdown().await;

    if let Err(err) = served {
        error!(error = %err, "http server failed");
        return RunOutcome::ServeFailed;
    }

    info!("aggregator shutdown complete");
    RunOutcome::Served
}
