//! Axum front end: routes, shared state and server lifecycle.

pub mod error;
pub mod pages;
pub mod upload;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::media::resize::Resizer;
use crate::ml::engine::{ExecutionProvider, ModelKind};
use crate::ml::session::SessionManager;

pub use upload::prepare_upload_dir;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub model: ModelKind,
    pub provider: ExecutionProvider,
    pub upload_dir: PathBuf,
    /// Longest side an upload is scaled down to before inference.
    pub max_dimension: u32,
    pub max_upload_bytes: usize,
    pub allow_cors: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub resizer: Arc<dyn Resizer>,
    pub settings: Arc<ServiceSettings>,
}

impl AppState {
    pub fn new(
        sessions: SessionManager,
        resizer: Arc<dyn Resizer>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(sessions),
            resizer,
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let settings = Arc::clone(&state.settings);

    let mut router = Router::new()
        .route("/", get(pages::index))
        .route("/health", get(pages::health))
        .route("/static/script.js", get(pages::script))
        .route("/upload", post(upload::upload))
        .route("/remover", post(upload::remover))
        .with_state(state)
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes));

    if settings.allow_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.layer(TraceLayer::new_for_http())
}

pub async fn run(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
