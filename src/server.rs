//! Status endpoint for uptime monitoring.
//!
//! When `[status].enabled` is set, a small HTTP server answers `OK` so load
//! balancers and monitors can tell the bridge process is alive.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `GET` | `/` | `200 OK`, body `OK` |
//! | `GET` | `/health` | `200 OK`, body `OK` |

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::watch::shutdown_requested;

pub fn router() -> Router {
    Router::new()
        .route("/", get(handle_status))
        .route("/health", get(handle_status))
        .layer(TraceLayer::new_for_http())
}

async fn handle_status() -> &'static str {
    "OK"
}

/// Bind `bind` and serve until shutdown is requested.
pub async fn run_status_server(bind: &str, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_status(listener, shutdown).await
}

pub async fn serve_status(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    info!("status server stopped");
    Ok(())
}
