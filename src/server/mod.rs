//! HTTP server.
//!
//! - [`api`]: routes, request/response types and the error envelope
//! - [`streaming`]: SSE streaming for token-by-token chat completions

pub mod api;
pub mod streaming;

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

pub use api::{build_router, AppState};

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
