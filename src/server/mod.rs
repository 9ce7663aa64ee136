//! Status server: `GET /health` and `GET /status`

pub mod handlers;
pub mod state;

pub use handlers::{create_router, BroadcasterStatus};
pub use state::AppState;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the status endpoints until `cancel` fires
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
