//! HTTP server for the reactive resource protocol.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `HEAD /v1/{resource}` - Instantiate a resource and obtain its reactive token
//! - `GET /v1/{resource}` - Read all entries, or a delta with a request token
//! - `GET /v1/{resource}/{key}` - Read one key
//! - `PUT /v1/{collection}/{key}` - Set one key of an input collection
//! - `PATCH /v1/{collection}` - Write entries to an input collection
//! - `DELETE /v1/{collection}/{key}` - Delete one key
//! - `GET /streams/{resource}` - Server-sent `init` and `update` events

pub mod error;
pub mod handlers;
pub mod routes;
pub mod stream;

use crate::runtime::error::BridgeError;
use crate::runtime::handle::RuntimeHandle;
use std::future::Future;
use tokio::net::TcpListener;

pub use crate::runtime::config::ServerConfig;
pub use error::{AppError, ErrorResponse};
pub use handlers::{AppState, AUTH_HEADER, REQUEST_TOKEN_HEADER, RESPONSE_TOKEN_HEADER};
pub use routes::router;

/// Serves the protocol for `runtime` until `shutdown` resolves.
pub async fn serve(
    config: &ServerConfig,
    runtime: RuntimeHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BridgeError> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::Runtime(format!("failed to bind {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::Runtime(format!("failed to get local address: {e}")))?;
    tracing::info!("reactive server bound to {}", local_addr);

    let app = router(AppState::new(runtime));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("reactive server received shutdown signal");
        })
        .await
        .map_err(|e| BridgeError::Runtime(format!("server error: {e}")))?;

    tracing::info!("reactive server stopped");
    Ok(())
}
