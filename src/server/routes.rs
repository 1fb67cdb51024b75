//! Route table of the reactive resource protocol.

use crate::server::handlers::{
    delete_entry, get_resource, get_resource_key, head_resource, health, patch_collection,
    put_entry, AppState,
};
use crate::server::stream::stream_resource;
use axum::routing::get;
use axum::Router;

/// Builds the router. Collection and resource names share the `{name}`
/// segment since both address the same namespace.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/{name}",
            get(get_resource).head(head_resource).patch(patch_collection),
        )
        .route(
            "/v1/{name}/{key}",
            get(get_resource_key).put(put_entry).delete(delete_entry),
        )
        .route("/streams/{name}", get(stream_resource))
        .with_state(state)
}
