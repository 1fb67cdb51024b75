//! Server-sent event stream for a resource.
//!
//! The first event is `init` with the full snapshot. After each change
//! notification from the runtime the resource is re-read from the last token
//! and a non-empty delta is sent as `update`. A failed refresh is sent as an
//! `error` event and the stream keeps going.

use crate::runtime::handle::RuntimeHandle;
use crate::runtime::value::Value;
use crate::server::error::AppError;
use crate::server::handlers::{params_value, require_auth, AppState};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::convert::Infallible;
use tokio::sync::watch;

struct Subscription {
    runtime: RuntimeHandle,
    name: String,
    params: Value,
    auth: Vec<u8>,
    changes: watch::Receiver<u64>,
    token: Option<Value>,
    started: bool,
}

impl Subscription {
    fn new(runtime: RuntimeHandle, name: String, params: Value, auth: Vec<u8>) -> Self {
        let mut changes = runtime.subscribe_changes();
        // Anything committed before the snapshot is already part of it.
        changes.borrow_and_update();
        Self {
            runtime,
            name,
            params,
            auth,
            changes,
            token: None,
            started: false,
        }
    }

    /// Next event to send, or `None` once the runtime is gone.
    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if self.started && self.changes.changed().await.is_err() {
                tracing::debug!(resource = %self.name, "runtime closed, ending stream");
                return None;
            }
            self.started = true;

            let snapshot = match self
                .runtime
                .get_all(
                    &self.name,
                    self.params.clone(),
                    Some(self.auth.clone()),
                    self.token.clone(),
                )
                .await
            {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(resource = %self.name, "stream refresh failed: {}", err);
                    let body = serde_json::json!({ "error": err.to_string() });
                    return Some(Event::default().event("error").data(body.to_string()));
                }
            };

            let kind = if self.token.is_some() { "update" } else { "init" };
            if let Some(token) = snapshot.reactive {
                self.token = Some(token);
            }
            if kind == "update" && snapshot.values.is_empty() {
                continue;
            }

            let data = match serde_json::to_string(&snapshot.values) {
                Ok(data) => data,
                Err(err) => {
                    let body = serde_json::json!({ "error": err.to_string() });
                    return Some(Event::default().event("error").data(body.to_string()));
                }
            };
            return Some(Event::default().event(kind).data(data));
        }
    }
}

fn events(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next_event().await?;
        Some((Ok(event), subscription))
    })
}

pub async fn stream_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let auth = require_auth(&headers)?;
    tracing::debug!(resource = %name, "opening event stream");
    let subscription = Subscription::new(state.runtime().clone(), name, params_value(query), auth);
    Ok(Sse::new(events(subscription)).keep_alive(KeepAlive::default()))
}
