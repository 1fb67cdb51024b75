//! HTTP endpoint handlers for the reactive resource protocol.
//!
//! - `HEAD /v1/{name}` - instantiate a resource, answer its reactive token
//! - `GET /v1/{name}` - read all entries, or the delta since a token
//! - `GET /v1/{name}/{key}` - read the first value of one key
//! - `PUT /v1/{name}/{key}` - set one key
//! - `PATCH /v1/{name}` - write a batch of entries
//! - `DELETE /v1/{name}/{key}` - delete one key

use crate::runtime::handle::RuntimeHandle;
use crate::runtime::value::{Entry, Value};
use crate::server::error::AppError;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose, Engine as _};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Base64 session token scoping a client's reactive state.
pub const AUTH_HEADER: &str = "x-reactive-auth";
/// Reactive token answered by reads.
pub const RESPONSE_TOKEN_HEADER: &str = "skip-reactive-response-token";
/// Reactive token presented back to read only what changed since.
pub const REQUEST_TOKEN_HEADER: &str = "skip-reactive-request-token";

/// Shared state of the protocol server.
#[derive(Clone)]
pub struct AppState {
    runtime: RuntimeHandle,
}

impl AppState {
    pub fn new(runtime: RuntimeHandle) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Decodes `X-Reactive-Auth`, padded or not.
pub(crate) fn decode_auth(headers: &HeaderMap) -> Result<Option<Vec<u8>>, AppError> {
    let Some(raw) = headers.get(AUTH_HEADER) else {
        return Ok(None);
    };
    let text = raw
        .to_str()
        .map_err(|_| AppError::BadRequest("X-Reactive-Auth is not valid text".to_string()))?
        .trim();
    general_purpose::STANDARD
        .decode(text)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(text))
        .map(Some)
        .map_err(|err| AppError::BadRequest(format!("X-Reactive-Auth is not valid base64: {err}")))
}

pub(crate) fn require_auth(headers: &HeaderMap) -> Result<Vec<u8>, AppError> {
    decode_auth(headers)?
        .ok_or_else(|| AppError::BadRequest("X-Reactive-Auth must be specified".to_string()))
}

fn request_token(headers: &HeaderMap) -> Result<Option<Value>, AppError> {
    let Some(raw) = headers.get(REQUEST_TOKEN_HEADER) else {
        return Ok(None);
    };
    let text = raw
        .to_str()
        .map_err(|_| AppError::BadRequest("reactive token is not valid text".to_string()))?;
    serde_json::from_str::<serde_json::Value>(text)
        .map(|token| Some(Value::from(token)))
        .map_err(|err| AppError::BadRequest(format!("malformed reactive token: {err}")))
}

fn token_header(token: &Value) -> Result<HeaderValue, AppError> {
    let json = token
        .to_json()
        .map_err(|err| AppError::Internal(err.to_string()))?;
    HeaderValue::from_str(&json.to_string())
        .map_err(|err| AppError::Internal(format!("reactive token is not a valid header: {err}")))
}

/// Query parameters as a resource's params object, in key order so that the
/// same parameters always name the same session.
pub(crate) fn params_value(query: HashMap<String, String>) -> Value {
    let sorted: BTreeMap<String, String> = query.into_iter().collect();
    Value::Object(
        sorted
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect::<IndexMap<_, _>>(),
    )
}

fn parse_body(body: &Bytes) -> Result<serde_json::Value, AppError> {
    serde_json::from_slice(body)
        .map_err(|err| AppError::BadRequest(format!("malformed JSON body: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(value).map_err(|err| AppError::Internal(err.to_string()))
}

fn written() -> Response {
    (StatusCode::OK, Json(serde_json::json!({}))).into_response()
}

pub async fn head_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let auth = require_auth(&headers)?;
    let blob = state
        .runtime
        .create_resource(&name, params_value(query), auth)
        .await
        .map_err(AppError::read)?;

    let mut response = written();
    response
        .headers_mut()
        .insert(RESPONSE_TOKEN_HEADER, token_header(&blob)?);
    Ok(response)
}

pub async fn get_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let auth = decode_auth(&headers)?;
    let since = request_token(&headers)?;
    let snapshot = state
        .runtime
        .get_all(&name, params_value(query), auth, since)
        .await
        .map_err(AppError::read)?;

    let mut response = (StatusCode::OK, Json(to_json(&snapshot.values)?)).into_response();
    if let Some(token) = &snapshot.reactive {
        response
            .headers_mut()
            .insert(RESPONSE_TOKEN_HEADER, token_header(token)?);
    }
    Ok(response)
}

pub async fn get_resource_key(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let value = state
        .runtime
        .get_one(&name, params_value(query), Value::String(key))
        .await
        .map_err(AppError::read)?;
    Ok(Json(to_json(&value)?))
}

/// The body, which must be a JSON array, becomes the key's only value.
pub async fn put_entry(
    State(state): State<AppState>,
    Path((collection, key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&body)?;
    if !body.is_array() {
        return Err(AppError::BadRequest(format!("bad request body {body}")));
    }
    let entry = Entry::new(key, vec![Value::from(body)]);
    state
        .runtime
        .update(&collection, vec![entry])
        .await
        .map_err(AppError::write)?;
    Ok(written())
}

pub async fn patch_collection(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&body)?;
    if !body.is_array() {
        return Err(AppError::BadRequest(format!("bad request body {body}")));
    }
    let entries: Vec<Entry> = serde_json::from_value(body)
        .map_err(|err| AppError::BadRequest(format!("malformed entries: {err}")))?;
    state
        .runtime
        .update(&collection, entries)
        .await
        .map_err(AppError::write)?;
    Ok(written())
}

pub async fn delete_entry(
    State(state): State<AppState>,
    Path((collection, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    state
        .runtime
        .update(&collection, vec![Entry::delete(key)])
        .await
        .map_err(AppError::write)?;
    Ok(written())
}
