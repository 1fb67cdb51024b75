//! End-to-end scenarios for the reactive resource protocol, driven through
//! the axum router without binding a socket.

use axum::body::{to_bytes, Body, BodyDataStream};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::StreamExt;
use reactive_bridge::server::{AUTH_HEADER, REQUEST_TOKEN_HEADER, RESPONSE_TOKEN_HEADER};
use reactive_bridge::{
    router, AppState, BridgeError, Entry, Operators, RuntimeConfig, RuntimeHandle, Service,
};
use serde_json::{json, Value as Json};
use std::time::Duration;
use tower::ServiceExt;

/// "dXNlcg==" is base64 for "user".
const AUTH: &str = "dXNlcg==";

struct Users;

impl Service for Users {
    fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
        ops.input("users", Vec::<Entry>::new())?;
        Ok(())
    }
}

fn setup() -> (RuntimeHandle, Router) {
    let runtime = RuntimeHandle::spawn(RuntimeConfig::default(), || Users).unwrap();
    let app = router(AppState::new(runtime.clone()));
    (runtime, app)
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn request(method: Method, uri: &str, body: Option<Json>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: Response) -> Json {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_patch_then_read_one() {
    let (runtime, app) = setup();

    let response = send(
        &app,
        request(
            Method::PATCH,
            "/v1/users",
            Some(json!([["1", [{"name": "Alice", "active": true}]]])),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, request(Method::GET, "/v1/users/1", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"name": "Alice", "active": true})
    );

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_delete_removes_the_key() {
    let (runtime, app) = setup();

    send(
        &app,
        request(
            Method::PATCH,
            "/v1/users",
            Some(json!([["1", [{"name": "Alice"}]], ["2", [{"name": "Bob"}]]])),
        ),
    )
    .await;

    let response = send(&app, request(Method::DELETE, "/v1/users/1", None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, request(Method::GET, "/v1/users/1", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, Json::Null);

    let response = send(&app, request(Method::GET, "/v1/users", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(RESPONSE_TOKEN_HEADER).is_none());
    assert_eq!(json_body(response).await, json!([["2", [{"name": "Bob"}]]]));

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_write_to_unknown_collection_is_a_client_error() {
    let (runtime, app) = setup();

    let response = send(
        &app,
        request(
            Method::PATCH,
            "/v1/unknown-collection",
            Some(json!([["1", [1]]])),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], "UNKNOWN_COLLECTION");
    assert!(body["error"].as_str().unwrap().contains("unknown-collection"));

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_reactive_token_yields_delta() {
    let (runtime, app) = setup();

    send(
        &app,
        request(Method::PATCH, "/v1/users", Some(json!([["1", [{"name": "Alice"}]]]))),
    )
    .await;

    let mut first = request(Method::GET, "/v1/users", None);
    first
        .headers_mut()
        .insert(AUTH_HEADER, AUTH.parse().unwrap());
    let response = send(&app, first).await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = response
        .headers()
        .get(RESPONSE_TOKEN_HEADER)
        .expect("authenticated reads carry a token")
        .clone();
    assert_eq!(json_body(response).await, json!([["1", [{"name": "Alice"}]]]));

    send(
        &app,
        request(Method::PATCH, "/v1/users", Some(json!([["2", [{"name": "Bob"}]]]))),
    )
    .await;

    let mut delta = request(Method::GET, "/v1/users", None);
    delta.headers_mut().insert(AUTH_HEADER, AUTH.parse().unwrap());
    delta.headers_mut().insert(REQUEST_TOKEN_HEADER, token);
    let response = send(&app, delta).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!([["2", [{"name": "Bob"}]]]));

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_put_requires_an_array_body() {
    let (runtime, app) = setup();

    let response = send(
        &app,
        request(Method::PUT, "/v1/users/7", Some(json!(["admin", "ops"]))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, request(Method::GET, "/v1/users/7", None)).await;
    assert_eq!(json_body(response).await, json!(["admin", "ops"]));

    let response = send(
        &app,
        request(Method::PUT, "/v1/users/7", Some(json!({"name": "Eve"}))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "BAD_REQUEST");

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let (runtime, app) = setup();

    let malformed = Request::builder()
        .method(Method::PATCH)
        .uri("/v1/users")
        .header("content-type", "application/json")
        .body(Body::from("[[\"1\","))
        .unwrap();
    let response = send(&app, malformed).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        request(Method::PATCH, "/v1/users", Some(json!({"1": [1]}))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_head_requires_auth() {
    let (runtime, app) = setup();

    let response = send(&app, request(Method::HEAD, "/v1/users", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut head = request(Method::HEAD, "/v1/users", None);
    head.headers_mut().insert(AUTH_HEADER, AUTH.parse().unwrap());
    let response = send(&app, head).await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = response.headers().get(RESPONSE_TOKEN_HEADER).unwrap();
    let token: Json = serde_json::from_str(token.to_str().unwrap()).unwrap();
    assert_eq!(token["collection"], "users");

    let mut bad = request(Method::GET, "/v1/users", None);
    bad.headers_mut()
        .insert(AUTH_HEADER, "***".parse().unwrap());
    let response = send(&app, bad).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_unknown_resource_read_is_a_server_error() {
    let (runtime, app) = setup();

    let response = send(&app, request(Method::GET, "/v1/nope", None)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["code"], "INTERNAL_ERROR");

    runtime.close().unwrap();
}

#[tokio::test]
async fn test_health() {
    let (runtime, app) = setup();

    let response = send(&app, request(Method::GET, "/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "ok"}));

    runtime.close().unwrap();
}

async fn next_event(events: &mut BodyDataStream) -> String {
    let chunk = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("event within timeout")
        .expect("stream still open")
        .unwrap();
    String::from_utf8(chunk.to_vec()).unwrap()
}

#[tokio::test]
async fn test_stream_sends_init_then_update() {
    let (runtime, app) = setup();

    send(
        &app,
        request(Method::PATCH, "/v1/users", Some(json!([["1", [{"name": "Alice"}]]]))),
    )
    .await;

    let mut open = request(Method::GET, "/streams/users", None);
    open.headers_mut().insert(AUTH_HEADER, AUTH.parse().unwrap());
    let response = send(&app, open).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut events = response.into_body().into_data_stream();

    let init = next_event(&mut events).await;
    assert!(init.contains("event: init"), "{init}");
    assert!(init.contains("Alice"), "{init}");

    send(
        &app,
        request(Method::PATCH, "/v1/users", Some(json!([["2", [{"name": "Bob"}]]]))),
    )
    .await;

    let update = next_event(&mut events).await;
    assert!(update.contains("event: update"), "{update}");
    assert!(update.contains("Bob"), "{update}");
    assert!(!update.contains("Alice"), "{update}");

    drop(events);
    runtime.close().unwrap();
}

#[tokio::test]
async fn test_stream_requires_auth() {
    let (runtime, app) = setup();

    let response = send(&app, request(Method::GET, "/streams/users", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    runtime.close().unwrap();
}
