//! Integration tests for the `/rpc` IPC entrypoint: registration, routing,
//! and the HTTP status codes the router maps [`RpcError`]/[`UpdateError`]
//! variants onto.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_to_json, harness};
use serde_json::json;
use tower::ServiceExt;

fn rpc_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn register_then_unregister_round_trips_over_http() {
    common::init_tracing();
    let h = harness();

    let register = rpc_request(json!({
        "method": "RegisterProcess",
        "params": {"processName": "myapp", "libVersion": "1.0", "callerId": "caller-1"},
    }));
    let response = h.router.clone().oneshot(register).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert!(body["ok"].as_bool().unwrap());
    let handler_id = body["result"]["handlerId"].as_u64().unwrap();

    let unregister = rpc_request(json!({
        "method": "UnregisterProcess",
        "params": {"handlerId": handler_id.to_string()},
    }));
    let response = h.router.clone().oneshot(unregister).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert!(body["result"]["success"].as_bool().unwrap());
}

#[tokio::test]
async fn unknown_method_is_404() {
    let h = harness();
    let request = rpc_request(json!({"method": "Frobnicate", "params": {}}));
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unregistered_handler_is_401() {
    let h = harness();
    let request = rpc_request(json!({
        "method": "CheckForUpdate",
        "params": {"handlerId": "999"},
    }));
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_handler_id_is_401() {
    let h = harness();
    let request = rpc_request(json!({
        "method": "CheckForUpdate",
        "params": {"handlerId": "not-a-number"},
    }));
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
