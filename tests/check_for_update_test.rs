//! Integration tests for `CheckForUpdate`/`DownloadFirmware` over HTTP,
//! covering the cache-hit, wrong-model, and no-update-offered outcomes from
//! a registered caller's point of view.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_to_json, harness_with_rfc};
use rdk_fwupdater::cloud::CloudResponseCache;
use rdk_fwupdater::collaborators::MapStore;
use serde_json::json;
use tower::ServiceExt;

fn check_for_update(handler_id: u64) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"method": "CheckForUpdate", "params": {"handlerId": handler_id.to_string()}}).to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn cache_hit_reports_available_version_over_http() {
    let h = harness_with_rfc(MapStore::default());
    CloudResponseCache::new(&h.cache_dir)
        .write(
            br#"{"cloudFWFile":"MyModel_v2.bin","cloudFWVersion":"2.0.0","cloudFWLocation":"https://cdn.example.com/fw.bin"}"#,
            200,
        )
        .unwrap();
    let handler_id = h.registered_handler();

    let response = h.router.clone().oneshot(check_for_update(handler_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"]["availableVersion"], "2.0.0");
    assert!(body["result"]["updateDetails"].as_str().unwrap().starts_with("File:MyModel_v2.bin"));
}

#[tokio::test]
async fn wrong_model_offer_is_422() {
    let h = harness_with_rfc(MapStore::default());
    CloudResponseCache::new(&h.cache_dir)
        .write(br#"{"cloudFWFile":"OtherModel_v2.bin","cloudFWVersion":"2.0.0"}"#, 200)
        .unwrap();
    let handler_id = h.registered_handler();

    let response = h.router.clone().oneshot(check_for_update(handler_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn no_update_offered_is_422() {
    let h = harness_with_rfc(MapStore::default());
    CloudResponseCache::new(&h.cache_dir)
        .write(br#"{"cloudFWFile":"MyModel_v2.bin","cloudFWVersion":""}"#, 200)
        .unwrap();
    let handler_id = h.registered_handler();

    let response = h.router.clone().oneshot(check_for_update(handler_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
