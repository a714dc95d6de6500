//! The metrics endpoint is wired up independently of the IPC router; this
//! only checks that it renders Prometheus text reflecting a counter bump.
//!
//! `metrics_router()` installs a process-global recorder, so this file
//! keeps a single test to avoid a second install panicking.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rdk_fwupdater::metrics::router::metrics_router;
use tower::ServiceExt;

#[tokio::test]
async fn metrics_endpoint_renders_a_bumped_counter() {
    let router = metrics_router();
    metrics::counter!("cloud_query_cache_hits_total").increment(1);

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("cloud_query_cache_hits_total"));
}
