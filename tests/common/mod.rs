//! Shared test utilities for the daemon's integration tests.
//!
//! Builds a full `ipc_router` against real collaborators (temp dirs for
//! the download/cache paths, a wiremock server standing in for the cloud
//! endpoint) so these tests exercise the actual HTTP surface rather than
//! calling the [`Dispatcher`] directly.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use http_body_util::BodyExt;
use rdk_fwupdater::clients::HandlerId;
use rdk_fwupdater::collaborators::{FlashHelper, MapStore, SignedRequest, SigningHelper, TracingEventBus};
use rdk_fwupdater::config::{BuildType, ConfigFacade, DeviceInfo, ImageDetails};
use rdk_fwupdater::dispatcher::Dispatcher;
use rdk_fwupdater::error::UpdateError;
use rdk_fwupdater::ipc::ipc_router;
use rdk_fwupdater::mode::ModeController;
use rdk_fwupdater::pipeline::UpgradePipeline;
use rdk_fwupdater::retry::RetryOrchestrator;
use rdk_fwupdater::state::DownloadStateMachine;
use rdk_fwupdater::transport::HttpTransport;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

struct NoopSigner;
#[async_trait]
impl SigningHelper for NoopSigner {
    async fn sign(&self, url: &str) -> Result<SignedRequest, UpdateError> {
        Ok(SignedRequest {
            url: url.to_string(),
            auth_header: "Bearer test".into(),
        })
    }
}

struct NoopFlash;
#[async_trait]
impl FlashHelper for NoopFlash {
    async fn flash(&self, _image_path: &std::path::PathBuf) -> Result<(), UpdateError> {
        Ok(())
    }
}

/// Owns the temp directories the harness's router points at; keep this
/// alive for the lifetime of the test or the paths get cleaned up from
/// under the router.
pub struct Harness {
    pub router: axum::Router,
    pub dispatcher: Arc<Dispatcher>,
    pub cache_dir: std::path::PathBuf,
    _dir: TempDir,
}

impl Harness {
    /// One registered caller, bootstrapped for convenience.
    pub fn registered_handler(&self) -> HandlerId {
        self.dispatcher.register_process("myapp", "1.0", "caller-1").unwrap()
    }
}

/// Builds a router with a bare `MapStore`-backed config (no RFC overrides,
/// no cloud mock wired in) — suitable for tests that only care about
/// registration and routing, not the cloud query itself.
pub fn harness() -> Harness {
    harness_with_rfc(MapStore::default())
}

/// Builds a router whose RFC store is `rfc`, typically pointing the cloud
/// bootstrap URL at a local wiremock server.
pub fn harness_with_rfc(rfc: MapStore) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();

    let mut props = MapStore::default();
    props.0.insert("accountID".into(), "acct-1".into());

    let cfg = Arc::new(ConfigFacade::new(
        DeviceInfo {
            model: "MyModel".into(),
            manufacturer: "Acme".into(),
            serial_number: "SN1".into(),
            estb_mac: "AA:BB:CC:DD:EE:FF".into(),
            build_type: BuildType::Prod,
            image_download_path: dir.path().to_path_buf(),
            persistent_path: dir.path().to_path_buf(),
            capabilities: "RCDL".into(),
            partner_id: "partner".into(),
            experience: "X1".into(),
            maintenance_mode: false,
            software_optout: false,
        },
        ImageDetails {
            running_image_name: "MyModel_1.0.0".into(),
        },
        Arc::new(props),
        Arc::new(rfc),
        Arc::new(AtomicBool::new(false)),
    ));

    let transport = Arc::new(HttpTransport::new(None));
    let cloud = rdk_fwupdater::cloud::CloudQueryService::new(transport.clone(), &cache_dir, cfg.clone());
    let state = Arc::new(DownloadStateMachine::default());
    let orchestrator = Arc::new(RetryOrchestrator::new(
        transport.clone(),
        Arc::new(NoopSigner),
        dir.path(),
        Arc::new(AtomicBool::new(false)),
    ));
    let mode_ctl = Arc::new(ModeController::new(Arc::new(TracingEventBus), Arc::new(AtomicBool::new(false))));
    let pipeline = UpgradePipeline::new(
        cfg,
        state,
        Arc::new(TracingEventBus),
        Arc::new(NoopFlash),
        orchestrator,
        mode_ctl,
    );
    let dispatcher = Arc::new(Dispatcher::new(cloud, pipeline, dir.path().join("optout")));

    Harness {
        router: ipc_router(dispatcher.clone()),
        dispatcher,
        cache_dir,
        _dir: dir,
    }
}

pub async fn body_to_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.expect("collect body").to_bytes();
    serde_json::from_slice(&bytes).expect("body is valid json")
}

/// Initialize tracing for tests (only once). Defaults to `warn` to reduce
/// noise; set `RUST_LOG` for verbose output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_test_writer()
        .try_init();
}
