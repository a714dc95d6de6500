//! Narrow-contract collaborators (§1, §6, §9): the device-property and
//! remote-config stores, the event bus, the certificate selector, the codebig
//! signing helper, and the flash subsystem. The core only ever consumes these
//! through the traits below — it never reaches into their implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::UpdateError;

/// A key→value lookup over the device's persisted properties (model, serial,
/// eSTB MAC, build type, ...). Populated once at start-up by whatever reads
/// `/etc/device.properties` (or the platform equivalent) on a real box.
pub trait DevicePropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// A key→value lookup over the remote-config (RFC) values. Refreshed on
/// demand by its own implementation; the core never writes through this trait.
pub trait RemoteConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory stand-ins for the two stores above, used by tests and by the
/// default file-backed implementations to seed known values.
#[derive(Default, Clone)]
pub struct MapStore(pub HashMap<String, String>);

impl DevicePropertyStore for MapStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

impl RemoteConfigStore for MapStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Emits the named events in §6. A real deployment wires this to the
/// platform's IARM/event bus; here it is realized as an optional MQTT
/// publisher (grounded on the teacher's `notifier::Notifier`) plus a
/// `tracing` record, so the events are always observable even with no
/// broker configured.
///
/// [`CompositeEventBus`] fans the same event out to every bus it wraps,
/// so the tracing record and an optional MQTT publish can both run off
/// one call site.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit_fw_state(&self, state: FwStateEvent);
    async fn emit_img_dwl(&self, state: ImgDwlEvent);
    async fn emit_red_state(&self, state: RedStateEvent);
    async fn emit_maint_fwdownload(&self, state: MaintFwDownloadEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwStateEvent {
    Uninitialized,
    Requesting,
    Downloading,
    DownloadComplete,
    Failed,
    OnholdForOptout,
}

impl FwStateEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            FwStateEvent::Uninitialized => "UNINITIALIZED",
            FwStateEvent::Requesting => "REQUESTING",
            FwStateEvent::Downloading => "DOWNLOADING",
            FwStateEvent::DownloadComplete => "DOWNLOAD_COMPLETE",
            FwStateEvent::Failed => "FAILED",
            FwStateEvent::OnholdForOptout => "ONHOLD_FOR_OPTOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImgDwlEvent {
    Uninitialized,
    InProgress,
    Complete,
    Failed,
}

impl ImgDwlEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            ImgDwlEvent::Uninitialized => "IMAGE_FWDNLD_UNINITIALIZED",
            ImgDwlEvent::InProgress => "IN_PROGRESS",
            ImgDwlEvent::Complete => "COMPLETE",
            ImgDwlEvent::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedStateEvent {
    Started,
    Downloaded,
    Completed,
}

impl RedStateEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            RedStateEvent::Started => "RED_RECOVERY_STARTED",
            RedStateEvent::Downloaded => "DOWNLOADED",
            RedStateEvent::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintFwDownloadEvent {
    InProgress,
    Complete,
    Error,
    Aborted,
}

impl MaintFwDownloadEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            MaintFwDownloadEvent::InProgress => "MAINT_FWDOWNLOAD_INPROGRESS",
            MaintFwDownloadEvent::Complete => "MAINT_FWDOWNLOAD_COMPLETE",
            MaintFwDownloadEvent::Error => "MAINT_FWDOWNLOAD_ERROR",
            MaintFwDownloadEvent::Aborted => "MAINT_FWDOWNLOAD_ABORTED",
        }
    }
}

/// Logs every event at `info!` regardless of whether a broker is attached.
/// Composable with an MQTT-backed bus via [`CompositeEventBus`].
pub struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn emit_fw_state(&self, state: FwStateEvent) {
        tracing::info!(event = "FW_STATE_EVENT", state = state.as_str(), "event emitted");
    }
    async fn emit_img_dwl(&self, state: ImgDwlEvent) {
        tracing::info!(event = "IMG_DWL_EVENT", state = state.as_str(), "event emitted");
    }
    async fn emit_red_state(&self, state: RedStateEvent) {
        tracing::info!(event = "RED_STATE_EVENT", state = state.as_str(), "event emitted");
    }
    async fn emit_maint_fwdownload(&self, state: MaintFwDownloadEvent) {
        tracing::info!(event = "MAINT_FWDOWNLOAD_EVENT", state = state.as_str(), "event emitted");
    }
}

/// A client-presented certificate + key pair for the DIRECT (mTLS) transport,
/// chosen by an external cert-selection helper (e.g. by build type / partner).
#[derive(Clone, Debug)]
pub struct MtlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub trait CertSelector: Send + Sync {
    /// Returns `None` when no certificate is available/applicable, in which
    /// case DIRECT transport cannot be attempted.
    fn select(&self) -> Option<MtlsCredentials>;
}

/// The externally computed SIGNED (codebig) URL + auth header for a request.
#[derive(Clone, Debug)]
pub struct SignedRequest {
    pub url: String,
    pub auth_header: String,
}

#[async_trait]
pub trait SigningHelper: Send + Sync {
    async fn sign(&self, url: &str) -> std::result::Result<SignedRequest, UpdateError>;
}

/// Flashes a downloaded image. A real implementation shells out to the
/// platform's flashing subsystem; the core only calls `flash` and interprets
/// its boolean/err outcome.
#[async_trait]
pub trait FlashHelper: Send + Sync {
    async fn flash(&self, image_path: &PathBuf) -> std::result::Result<(), UpdateError>;
}

pub type SharedDevicePropertyStore = Arc<dyn DevicePropertyStore>;
pub type SharedRemoteConfigStore = Arc<dyn RemoteConfigStore>;
pub type SharedEventBus = Arc<dyn EventBus>;
pub type SharedCertSelector = Arc<dyn CertSelector>;
pub type SharedSigningHelper = Arc<dyn SigningHelper>;
pub type SharedFlashHelper = Arc<dyn FlashHelper>;

/// Fans every emitted event out to each wrapped bus. Built once at start-up
/// from a [`TracingEventBus`] plus an optional MQTT-backed [`Notifier`],
/// so the trace record always fires even when no broker is configured.
///
/// [`Notifier`]: crate::notifier::Notifier
pub struct CompositeEventBus(pub Vec<SharedEventBus>);

#[async_trait]
impl EventBus for CompositeEventBus {
    async fn emit_fw_state(&self, state: FwStateEvent) {
        for bus in &self.0 {
            bus.emit_fw_state(state).await;
        }
    }
    async fn emit_img_dwl(&self, state: ImgDwlEvent) {
        for bus in &self.0 {
            bus.emit_img_dwl(state).await;
        }
    }
    async fn emit_red_state(&self, state: RedStateEvent) {
        for bus in &self.0 {
            bus.emit_red_state(state).await;
        }
    }
    async fn emit_maint_fwdownload(&self, state: MaintFwDownloadEvent) {
        for bus in &self.0 {
            bus.emit_maint_fwdownload(state).await;
        }
    }
}

/// Loads a simple `key=value` properties file, one pair per line, blank
/// lines and `#`-prefixed comments ignored. Backs both
/// [`DevicePropertyStore`] and [`RemoteConfigStore`] via [`MapStore`] —
/// the on-device `/etc/device.properties` and RFC-override files share
/// this format.
pub fn load_properties_file(path: &Path) -> std::io::Result<MapStore> {
    let contents = std::fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(MapStore(map))
}

/// Reads an mTLS cert/key pair from disk on every call, so a rotated
/// certificate takes effect without a daemon restart.
pub struct FileCertSelector {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertSelector for FileCertSelector {
    fn select(&self) -> Option<MtlsCredentials> {
        let cert_pem = std::fs::read(&self.cert_path).ok()?;
        let key_pem = std::fs::read(&self.key_path).ok()?;
        Some(MtlsCredentials { cert_pem, key_pem })
    }
}

/// Calls an external codebig-style signing endpoint to turn a plain URL
/// into a signed one. The core never inspects the signature scheme — it
/// only consumes the resulting [`SignedRequest`].
pub struct HttpSigningHelper {
    client: reqwest::Client,
    signing_url: String,
}

impl HttpSigningHelper {
    pub fn new(signing_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            signing_url: signing_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct SignResponse {
    url: String,
    #[serde(rename = "authHeader")]
    auth_header: String,
}

#[async_trait]
impl SigningHelper for HttpSigningHelper {
    async fn sign(&self, url: &str) -> std::result::Result<SignedRequest, UpdateError> {
        let response = self
            .client
            .post(&self.signing_url)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| UpdateError::Network(format!("signing request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdateError::Network(format!("signing helper returned {}", response.status())));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| UpdateError::Network(format!("malformed signing response: {e}")))?;

        Ok(SignedRequest {
            url: signed.url,
            auth_header: signed.auth_header,
        })
    }
}

/// Shells out to the platform's flash script, passing the downloaded
/// image path as its sole argument. A non-zero exit is a local-system
/// error (§7 class 6).
pub struct ScriptFlashHelper {
    pub script_path: PathBuf,
}

#[async_trait]
impl FlashHelper for ScriptFlashHelper {
    async fn flash(&self, image_path: &PathBuf) -> std::result::Result<(), UpdateError> {
        let status = tokio::process::Command::new(&self.script_path)
            .arg(image_path)
            .status()
            .await
            .map_err(|e| UpdateError::LocalSystem(format!("failed to launch flash helper: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(UpdateError::LocalSystem(format!("flash helper exited with {status}")))
        }
    }
}
