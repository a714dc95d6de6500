//! Cloud Query & Response Cache (§4.D). Builds the request, drives Transport,
//! parses and validates the response, and persists a two-file cache.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::ConfigFacade;
use crate::error::UpdateError;
use crate::transport::{DownloadJob, HttpTransport, Sink, TransportKind, UpgradeKind};

/// Cloud Response (§3). Read-only once parsed.
#[derive(Debug, Clone, Deserialize)]
#[allow(unused)]
pub struct CloudFirmwareSpec {
    #[serde(rename = "cloudFWFile", default)]
    pub cloud_fw_file: String,
    #[serde(rename = "cloudFWLocation", default)]
    pub location: String,
    #[serde(rename = "cloudFWIpv6Location", default)]
    pub ipv6_location: String,
    #[serde(rename = "cloudFWVersion", default)]
    pub version: String,
    #[serde(rename = "cloudFWProtocol", default)]
    pub protocol: Option<String>,
    #[serde(rename = "cloudImmediateRebootFlag", default)]
    pub immediate_reboot: bool,
    #[serde(rename = "cloudDelayDownload", default)]
    pub delay_download: u64,
    #[serde(rename = "peripheralFirmwares", default)]
    pub peripheral_firmwares: Vec<String>,
    #[serde(rename = "cloudFWDLCertBundle", default)]
    pub cert_bundle_url: Option<String>,
    #[serde(rename = "cloudPDRIVersion", default)]
    pub pdri_version: Option<String>,
}

impl CloudFirmwareSpec {
    /// An empty `cloudFWVersion` means "no update offered" (§3 invariant).
    pub fn offers_update(&self) -> bool {
        !self.version.is_empty()
    }

    /// A non-empty version whose `cloudFWFile` does not contain the device
    /// model is "update offered to wrong model" (§3 invariant).
    pub fn matches_model(&self, model: &str) -> bool {
        self.cloud_fw_file.contains(model)
    }
}

#[derive(Debug)]
pub enum CloudQueryOutcome {
    Available(CloudFirmwareSpec),
    NoUpdateOffered,
    WrongModel,
    Error(UpdateError),
}

/// The cache is a pair of files: the raw JSON body, and a three-digit HTTP
/// status code (§6). Never invalidated by age in the core (§9 Open Question
/// c, decided: never time-based — operators delete it out-of-band).
pub struct CloudResponseCache {
    body_path: PathBuf,
    status_path: PathBuf,
}

impl CloudResponseCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            body_path: cache_dir.join("xconf_response.json"),
            status_path: cache_dir.join("xconf_response.status"),
        }
    }

    /// Present and parseable, per §4.D's "is the cache file present and
    /// parseable" test. Readers tolerate partial contents (§5) — a parse
    /// failure is treated as a cache miss, not an error.
    pub fn read(&self) -> Option<CloudFirmwareSpec> {
        let raw = std::fs::read(&self.body_path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn write(&self, raw: &[u8], http_status: u16) -> std::io::Result<()> {
        std::fs::write(&self.body_path, raw)?;
        std::fs::write(&self.status_path, format!("{http_status:03}\n"))
    }

    /// [SUPPLEMENT] operator-triggered cache clear, driven by an optional
    /// admin hook; does not change the never-time-based invariant above.
    pub fn invalidate(&self) {
        let _ = std::fs::remove_file(&self.body_path);
        let _ = std::fs::remove_file(&self.status_path);
    }
}

pub struct CloudQueryService {
    transport: Arc<HttpTransport>,
    cache: CloudResponseCache,
    config: Arc<ConfigFacade>,
}

impl CloudQueryService {
    pub fn new(transport: Arc<HttpTransport>, cache_dir: impl Into<PathBuf>, config: Arc<ConfigFacade>) -> Self {
        Self {
            transport,
            cache: CloudResponseCache::new(cache_dir),
            config,
        }
    }

    pub fn cache(&self) -> &CloudResponseCache {
        &self.cache
    }

    #[instrument(skip(self))]
    pub async fn check_for_update(&self) -> CloudQueryOutcome {
        if let Some(spec) = self.cache.read() {
            debug!("cloud response served from cache");
            metrics::counter!("cloud_query_cache_hits_total").increment(1);
            return self.validate(spec);
        }
        metrics::counter!("cloud_query_cache_misses_total").increment(1);

        let url = self.config.get_server_url();
        if url.is_empty() {
            return CloudQueryOutcome::Error(UpdateError::Config("no cloud URL resolvable".into()));
        }

        let body = match self.config.build_query_body() {
            Ok(b) => b,
            Err(e) => return CloudQueryOutcome::Error(e),
        };
        let post_body = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => return CloudQueryOutcome::Error(UpdateError::Config(e.to_string())),
        };

        let mut job = DownloadJob::new(UpgradeKind::XconfQuery, TransportKind::Direct, url, Sink::Memory);
        job.post_body = Some(post_body);
        job.headers.push(("Content-Type".to_string(), "application/json".to_string()));

        let handle = self.transport.new_handle();
        let outcome = self.transport.perform(&handle, job).await;

        if outcome.http_status != 200 {
            warn!(http_status = outcome.http_status, "cloud query did not return 200");
            return CloudQueryOutcome::Error(UpdateError::Network(format!(
                "cloud query returned HTTP {}",
                outcome.http_status
            )));
        }
        let Some(raw) = outcome.body else {
            return CloudQueryOutcome::Error(UpdateError::Network("empty cloud response body".into()));
        };
        if raw.is_empty() {
            return CloudQueryOutcome::NoUpdateOffered;
        }

        let spec: CloudFirmwareSpec = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(e) => return CloudQueryOutcome::Error(UpdateError::Validation(e.to_string())),
        };

        if let Err(e) = self.cache.write(&raw, outcome.http_status) {
            warn!(error = %e, "failed writing cloud response cache");
        }

        self.validate(spec)
    }

    fn validate(&self, spec: CloudFirmwareSpec) -> CloudQueryOutcome {
        if !spec.offers_update() {
            return CloudQueryOutcome::NoUpdateOffered;
        }
        if !spec.matches_model(&self.config.device_info().model) {
            info!(model = %self.config.device_info().model, file = %spec.cloud_fw_file, "cloud firmware offered to wrong model");
            return CloudQueryOutcome::WrongModel;
        }
        CloudQueryOutcome::Available(spec)
    }
}

/// `<path>` existing with the peripheral dedup file's ledger — see
/// `pipeline.rs`, which reads this format directly rather than through the
/// cache above.
pub const PERIPHERAL_VERSIONS_FILE: &str = "downloaded_peripherals.csv";

/// The exact pipe-delimited `updateDetails` field (§6): missing fields
/// default to `N/A`, except Protocol (`HTTP`), Reboot (`false`), Delay (`0`).
pub fn format_update_details(spec: &CloudFirmwareSpec) -> String {
    let na = |s: &str| if s.is_empty() { "N/A".to_string() } else { s.to_string() };
    let peripherals = if spec.peripheral_firmwares.is_empty() {
        "N/A".to_string()
    } else {
        spec.peripheral_firmwares.join(",")
    };
    format!(
        "File:{file}|Location:{location}|IPv6Location:{ipv6}|Version:{version}|Protocol:{protocol}|Reboot:{reboot}|Delay:{delay}|PDRI:{pdri}|Peripherals:{peripherals}|CertBundle:{cert_bundle}",
        file = na(&spec.cloud_fw_file),
        location = na(&spec.location),
        ipv6 = na(&spec.ipv6_location),
        version = na(&spec.version),
        protocol = spec.protocol.as_deref().unwrap_or("HTTP"),
        reboot = spec.immediate_reboot,
        delay = spec.delay_download,
        pdri = spec.pdri_version.as_deref().unwrap_or("N/A"),
        peripherals = peripherals,
        cert_bundle = spec.cert_bundle_url.as_deref().unwrap_or("N/A"),
    )
}
