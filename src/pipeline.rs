//! Upgrade Pipeline (§4.K). Composes the Cloud Query result, the retry/
//! fallback orchestrator, resumable download bookkeeping, and the flash
//! helper for PCI/PDRI/peripheral artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::cloud::CloudFirmwareSpec;
use crate::collaborators::{FwStateEvent, ImgDwlEvent, SharedEventBus, SharedFlashHelper};
use crate::config::ConfigFacade;
use crate::error::UpdateError;
use crate::mode::{AppMode, ModeController};
use crate::retry::{RetryOrchestrator, RetryOutcome};
use crate::state::{DownloadState, DownloadStateMachine};
use crate::transport::resumable::{delete_partial, read_prior_content_length, write_header_file};
use crate::transport::{DownloadJob, Sink, TransportHandle, TransportKind, TransportStatus, UpgradeKind};
use parking_lot::Mutex;

const MAX_FULL_RETRIES: u32 = 2;

/// [SUPPLEMENT] Upgrade origin, modeled as a small enum rather than a bare
/// wire integer; `from_bits`/`to_bits` exist for callers that still speak
/// the integer encoding at the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Bootup,
    Scheduled,
    RemoteManagement,
    App,
    Delayed,
    StateRed,
}

impl TriggerType {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(TriggerType::Bootup),
            1 => Some(TriggerType::Scheduled),
            2 => Some(TriggerType::RemoteManagement),
            3 => Some(TriggerType::App),
            4 => Some(TriggerType::Delayed),
            5 => Some(TriggerType::StateRed),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u32 {
        match self {
            TriggerType::Bootup => 0,
            TriggerType::Scheduled => 1,
            TriggerType::RemoteManagement => 2,
            TriggerType::App => 3,
            TriggerType::Delayed => 4,
            TriggerType::StateRed => 5,
        }
    }

    pub fn is_app_triggered(self) -> bool {
        matches!(self, TriggerType::App)
    }
}

/// Parsed from the maintenance opt-out file (§4.K step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptOutMode {
    None,
    IgnoreUpdate,
    EnforceOptout,
}

impl OptOutMode {
    pub fn read(path: &Path) -> Self {
        match std::fs::read_to_string(path).map(|s| s.trim().to_string()) {
            Ok(s) if s == "IGNORE_UPDATE" => OptOutMode::IgnoreUpdate,
            Ok(s) if s == "ENFORCE_OPTOUT" => OptOutMode::EnforceOptout,
            _ => OptOutMode::None,
        }
    }
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Completed { downloaded_version: String, download_path: PathBuf },
    NoUpgradeWarranted,
    WrongModel,
    InProgress,
    OnHoldForOptout,
    IgnoredByOptout,
    DownloadBlocked,
    Error(UpdateError),
}

fn compute_valid_pci(trigger: TriggerType, running_image_name: &str, spec: &CloudFirmwareSpec) -> bool {
    if trigger == TriggerType::StateRed {
        return true;
    }
    !spec.version.is_empty() && spec.version != running_image_name
}

pub struct UpgradePipeline {
    config: Arc<ConfigFacade>,
    state: Arc<DownloadStateMachine>,
    events: SharedEventBus,
    flash: SharedFlashHelper,
    orchestrator: Arc<RetryOrchestrator>,
    mode: Arc<ModeController>,
    active_handle: Mutex<Option<TransportHandle>>,
}

impl UpgradePipeline {
    pub fn new(
        config: Arc<ConfigFacade>,
        state: Arc<DownloadStateMachine>,
        events: SharedEventBus,
        flash: SharedFlashHelper,
        orchestrator: Arc<RetryOrchestrator>,
        mode: Arc<ModeController>,
    ) -> Self {
        Self {
            config,
            state,
            events,
            flash,
            orchestrator,
            mode,
            active_handle: Mutex::new(None),
        }
    }

    /// Applies an externally observed foreground/background transition
    /// (§4.J) to whichever download is currently active, if any.
    pub async fn apply_mode_change(&self, new_mode: AppMode) {
        let rfc = self.config.rfc();
        let handle = self.active_handle.lock().clone();
        self.mode.on_mode_change(new_mode, &rfc, &self.state, handle.as_ref()).await;
    }

    #[instrument(skip_all, fields(version = %spec.version, trigger = ?trigger))]
    pub async fn check_for_update_and_maybe_trigger(
        &self,
        spec: &CloudFirmwareSpec,
        trigger: TriggerType,
        critical: bool,
        download_only: bool,
        opt_out: OptOutMode,
    ) -> PipelineOutcome {
        if matches!(self.state.snapshot(), DownloadState::InProgress | DownloadState::FlashInProgress) {
            return PipelineOutcome::InProgress;
        }

        let device = self.config.device_info();
        if !spec.matches_model(&device.model) {
            self.events.emit_fw_state(FwStateEvent::Failed).await;
            return PipelineOutcome::WrongModel;
        }

        let running = &self.config.image().running_image_name;
        if !compute_valid_pci(trigger, running, spec) {
            return PipelineOutcome::NoUpgradeWarranted;
        }

        if device.maintenance_mode {
            match opt_out {
                OptOutMode::IgnoreUpdate if !critical => return PipelineOutcome::IgnoredByOptout,
                OptOutMode::EnforceOptout if !trigger.is_app_triggered() => {
                    self.events.emit_fw_state(FwStateEvent::OnholdForOptout).await;
                    return PipelineOutcome::OnHoldForOptout;
                }
                _ => {}
            }
        }

        let pci_path = device.image_download_path.join(&spec.cloud_fw_file);
        if let Err(e) = self.state.transition(DownloadState::Init) {
            warn!(error = %e, "unexpected state before PCI download");
        }
        let _ = self.state.transition(DownloadState::InProgress);
        self.events.emit_fw_state(FwStateEvent::Downloading).await;
        self.events.emit_img_dwl(ImgDwlEvent::InProgress).await;

        if let Err(failure) = self.download_with_resume(UpgradeKind::Pci, &spec.location, &pci_path).await {
            let _ = self.state.transition(DownloadState::Failed);
            self.events.emit_img_dwl(ImgDwlEvent::Failed).await;
            self.events.emit_fw_state(FwStateEvent::Failed).await;
            return failure.into_outcome();
        }
        let _ = self.state.transition(DownloadState::Complete);
        self.events.emit_img_dwl(ImgDwlEvent::Complete).await;
        self.events.emit_fw_state(FwStateEvent::DownloadComplete).await;

        if !download_only {
            let _ = self.state.transition(DownloadState::FlashInProgress);
            match self.flash.flash(&pci_path).await {
                Ok(()) => {
                    let _ = self.state.transition(DownloadState::FlashComplete);
                }
                Err(e) => {
                    let _ = self.state.transition(DownloadState::FlashFailed);
                    return PipelineOutcome::Error(e);
                }
            }
        }

        if !spec.immediate_reboot {
            if let Some(pdri) = &spec.pdri_version {
                if !pdri.ends_with(".bin") {
                    warn!(pdri, "PDRI version does not end in .bin; skipping");
                } else {
                    let pdri_path = device.image_download_path.join(pdri);
                    if let Err(failure) = self.download_with_resume(UpgradeKind::Pdri, &spec.location, &pdri_path).await {
                        warn!(?failure, "PDRI download failed");
                    } else if let Err(e) = self.flash.flash(&pdri_path).await {
                        warn!(error = %e, "PDRI flash failed");
                    }
                }
            }
        }

        if Path::new("/etc/os-release").exists() && !spec.peripheral_firmwares.is_empty() {
            for entry in &spec.peripheral_firmwares {
                self.maybe_download_peripheral(entry).await;
            }
        }

        PipelineOutcome::Completed {
            downloaded_version: spec.version.clone(),
            download_path: pci_path,
        }
    }

    /// §4.C's algorithm composed with §4.E's retry/fallback: resumes from an
    /// existing partial + header file, retries a full download on a rejected
    /// range or a post-completion size mismatch, up to [`MAX_FULL_RETRIES`].
    async fn download_with_resume(&self, kind: UpgradeKind, url: &str, sink_path: &Path) -> Result<(), DownloadFailure> {
        for _ in 0..=MAX_FULL_RETRIES {
            let prior_len = read_prior_content_length(sink_path);
            let mut resume_from = 0;
            if let Some(expected) = prior_len {
                let existing = std::fs::metadata(sink_path).map(|m| m.len()).unwrap_or(0);
                if existing == expected {
                    return Ok(());
                }
                resume_from = existing;
            }

            let mut job = DownloadJob::new(kind, TransportKind::Direct, url, Sink::File(sink_path.to_path_buf()));
            job.resume_from = resume_from;

            let handle = self.orchestrator.new_handle();
            *self.active_handle.lock() = Some(handle.clone());
            let result = self.orchestrator.run(&handle, job).await;
            *self.active_handle.lock() = None;

            match result {
                RetryOutcome::Success(outcome) => {
                    if let Some(expected_len) = outcome.content_length {
                        let actual = std::fs::metadata(sink_path).map(|m| m.len()).unwrap_or(0);
                        if actual != expected_len {
                            warn!(actual, expected_len, "size mismatch; retrying full download");
                            delete_partial(sink_path);
                            continue;
                        }
                        write_header_file(sink_path, expected_len);
                    }
                    return Ok(());
                }
                RetryOutcome::Offer404 => return Err(DownloadFailure::Offer404),
                RetryOutcome::StateRed => return Err(DownloadFailure::StateRed),
                RetryOutcome::Blocked => return Err(DownloadFailure::Blocked),
                RetryOutcome::Failed(status) if status.is_range_rejected() => {
                    delete_partial(sink_path);
                    continue;
                }
                RetryOutcome::Failed(status) => return Err(DownloadFailure::Status(status)),
            }
        }
        Err(DownloadFailure::Status(TransportStatus::CouldntConnect))
    }

    /// §4.K step 7: `<name>_<type>_<version>` entries, skipped if previously
    /// downloaded (tracked in a local dedup file) or already installed at an
    /// equal-or-newer version.
    async fn maybe_download_peripheral(&self, entry: &str) {
        let dedup_path = self
            .config
            .device_info()
            .persistent_path
            .join(crate::cloud::PERIPHERAL_VERSIONS_FILE);

        let already_downloaded = std::fs::read_to_string(&dedup_path)
            .map(|contents| contents.lines().any(|line| line == entry))
            .unwrap_or(false);
        if already_downloaded {
            return;
        }

        let Some((name, kind, version)) = parse_peripheral_entry(entry) else {
            warn!(entry, "malformed peripheral entry; skipping");
            return;
        };

        if let Some(installed) = self.config.device_property(&format!("peripheralVersion.{name}.{kind}")) {
            if version_is_equal_or_newer(&installed, version) {
                info!(entry, installed, "peripheral already up to date; skipping");
                return;
            }
        }

        let peripheral_path = self.config.device_info().image_download_path.join(format!("{entry}.tgz"));
        let url = format!("https://peripherals.example.com/{entry}.tgz");
        if self.download_with_resume(UpgradeKind::Peripheral, &url, &peripheral_path).await.is_ok() {
            if let Err(e) = append_to_dedup_file(&dedup_path, entry) {
                warn!(error = %e, "failed recording peripheral download");
            }
        }
    }
}

#[derive(Debug)]
enum DownloadFailure {
    Status(TransportStatus),
    Offer404,
    StateRed,
    Blocked,
}

impl DownloadFailure {
    fn into_outcome(self) -> PipelineOutcome {
        match self {
            DownloadFailure::Offer404 => PipelineOutcome::Error(UpdateError::NotAvailable("firmware offer not found".into())),
            DownloadFailure::StateRed => PipelineOutcome::Error(UpdateError::Network("certificate rejected; entering recovery".into())),
            DownloadFailure::Blocked => PipelineOutcome::DownloadBlocked,
            DownloadFailure::Status(status) => PipelineOutcome::Error(UpdateError::Network(format!("{status:?}"))),
        }
    }
}

fn parse_peripheral_entry(entry: &str) -> Option<(&str, &str, &str)> {
    let mut parts = entry.splitn(3, '_');
    let name = parts.next()?;
    let kind = parts.next()?;
    let version = parts.next()?;
    Some((name, kind, version))
}

fn version_is_equal_or_newer(installed: &str, offered: &str) -> bool {
    match (semver::Version::parse(installed), semver::Version::parse(offered)) {
        (Ok(a), Ok(b)) => a >= b,
        _ => installed == offered,
    }
}

fn append_to_dedup_file(path: &Path, entry: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{entry}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_bits_round_trip() {
        for bits in 0..=5u32 {
            let t = TriggerType::from_bits(bits).unwrap();
            assert_eq!(t.to_bits(), bits);
        }
        assert!(TriggerType::from_bits(6).is_none());
    }

    #[test]
    fn state_red_trigger_is_always_valid_pci() {
        let spec = CloudFirmwareSpec {
            cloud_fw_file: "MyModel_v1.bin".into(),
            location: String::new(),
            ipv6_location: String::new(),
            version: String::new(),
            protocol: None,
            immediate_reboot: false,
            delay_download: 0,
            peripheral_firmwares: vec![],
            cert_bundle_url: None,
            pdri_version: None,
        };
        assert!(compute_valid_pci(TriggerType::StateRed, "MyModel_v0", &spec));
        assert!(!compute_valid_pci(TriggerType::Bootup, "MyModel_v0", &spec));
    }

    #[test]
    fn parses_peripheral_entry() {
        assert_eq!(parse_peripheral_entry("remote_ir_1.2.3"), Some(("remote", "ir", "1.2.3")));
        assert_eq!(parse_peripheral_entry("nodashes"), None);
    }

    #[test]
    fn version_comparison_falls_back_to_string_equality_on_parse_failure() {
        assert!(version_is_equal_or_newer("weird", "weird"));
        assert!(!version_is_equal_or_newer("weird", "other"));
        assert!(version_is_equal_or_newer("2.0.0", "1.9.9"));
        assert!(!version_is_equal_or_newer("1.0.0", "1.1.0"));
    }

    #[test]
    fn opt_out_mode_reads_exact_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optout");
        std::fs::write(&path, "ENFORCE_OPTOUT").unwrap();
        assert_eq!(OptOutMode::read(&path), OptOutMode::EnforceOptout);
        std::fs::write(&path, "IGNORE_UPDATE").unwrap();
        assert_eq!(OptOutMode::read(&path), OptOutMode::IgnoreUpdate);
        assert_eq!(OptOutMode::read(&dir.path().join("missing")), OptOutMode::None);
    }
}
