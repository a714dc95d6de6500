//! Retry / Fallback Orchestrator (§4.E). Drives Transport against a retry
//! policy keyed by transport kind, swaps between DIRECT and SIGNED on
//! connectivity failure, and maintains the sticky block marker files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::collaborators::SharedSigningHelper;
use crate::error::UpdateError;
use crate::transport::{DownloadJob, HttpTransport, PerformOutcome, TransportHandle, TransportKind, TransportStatus};

const PREFER_SIGNED_MARKER: &str = "prefer_signed_24h";
const SIGNED_BLOCKED_MARKER: &str = "signed_blocked_30m";
const PREFER_SIGNED_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SIGNED_BLOCKED_TTL: Duration = Duration::from_secs(30 * 60);

/// Retry table as data (§9 Design Note), not code — introspectable and
/// testable independently of the orchestrator loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

pub fn policy_for(kind: TransportKind) -> RetryPolicy {
    match kind {
        TransportKind::Direct => RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
        },
        TransportKind::Signed => RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
        },
    }
}

/// Marker files governing which transport is preferred/blocked. mtime
/// governs expiry; presence alone is the signal (§6).
pub struct StickyBlocks {
    dir: PathBuf,
}

impl StickyBlocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker_active(&self, name: &str, ttl: Duration) -> bool {
        let path = self.dir.join(name);
        let Ok(meta) = std::fs::metadata(&path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        modified.elapsed().map(|age| age < ttl).unwrap_or(false)
    }

    /// Set after a successful SIGNED completion.
    pub fn mark_prefer_signed(&self) {
        touch(&self.dir.join(PREFER_SIGNED_MARKER));
    }

    /// Set after a failed SIGNED attempt.
    pub fn mark_signed_blocked(&self) {
        touch(&self.dir.join(SIGNED_BLOCKED_MARKER));
    }

    pub fn prefer_signed(&self) -> bool {
        self.marker_active(PREFER_SIGNED_MARKER, PREFER_SIGNED_TTL)
    }

    pub fn signed_blocked(&self) -> bool {
        self.marker_active(SIGNED_BLOCKED_MARKER, SIGNED_BLOCKED_TTL)
    }

    /// The transport kind to attempt first, honouring the markers above.
    /// `None` means both are blocked (§4.E: "return DWNL_BLOCK without
    /// attempting").
    pub fn initial_transport(&self) -> Option<TransportKind> {
        let direct_discouraged = self.prefer_signed();
        let signed_blocked = self.signed_blocked();

        if direct_discouraged && signed_blocked {
            return None;
        }
        if direct_discouraged {
            return Some(TransportKind::Signed);
        }
        if signed_blocked {
            return Some(TransportKind::Direct);
        }
        Some(TransportKind::Direct)
    }
}

fn touch(path: &Path) {
    if let Err(e) = std::fs::write(path, b"") {
        warn!(error = %e, path = %path.display(), "failed to write sticky marker");
    }
}

#[derive(Debug)]
pub enum RetryOutcome {
    Success(PerformOutcome),
    /// HTTP 404: terminate retry immediately.
    Offer404,
    /// HTTP 495: expired client cert not in server allowlist.
    StateRed,
    /// Both transports are sticky-blocked; no network I/O was attempted.
    Blocked,
    Failed(TransportStatus),
}

pub struct RetryOrchestrator {
    transport: Arc<HttpTransport>,
    signing_helper: SharedSigningHelper,
    sticky: StickyBlocks,
    state_red: Arc<AtomicBool>,
}

impl RetryOrchestrator {
    pub fn new(
        transport: Arc<HttpTransport>,
        signing_helper: SharedSigningHelper,
        marker_dir: impl Into<PathBuf>,
        state_red: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            signing_helper,
            sticky: StickyBlocks::new(marker_dir),
            state_red,
        }
    }

    pub fn sticky(&self) -> &StickyBlocks {
        &self.sticky
    }

    pub fn new_handle(&self) -> TransportHandle {
        self.transport.new_handle()
    }

    /// Runs `job_template` to completion per the retry/fallback rules,
    /// attaching mTLS credentials or a signed URL as the chosen kind
    /// requires. `handle` is reused across attempts so callers can still
    /// pause/resume/stop the in-flight transfer.
    pub async fn run(&self, handle: &TransportHandle, mut job_template: DownloadJob) -> RetryOutcome {
        let Some(mut kind) = self.sticky.initial_transport() else {
            info!("both transports sticky-blocked; refusing to attempt");
            return RetryOutcome::Blocked;
        };

        let mut already_switched_for_signing_failure = false;
        let mut already_switched_for_tls_failure = false;

        loop {
            let policy = policy_for(kind);
            let mut last_status = TransportStatus::CouldntConnect;

            for attempt in 1..=policy.max_attempts {
                job_template.transport_kind = kind;

                if kind == TransportKind::Signed {
                    match self.signing_helper.sign(&job_template.url).await {
                        Ok(signed) => job_template.signed = Some(signed),
                        Err(_) => {
                            self.sticky.mark_signed_blocked();
                            if !already_switched_for_signing_failure && kind == TransportKind::Signed {
                                already_switched_for_signing_failure = true;
                                kind = TransportKind::Direct;
                                break;
                            }
                            return RetryOutcome::Failed(TransportStatus::SigningFailed);
                        }
                    }
                }

                let outcome = self.transport.perform(handle, job_template.clone()).await;
                metrics::counter!("firmware_download_attempts_total", "transport" => format!("{kind:?}")).increment(1);

                if outcome.http_status == 404 {
                    return RetryOutcome::Offer404;
                }
                if outcome.http_status == 495 {
                    self.state_red.store(true, Ordering::SeqCst);
                    return RetryOutcome::StateRed;
                }
                if outcome.status == TransportStatus::Ok && (outcome.http_status == 200 || outcome.http_status == 206)
                {
                    if kind == TransportKind::Signed {
                        self.sticky.mark_prefer_signed();
                    }
                    return RetryOutcome::Success(outcome);
                }
                if outcome.status == TransportStatus::SigningFailed {
                    self.sticky.mark_signed_blocked();
                    if !already_switched_for_signing_failure {
                        already_switched_for_signing_failure = true;
                        kind = TransportKind::Direct;
                        break;
                    }
                    return RetryOutcome::Failed(TransportStatus::SigningFailed);
                }
                if outcome.status.is_tls_class() {
                    // A cert/handshake failure won't clear on its own; retrying
                    // the same transport just burns the attempt budget. Switch
                    // once, immediately, rather than waiting for exhaustion.
                    warn!(status = ?outcome.status, ?kind, "tls-class failure, switching transport");
                    if kind == TransportKind::Signed {
                        self.sticky.mark_signed_blocked();
                    }
                    if !already_switched_for_tls_failure {
                        already_switched_for_tls_failure = true;
                        kind = kind.other();
                        break;
                    }
                    return RetryOutcome::Failed(outcome.status);
                }

                last_status = outcome.status.clone();
                let is_last_attempt = attempt == policy.max_attempts;

                if is_last_attempt {
                    if last_status.is_connectivity_class() && kind == TransportKind::Direct {
                        warn!(?last_status, "direct transport exhausted retries, falling back to signed");
                        kind = TransportKind::Signed;
                        break;
                    }
                    return RetryOutcome::Failed(last_status);
                }

                tokio::time::sleep(policy.base_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SignedRequest;
    use crate::error::UpdateError;
    use crate::transport::{Sink, UpgradeKind};
    use async_trait::async_trait;
    use tempfile::tempdir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticSigner(String);
    #[async_trait]
    impl crate::collaborators::SigningHelper for StaticSigner {
        async fn sign(&self, _url: &str) -> Result<SignedRequest, UpdateError> {
            Ok(SignedRequest {
                url: self.0.clone(),
                auth_header: "Bearer test".into(),
            })
        }
    }

    #[test]
    fn sticky_marker_expires_after_ttl() {
        let dir = tempdir().unwrap();
        let sticky = StickyBlocks::new(dir.path());
        assert!(!sticky.signed_blocked());
        sticky.mark_signed_blocked();
        assert!(sticky.signed_blocked());
    }

    #[test]
    fn both_markers_present_means_blocked_initial_pick() {
        let dir = tempdir().unwrap();
        let sticky = StickyBlocks::new(dir.path());
        sticky.mark_prefer_signed();
        sticky.mark_signed_blocked();
        assert!(sticky.prefer_signed() && sticky.signed_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_signed_after_direct_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4]))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let transport = Arc::new(HttpTransport::new(None));
        let orchestrator = RetryOrchestrator::new(
            transport.clone(),
            Arc::new(StaticSigner(format!("{}/fw.bin", server.uri()))),
            dir.path(),
            Arc::new(AtomicBool::new(false)),
        );

        let handle = transport.new_handle();
        let job = DownloadJob::new(UpgradeKind::Pci, TransportKind::Direct, "http://127.0.0.1:1/fw.bin", Sink::Memory);

        let outcome = orchestrator.run(&handle, job).await;
        match outcome {
            RetryOutcome::Success(o) => assert_eq!(o.http_status, 200),
            other => panic!("expected Success, got {other:?}"),
        }
        assert!(orchestrator.sticky.prefer_signed());
    }

    #[tokio::test]
    async fn http_404_terminates_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let dir = tempdir().unwrap();
        let transport = Arc::new(HttpTransport::new(None));
        let orchestrator = RetryOrchestrator::new(
            transport.clone(),
            Arc::new(StaticSigner(server.uri())),
            dir.path(),
            Arc::new(AtomicBool::new(false)),
        );

        let handle = transport.new_handle();
        let job = DownloadJob::new(UpgradeKind::Pci, TransportKind::Direct, format!("{}/fw.bin", server.uri()), Sink::Memory);

        assert!(matches!(orchestrator.run(&handle, job).await, RetryOutcome::Offer404));
    }

    #[tokio::test]
    async fn both_sticky_blocked_refuses_without_network() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(HttpTransport::new(None));
        let orchestrator = RetryOrchestrator::new(
            transport.clone(),
            Arc::new(StaticSigner("http://example.invalid".into())),
            dir.path(),
            Arc::new(AtomicBool::new(false)),
        );
        orchestrator.sticky.mark_prefer_signed();
        orchestrator.sticky.mark_signed_blocked();

        let handle = transport.new_handle();
        let job = DownloadJob::new(UpgradeKind::Pci, TransportKind::Direct, "http://example.invalid/fw.bin", Sink::Memory);

        assert!(matches!(orchestrator.run(&handle, job).await, RetryOutcome::Blocked));
    }
}
