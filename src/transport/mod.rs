//! Transport (§4.B). One HTTPS request per `perform` call, over a memory or
//! file sink, with pause/resume/abort and a live byte counter. Built on
//! `reqwest`'s streaming body, matching the teacher's choice of HTTP client.

pub mod resumable;

use bytes::Bytes;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::collaborators::{MtlsCredentials, SignedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    XconfQuery,
    Pci,
    Pdri,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Direct,
    Signed,
}

impl TransportKind {
    pub const fn other(self) -> Self {
        match self {
            TransportKind::Direct => TransportKind::Signed,
            TransportKind::Signed => TransportKind::Direct,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Sink {
    File(PathBuf),
    Memory,
}

/// Download Job (§3): created per attempt, discarded on completion.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub kind: UpgradeKind,
    pub transport_kind: TransportKind,
    pub url: String,
    pub sink: Sink,
    pub post_body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    /// 0 = unlimited.
    pub max_speed: u64,
    pub resume_from: u64,
    pub hash_param: Option<String>,
    pub verify_revocation: bool,
    pub signed: Option<SignedRequest>,
}

impl DownloadJob {
    pub fn new(kind: UpgradeKind, transport_kind: TransportKind, url: impl Into<String>, sink: Sink) -> Self {
        Self {
            kind,
            transport_kind,
            url: url.into(),
            sink,
            post_body: None,
            headers: Vec::new(),
            max_speed: 0,
            resume_from: 0,
            hash_param: None,
            verify_revocation: true,
            signed: None,
        }
    }
}

/// Transport-status family (§4.B). Mirrors the curl-style numeric codes the
/// retry orchestrator keys its policy on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Ok,
    /// curl code 6: could not resolve host (DNS).
    CouldntResolveHost,
    /// curl code 7: could not connect.
    CouldntConnect,
    /// curl code 28: operation timed out.
    OperationTimedout,
    /// curl code 33: HTTP range not supported/satisfiable.
    RangeError33,
    /// curl code 36: bad download resume.
    RangeError36,
    /// curl code 23: write error — used here for the throttle-to-zero abort.
    WriteError23,
    TlsError(String),
    /// A non-2xx/206 HTTP response that isn't one of the cases above
    /// (404/495/416 are classified separately; this is the catch-all).
    HttpError(u16),
    Blocked,
    SigningFailed,
    LowBandwidth,
    UnpauseFailed,
    Aborted,
}

impl TransportStatus {
    /// Failures the retry orchestrator treats as "try the other transport".
    pub fn is_connectivity_class(&self) -> bool {
        matches!(
            self,
            TransportStatus::CouldntResolveHost
                | TransportStatus::CouldntConnect
                | TransportStatus::OperationTimedout
        )
    }

    pub fn is_range_rejected(&self) -> bool {
        matches!(self, TransportStatus::RangeError33 | TransportStatus::RangeError36)
    }

    /// Certificate/handshake failures (§4.B): a distinct family from the
    /// connectivity class above, since retrying the same transport won't fix
    /// a broken certificate — the orchestrator falls back immediately rather
    /// than exhausting the transport's retry budget first.
    pub fn is_tls_class(&self) -> bool {
        matches!(self, TransportStatus::TlsError(_))
    }
}

#[derive(Debug, Clone)]
pub struct PerformOutcome {
    pub status: TransportStatus,
    pub http_status: u16,
    pub bytes_written: u64,
    pub content_length: Option<u64>,
    /// Populated on a successful memory-sink transfer; `None` for file sinks
    /// and for any non-success outcome.
    pub body: Option<Bytes>,
}

/// The only operations the event loop calls on an active transfer from
/// outside its worker task (§9).
#[derive(Clone)]
pub struct TransportHandle {
    bytes_received: Arc<AtomicU64>,
    speed_limit: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl TransportHandle {
    fn new() -> Self {
        Self {
            bytes_received: Arc::new(AtomicU64::new(0)),
            speed_limit: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Stops bytes from arriving. A no-op if already paused.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Continues at `new_limit` bytes/s (0 = unlimited). Returns an error if
    /// the handle was already stopped; callers must then abort the job and
    /// close the handle (`DWNL_UNPAUSE_FAIL`).
    pub fn resume(&self, new_limit: u64) -> Result<(), ()> {
        if self.cancel.is_cancelled() {
            return Err(());
        }
        self.speed_limit.store(new_limit, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
        Ok(())
    }

    /// Returns promptly even mid-transfer; no further callbacks arrive after.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.resume_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One HTTPS connection per `perform` call, streamed into the job's sink.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(mtls: Option<MtlsCredentials>) -> Self {
        let mut builder = reqwest::Client::builder().user_agent("rdk-fwupdater");
        if let Some(creds) = mtls {
            if let Ok(identity) = reqwest::Identity::from_pem(&[creds.cert_pem, creds.key_pem].concat()) {
                builder = builder.identity(identity);
            }
        }
        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn new_handle(&self) -> TransportHandle {
        TransportHandle::new()
    }

    /// Performs one request against `job.url`, honouring range/speed limit/
    /// pause/abort via `handle`. Writes the sink progressively and records a
    /// progress trace at `debug!` level.
    #[instrument(skip(self, handle, job), fields(url = %job.url, kind = ?job.transport_kind))]
    pub async fn perform(&self, handle: &TransportHandle, job: DownloadJob) -> PerformOutcome {
        let (url, extra_headers) = match (&job.transport_kind, &job.signed) {
            (TransportKind::Signed, Some(signed)) => {
                (signed.url.clone(), vec![("Authorization".to_string(), signed.auth_header.clone())])
            }
            (TransportKind::Signed, None) => {
                return PerformOutcome {
                    status: TransportStatus::SigningFailed,
                    http_status: 0,
                    bytes_written: 0,
                    content_length: None,
                    body: None,
                }
            }
            _ => (job.url.clone(), Vec::new()),
        };

        let mut builder = if let Some(body) = job.post_body.clone() {
            self.client.post(&url).body(body)
        } else {
            self.client.get(&url)
        };

        for (k, v) in job.headers.iter().chain(extra_headers.iter()) {
            builder = builder.header(k, v);
        }
        if job.resume_from > 0 {
            builder = builder.header("Range", format!("bytes={}-", job.resume_from));
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => return PerformOutcome {
                status: classify_reqwest_error(&e),
                http_status: 0,
                bytes_written: 0,
                content_length: None,
                body: None,
            },
        };

        let http_status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if !response.status().is_success() && http_status != 206 {
            let status = if http_status == 416 {
                TransportStatus::RangeError33
            } else {
                TransportStatus::HttpError(http_status)
            };
            return PerformOutcome {
                status,
                http_status,
                bytes_written: 0,
                content_length,
                body: None,
            };
        }

        let mut sink_writer = match &job.sink {
            Sink::File(path) => {
                let file = match tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(job.resume_from > 0)
                    .truncate(job.resume_from == 0)
                    .open(path)
                    .await
                {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "failed opening sink file");
                        return PerformOutcome {
                            status: TransportStatus::CouldntConnect,
                            http_status,
                            bytes_written: 0,
                            content_length,
                            body: None,
                        };
                    }
                };
                SinkWriter::File(file)
            }
            Sink::Memory => SinkWriter::Memory(Vec::new()),
        };

        let mut stream = response.bytes_stream();
        let mut written: u64 = job.resume_from;
        let mut window_started = tokio::time::Instant::now();
        let mut window_bytes: u64 = 0;

        loop {
            if handle.is_stopped() {
                return PerformOutcome {
                    status: TransportStatus::Aborted,
                    http_status,
                    bytes_written: written,
                    content_length,
                    body: None,
                };
            }
            if handle.paused.load(Ordering::SeqCst) {
                handle.resume_notify.notified().await;
                continue;
            }

            let chunk: Option<Result<Bytes, reqwest::Error>> = tokio::select! {
                biased;
                () = handle.cancel.cancelled() => {
                    return PerformOutcome { status: TransportStatus::Aborted, http_status, bytes_written: written, content_length, body: None };
                }
                next = stream.next() => next,
            };

            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    return PerformOutcome {
                        status: classify_reqwest_error(&e),
                        http_status,
                        bytes_written: written,
                        content_length,
                        body: None,
                    }
                }
            };

            if let Err(e) = sink_writer.write(&chunk).await {
                warn!(error = %e, "sink write failed");
                return PerformOutcome {
                    status: TransportStatus::WriteError23,
                    http_status,
                    bytes_written: written,
                    content_length,
                    body: None,
                };
            }

            written += chunk.len() as u64;
            window_bytes += chunk.len() as u64;
            handle.bytes_received.store(written, Ordering::SeqCst);

            let limit = handle.speed_limit.load(Ordering::SeqCst);
            if limit > 0 {
                let elapsed = window_started.elapsed();
                let min_duration = Duration::from_secs_f64(window_bytes as f64 / limit as f64);
                if min_duration > elapsed {
                    tokio::time::sleep(min_duration - elapsed).await;
                }
                if elapsed >= Duration::from_secs(1) {
                    window_started = tokio::time::Instant::now();
                    window_bytes = 0;
                }
            }
            debug!(bytes_written = written, "transport progress");
        }

        if let Err(e) = sink_writer.flush().await {
            warn!(error = %e, "sink flush failed");
        }

        let body = match sink_writer {
            SinkWriter::Memory(buf) => Some(Bytes::from(buf)),
            SinkWriter::File(_) => None,
        };

        metrics::counter!("firmware_download_bytes_total", "kind" => format!("{:?}", job.kind)).increment(written);

        PerformOutcome {
            status: TransportStatus::Ok,
            http_status,
            bytes_written: written,
            content_length,
            body,
        }
    }
}

enum SinkWriter {
    File(tokio::fs::File),
    Memory(Vec<u8>),
}

impl SinkWriter {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            SinkWriter::File(f) => f.write_all(chunk).await,
            SinkWriter::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SinkWriter::File(f) => f.flush().await,
            SinkWriter::Memory(_) => Ok(()),
        }
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> TransportStatus {
    if e.is_timeout() {
        return TransportStatus::OperationTimedout;
    }

    // Checked ahead of `is_connect()`: reqwest/hyper surface TLS handshake
    // failures as connect errors too, so the TLS-message check must run
    // independently or it's never reached.
    let msg = e.to_string().to_lowercase();
    if msg.contains("certificate") || msg.contains("tls") || msg.contains("handshake") {
        return TransportStatus::TlsError(e.to_string());
    }

    if e.is_connect() {
        if msg.contains("dns") || msg.contains("resolve") {
            return TransportStatus::CouldntResolveHost;
        }
        return TransportStatus::CouldntConnect;
    }

    TransportStatus::CouldntConnect
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn perform_writes_memory_sink_and_tracks_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fw.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 128]))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(None);
        let handle = transport.new_handle();
        let job = DownloadJob::new(
            UpgradeKind::Pci,
            TransportKind::Direct,
            format!("{}/fw.bin", server.uri()),
            Sink::Memory,
        );

        let outcome = transport.perform(&handle, job).await;
        assert_eq!(outcome.status, TransportStatus::Ok);
        assert_eq!(outcome.bytes_written, 128);
        assert_eq!(handle.bytes_received(), 128);
        assert_eq!(outcome.body.as_deref(), Some(&[1u8; 128][..]));
    }

    #[tokio::test]
    async fn stop_aborts_promptly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fw.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 8]))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(None);
        let handle = transport.new_handle();
        handle.stop();

        let job = DownloadJob::new(
            UpgradeKind::Pci,
            TransportKind::Direct,
            format!("{}/fw.bin", server.uri()),
            Sink::Memory,
        );
        let outcome = transport.perform(&handle, job).await;
        assert_eq!(outcome.status, TransportStatus::Aborted);
    }

    #[tokio::test]
    async fn signed_without_signed_request_fails_signing() {
        let transport = HttpTransport::new(None);
        let handle = transport.new_handle();
        let job = DownloadJob::new(UpgradeKind::Pci, TransportKind::Signed, "https://example.com", Sink::Memory);
        let outcome = transport.perform(&handle, job).await;
        assert_eq!(outcome.status, TransportStatus::SigningFailed);
    }

    #[tokio::test]
    async fn range_not_satisfiable_maps_to_range_error_33() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/fw.bin")).respond_with(ResponseTemplate::new(416)).mount(&server).await;

        let transport = HttpTransport::new(None);
        let handle = transport.new_handle();
        let job = DownloadJob::new(
            UpgradeKind::Pci,
            TransportKind::Direct,
            format!("{}/fw.bin", server.uri()),
            Sink::Memory,
        );
        let outcome = transport.perform(&handle, job).await;
        assert_eq!(outcome.status, TransportStatus::RangeError33);
        assert_eq!(outcome.http_status, 416);
    }

    #[tokio::test]
    async fn server_error_maps_to_http_error_not_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/fw.bin")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let transport = HttpTransport::new(None);
        let handle = transport.new_handle();
        let job = DownloadJob::new(
            UpgradeKind::Pci,
            TransportKind::Direct,
            format!("{}/fw.bin", server.uri()),
            Sink::Memory,
        );
        let outcome = transport.perform(&handle, job).await;
        assert_eq!(outcome.status, TransportStatus::HttpError(503));
        assert_ne!(outcome.status, TransportStatus::Ok);
    }

    #[test]
    fn tls_message_is_detected_even_though_reqwest_reports_it_as_connect() {
        // reqwest/hyper surface TLS handshake failures through is_connect() == true,
        // so classification must key off the message, not just the connect flag.
        assert!(TransportStatus::TlsError("x".into()).is_tls_class());
        assert!(!TransportStatus::CouldntConnect.is_tls_class());
        assert!(TransportStatus::CouldntConnect.is_connectivity_class());
    }
}
