//! Error taxonomy (§7). Everything recoverable is retried in-process and
//! masked from the IPC client; only the final outcome crosses the boundary.

use thiserror::Error;

/// The outcome surfaced to an IPC caller once retries are exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// Class 1: unregistered handler, unknown method, malformed arguments.
    #[error("caller error: {0}")]
    Caller(String),

    /// Class 2: missing device identity, no cloud URL resolvable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Class 3/4 surfaced after retry: network error or 404.
    #[error("update not available: {0}")]
    NotAvailable(String),

    /// Class 3 final surface after retries are exhausted.
    #[error("network error: {0}")]
    Network(String),

    /// Class 5: cloud spec does not validate against the device model.
    #[error("validation error: {0}")]
    Validation(String),

    /// Class 6: disk full, flash helper failure, and similar.
    #[error("local system error: {0}")]
    LocalSystem(String),

    /// An upgrade is already running and a second one was requested.
    #[error("an upgrade is already in progress")]
    InProgress,

    /// Both SIGNED and DIRECT transports are sticky-blocked.
    #[error("download blocked: both transports are currently sticky-blocked")]
    DownloadBlocked,
}

impl UpdateError {
    /// The stable string the IPC layer puts in `updateDetails`/`message` fields.
    pub fn wire_message(&self) -> String {
        match self {
            UpdateError::Validation(_) => "Firmware validation failed - not for this device model".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
