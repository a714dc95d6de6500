//! Download State Machine (§4.F). One enum behind one lock, process-wide.
//! Transitions are logged with old and new state; readers are non-blocking
//! snapshots.

use parking_lot::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Uninitialized,
    Init,
    InProgress,
    Complete,
    Failed,
    FlashInProgress,
    FlashComplete,
    FlashFailed,
    XconfInit,
    XconfInProgress,
    XconfComplete,
    XconfFailed,
}

impl DownloadState {
    pub const fn name(self) -> &'static str {
        match self {
            DownloadState::Uninitialized => "UNINITIALIZED",
            DownloadState::Init => "INIT",
            DownloadState::InProgress => "IN_PROGRESS",
            DownloadState::Complete => "COMPLETE",
            DownloadState::Failed => "FAILED",
            DownloadState::FlashInProgress => "FLASH_INPROGRESS",
            DownloadState::FlashComplete => "FLASH_COMPLETE",
            DownloadState::FlashFailed => "FLASH_FAILED",
            DownloadState::XconfInit => "XCONF_INIT",
            DownloadState::XconfInProgress => "XCONF_IN_PROGRESS",
            DownloadState::XconfComplete => "XCONF_COMPLETE",
            DownloadState::XconfFailed => "XCONF_FAILED",
        }
    }

    /// Whether `target` is a legal transition from `self`, per the diagram
    /// in §4.F.
    fn allows(self, target: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, target),
            (Uninitialized, Init)
                | (Init, InProgress)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (Complete, FlashInProgress)
                | (FlashInProgress, FlashComplete)
                | (FlashInProgress, FlashFailed)
                // a fresh attempt may always restart from a terminal state
                | (Complete, Init)
                | (Failed, Init)
                | (FlashComplete, Init)
                | (FlashFailed, Init)
                | (Uninitialized, XconfInit)
                | (XconfInit, XconfInProgress)
                | (XconfInProgress, XconfComplete)
                | (XconfInProgress, XconfFailed)
                | (XconfComplete, XconfInit)
                | (XconfFailed, XconfInit)
                | (XconfComplete, Init)
                | (XconfFailed, Init)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal download-state transition {from} -> {to}", from = from.name(), to = to.name())]
pub struct IllegalTransition {
    from: DownloadState,
    to: DownloadState,
}

pub struct DownloadStateMachine {
    inner: Mutex<DownloadState>,
}

impl Default for DownloadStateMachine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(DownloadState::Uninitialized),
        }
    }
}

impl DownloadStateMachine {
    pub fn snapshot(&self) -> DownloadState {
        *self.inner.lock()
    }

    /// Attempts the transition, logging old/new state. Rejects illegal edges.
    pub fn transition(&self, target: DownloadState) -> Result<(), IllegalTransition> {
        let mut guard = self.inner.lock();
        if !guard.allows(target) {
            return Err(IllegalTransition {
                from: *guard,
                to: target,
            });
        }
        info!(from = guard.name(), to = target.name(), "download state transition");
        *guard = target;
        Ok(())
    }

    /// Pause/Resume requires `IN_PROGRESS`; elsewhere it is a no-op (§4.F).
    pub fn is_pausable(&self) -> bool {
        matches!(self.snapshot(), DownloadState::InProgress)
    }
}
