//! Foreground/Background Controller (§4.J). Reacts to external mode-change
//! events while a download is `IN_PROGRESS`, applying the throttle policy.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::{MaintFwDownloadEvent, SharedEventBus};
use crate::config::RfcSettings;
use crate::state::{DownloadState, DownloadStateMachine};
use crate::transport::TransportHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Foreground,
    Background,
}

/// Process-wide mode latch, behind its own mutex (§5: "nothing holds two
/// locks simultaneously").
pub struct ModeController {
    mode: Mutex<AppMode>,
    force_exit: Arc<AtomicBool>,
    events: SharedEventBus,
}

impl ModeController {
    pub fn new(events: SharedEventBus, force_exit: Arc<AtomicBool>) -> Self {
        Self {
            mode: Mutex::new(AppMode::Foreground),
            force_exit,
            events,
        }
    }

    pub fn current(&self) -> AppMode {
        *self.mode.lock()
    }

    /// Applies a mode change received from the external event bus. When a
    /// download is not `IN_PROGRESS` this only updates the latch.
    pub async fn on_mode_change(
        &self,
        new_mode: AppMode,
        rfc: &RfcSettings,
        state: &DownloadStateMachine,
        active_handle: Option<&TransportHandle>,
    ) {
        *self.mode.lock() = new_mode;
        info!(?new_mode, "app mode changed");

        if state.snapshot() != DownloadState::InProgress {
            return;
        }

        let Some(handle) = active_handle else {
            return;
        };

        match new_mode {
            AppMode::Background if rfc.throttle_enabled => {
                if rfc.top_speed == 0 {
                    warn!("background throttle top-speed is zero; aborting active download");
                    self.force_exit.store(true, Ordering::SeqCst);
                    handle.stop();
                    let _ = state.transition(DownloadState::Failed);
                    self.events.emit_maint_fwdownload(MaintFwDownloadEvent::Error).await;
                } else {
                    handle.pause();
                    if handle.resume(rfc.top_speed).is_err() {
                        handle.stop();
                    }
                }
            }
            AppMode::Background => {
                // Throttle disabled: background mode alone does not affect speed.
            }
            AppMode::Foreground => {
                handle.pause();
                if handle.resume(0).is_err() {
                    handle.stop();
                }
            }
        }
    }

    pub fn force_exit_requested(&self) -> bool {
        self.force_exit.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TracingEventBus;
    use crate::transport::HttpTransport;
    use std::sync::Arc;

    fn controller() -> ModeController {
        ModeController::new(Arc::new(TracingEventBus), Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn background_zero_speed_fails_download_and_sets_force_exit() {
        let ctl = controller();
        let state = DownloadStateMachine::default();
        state.transition(DownloadState::Init).unwrap();
        state.transition(DownloadState::InProgress).unwrap();

        let transport = HttpTransport::new(None);
        let handle = transport.new_handle();

        let rfc = RfcSettings {
            throttle_enabled: true,
            top_speed: 0,
            incremental_cdl: false,
            mtls_enabled: false,
            debug_services: false,
            manage_notify: false,
            auto_excluded: false,
        };

        ctl.on_mode_change(AppMode::Background, &rfc, &state, Some(&handle)).await;

        assert_eq!(state.snapshot(), DownloadState::Failed);
        assert!(ctl.force_exit_requested());
    }

    #[tokio::test]
    async fn foreground_with_no_active_download_is_a_noop() {
        let ctl = controller();
        let state = DownloadStateMachine::default();
        let rfc = RfcSettings {
            throttle_enabled: true,
            top_speed: 0,
            incremental_cdl: false,
            mtls_enabled: false,
            debug_services: false,
            manage_notify: false,
            auto_excluded: false,
        };
        ctl.on_mode_change(AppMode::Foreground, &rfc, &state, None).await;
        assert_eq!(state.snapshot(), DownloadState::Uninitialized);
        assert!(!ctl.force_exit_requested());
    }
}
