//! Single-flight Coalescer (§4.G). Collapses concurrent calls of the same
//! operation kind into one worker; late arrivals park on a waiter list and
//! are fanned the result once the worker publishes.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::error::UpdateError;
use crate::tasks::{TaskId, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CheckUpdate,
    DownloadFw,
}

/// The value fanned out to every waiter on `publish`. Operation-specific
/// payloads are serialized to this generic envelope so the coalescer stays
/// ignorant of what CheckUpdate/DownloadFw actually return.
pub type Outcome = Result<serde_json::Value, UpdateError>;

struct Inflight {
    in_progress: bool,
    waiters: Vec<TaskId>,
    last_result: Option<Outcome>,
}

impl Default for Inflight {
    fn default() -> Self {
        Self {
            in_progress: false,
            waiters: Vec::new(),
            last_result: None,
        }
    }
}

pub enum Claim {
    /// Caller owns the work and must eventually call [`Coalescer::publish`].
    Own,
    /// Caller's task was parked; its reply will arrive via its own task
    /// reply channel once the owner publishes.
    Wait,
}

/// Owned per process; one [`Inflight`] group per operation kind.
pub struct Coalescer {
    groups: Mutex<HashMap<OperationKind, Inflight>>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl Coalescer {
    /// Atomic test-and-set: if no worker is running for `kind`, marks it
    /// running and returns [`Claim::Own`]; otherwise parks `task_id` and
    /// returns [`Claim::Wait`].
    pub fn claim_or_wait(&self, kind: OperationKind, task_id: TaskId) -> Claim {
        let mut groups = self.groups.lock();
        let group = groups.entry(kind).or_default();
        if group.in_progress {
            group.waiters.push(task_id);
            debug!(?kind, task_id, "task parked on coalescer waiter list");
            metrics::gauge!("coalescer_waiters", "kind" => format!("{kind:?}")).set(group.waiters.len() as f64);
            Claim::Wait
        } else {
            group.in_progress = true;
            Claim::Own
        }
    }

    /// Delivers `result` to every waiting task (looking up its reply handle
    /// in the task registry, clearing the task), clears the waiter list, and
    /// marks the group as no longer in progress. Idempotent against tasks
    /// whose client already disconnected — those are dropped silently.
    pub fn publish(&self, kind: OperationKind, result: Outcome, registry: &TaskRegistry) {
        let waiters = {
            let mut groups = self.groups.lock();
            let group = groups.entry(kind).or_default();
            group.in_progress = false;
            group.last_result = Some(result.clone());
            std::mem::take(&mut group.waiters)
        };

        debug!(?kind, waiters = waiters.len(), "publishing coalesced result");
        for task_id in waiters {
            if let Some(task) = registry.take(task_id) {
                // A disconnected receiver is not an error: the client gave
                // up its reply slot.
                let _ = task.reply_tx.send(result.clone());
            }
        }
    }

    /// Returns the last completed result for `kind`, for a latecomer that
    /// arrives between a worker's completion and the waiter-list flush.
    pub fn last_result(&self, kind: OperationKind) -> Option<Outcome> {
        self.groups.lock().get(&kind).and_then(|g| g.last_result.clone())
    }
}
