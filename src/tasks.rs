//! Task Registry (§4.H part 1, §3 Task Context). Owns every in-flight IPC
//! task; destroyed when its reply has been delivered.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;

use crate::coalescer::Outcome;

pub type TaskId = u64;
pub type ClientHandlerId = u64;

pub struct Task {
    pub id: TaskId,
    pub client_id: ClientHandlerId,
    pub reply_tx: oneshot::Sender<Outcome>,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct TaskRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl TaskRegistry {
    /// Allocates a task id and a reply channel; the `Receiver` half is handed
    /// back to the IPC handler to `.await` directly.
    pub fn create(&self, client_id: ClientHandlerId) -> (TaskId, oneshot::Receiver<Outcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.tasks.lock().insert(
            id,
            Task {
                id,
                client_id,
                reply_tx: tx,
                started_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Removes and returns the task, e.g. to deliver its reply. `None` if the
    /// task was never registered or has already been taken.
    pub fn take(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().remove(&id)
    }

    /// Drops a task without delivering a reply (the owner already replied
    /// directly and is not itself a coalescer waiter).
    pub fn discard(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
