//! Client Registry (§4.I, §3 Client). Handler ids are monotonic; re-register
//! of the same `(callerId, processName)` pair returns the existing id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub type HandlerId = u64;

#[derive(Debug, Clone)]
pub struct Client {
    pub handler_id: HandlerId,
    pub process_name: String,
    pub lib_version: String,
    pub caller_unique_name: String,
    pub registered_at: Instant,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("caller '{0}' is already registered under a different process name")]
    CallerMismatch(String),
    #[error("process '{0}' is already registered under a different caller")]
    ProcessMismatch(String),
}

#[derive(Default)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    by_handler: Mutex<HashMap<HandlerId, Client>>,
}

impl ClientRegistry {
    /// Re-register of the same `(callerId, processName)` returns the
    /// existing id. `(callerId, *new* processName)` and `(*new* callerId,
    /// existing processName)` are both rejected (§4.I).
    pub fn register(
        &self,
        process_name: &str,
        lib_version: &str,
        caller_unique_name: &str,
    ) -> Result<HandlerId, RegisterError> {
        let mut clients = self.by_handler.lock();

        if let Some(existing) = clients
            .values()
            .find(|c| c.caller_unique_name == caller_unique_name)
        {
            return if existing.process_name == process_name {
                Ok(existing.handler_id)
            } else {
                Err(RegisterError::CallerMismatch(caller_unique_name.to_string()))
            };
        }

        if clients.values().any(|c| c.process_name == process_name) {
            return Err(RegisterError::ProcessMismatch(process_name.to_string()));
        }

        let handler_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        clients.insert(
            handler_id,
            Client {
                handler_id,
                process_name: process_name.to_string(),
                lib_version: lib_version.to_string(),
                caller_unique_name: caller_unique_name.to_string(),
                registered_at: Instant::now(),
            },
        );
        Ok(handler_id)
    }

    pub fn unregister(&self, handler_id: HandlerId) -> bool {
        self.by_handler.lock().remove(&handler_id).is_some()
    }

    pub fn contains(&self, handler_id: HandlerId) -> bool {
        self.by_handler.lock().contains_key(&handler_id)
    }

    /// Drops every client whose `caller_unique_name` matches a disconnected
    /// IPC caller. A disconnected client's outstanding task is dropped
    /// silently elsewhere (the coalescer/registry just never gets a reply
    /// receiver for it).
    pub fn remove_by_caller(&self, caller_unique_name: &str) {
        self.by_handler
            .lock()
            .retain(|_, c| c.caller_unique_name != caller_unique_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_for_same_caller_and_process() {
        let r = ClientRegistry::default();
        let a = r.register("myproc", "1.0", "caller-1").unwrap();
        let b = r.register("myproc", "1.0", "caller-1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn same_caller_different_process_is_rejected() {
        let r = ClientRegistry::default();
        r.register("myproc", "1.0", "caller-1").unwrap();
        let err = r.register("otherproc", "1.0", "caller-1").unwrap_err();
        assert_eq!(err, RegisterError::CallerMismatch("caller-1".into()));
    }

    #[test]
    fn same_process_different_caller_is_rejected() {
        let r = ClientRegistry::default();
        r.register("myproc", "1.0", "caller-1").unwrap();
        let err = r.register("myproc", "1.0", "caller-2").unwrap_err();
        assert_eq!(err, RegisterError::ProcessMismatch("myproc".into()));
    }

    #[test]
    fn unregister_then_unregister_again_returns_true_then_false() {
        let r = ClientRegistry::default();
        let id = r.register("myproc", "1.0", "caller-1").unwrap();
        assert!(r.unregister(id));
        assert!(!r.unregister(id));
    }

    #[test]
    fn contains_reflects_registration() {
        let r = ClientRegistry::default();
        let id = r.register("myproc", "1.0", "caller-1").unwrap();
        assert!(r.contains(id));
        r.unregister(id);
        assert!(!r.contains(id));
    }
}
