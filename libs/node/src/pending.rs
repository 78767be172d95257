//! Correlation table for calls awaiting a reply
//!
//! Each entry pairs the caller's completion channel with the abort handle of
//! its timeout task. Whoever removes the entry under the lock, reply or timer,
//! is the only one to complete the call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

pub type Outcome = Result<Value>;

struct PendingEntry {
    completion: oneshot::Sender<Outcome>,
    timer: AbortHandle,
}

#[derive(Clone)]
pub struct PendingRequests {
    device_id: Arc<str>,
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: Arc::from(device_id),
            entries: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `request_id` and arm its timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, request_id: &str, timeout: Duration) -> oneshot::Receiver<Outcome> {
        let (completion, receiver) = oneshot::channel();

        let mut entries = self.lock();
        let table = self.clone();
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(&id);
        })
        .abort_handle();

        if let Some(previous) = entries.insert(
            request_id.to_string(),
            PendingEntry { completion, timer },
        ) {
            previous.timer.abort();
        }
        receiver
    }

    /// Complete a call with its reply
    ///
    /// Returns `false` when the id is unknown: already timed out, already
    /// answered, or never issued by this endpoint.
    pub fn resolve(&self, request_id: &str, outcome: Outcome) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            return false;
        };
        entry.timer.abort();
        // The caller may have stopped waiting
        let _ = entry.completion.send(outcome);
        true
    }

    /// Drop an entry without completing it
    pub fn discard(&self, request_id: &str) -> bool {
        match self.lock().remove(request_id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding call; returns how many there were
    pub fn fail_all(&self, error: impl Fn() -> Error) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.completion.send(Err(error()));
        }
        count
    }

    fn expire(&self, request_id: &str) {
        let Some(entry) = self.lock().remove(request_id) else {
            return;
        };
        tracing::debug!(device_id = %self.device_id, %request_id, "request timed out");
        let _ = entry.completion.send(Err(Error::Timeout {
            device_id: self.device_id.to_string(),
            request_id: request_id.to_string(),
        }));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reply_before_timeout_resolves() {
        let table = PendingRequests::new("alice");
        let receiver = table.register("r1", Duration::from_secs(2));
        assert_eq!(table.len(), 1);

        assert!(table.resolve("r1", Ok(json!({ "pong": 1 }))));
        assert_eq!(receiver.await.unwrap().unwrap(), json!({ "pong": 1 }));
        assert!(table.is_empty());

        // A late duplicate reply finds nothing
        assert!(!table.resolve("r1", Ok(json!(null))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let table = PendingRequests::new("alice");
        let receiver = table.register("r1", Duration::from_millis(50));

        match receiver.await.unwrap() {
            Err(Error::Timeout {
                device_id,
                request_id,
            }) => {
                assert_eq!(device_id, "alice");
                assert_eq!(request_id, "r1");
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(table.is_empty());
        assert!(!table.resolve("r1", Ok(json!(null))));
    }

    #[tokio::test(start_paused = true)]
    async fn many_timeouts_leave_table_empty() {
        let table = PendingRequests::new("alice");
        let receivers: Vec<_> = (0..500)
            .map(|i| table.register(&format!("r{i}"), Duration::from_millis(10)))
            .collect();

        for receiver in receivers {
            assert!(matches!(receiver.await.unwrap(), Err(Error::Timeout { .. })));
        }
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_reply_and_timeout_complete_once() {
        let table = PendingRequests::new("alice");

        for i in 0..200 {
            let id = format!("race-{i}");
            let receiver = table.register(&id, Duration::from_millis(1));

            let replier = {
                let table = table.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    table.resolve(&id, Ok(json!("reply")))
                })
            };

            let outcome = receiver.await.expect("completion sent exactly once");
            let reply_won = replier.await.unwrap();
            match outcome {
                Ok(value) => {
                    assert!(reply_won);
                    assert_eq!(value, json!("reply"));
                }
                Err(Error::Timeout { .. }) => assert!(!reply_won),
                Err(other) => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_rejects_and_clears() {
        let table = PendingRequests::new("alice");
        let first = table.register("a", Duration::from_secs(60));
        let second = table.register("b", Duration::from_secs(60));

        assert_eq!(table.fail_all(|| Error::ConnectionClosed), 2);
        assert!(matches!(first.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(second.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn discard_cancels_timer() {
        let table = PendingRequests::new("alice");
        let receiver = table.register("a", Duration::from_millis(10));

        assert!(table.discard("a"));
        // The sender was dropped without a value
        assert!(receiver.await.is_err());
        assert!(table.is_empty());
    }
}
