//! Pending request table keyed by `task_id`.
//!
//! Each entry owns a oneshot slot. The waiter holds a guard that removes the
//! entry when it returns, times out, or is dropped, so a result that arrives
//! afterwards finds nothing to fill and is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::messaging::TaskResult;

/// Cap applied to waits whose deadline would not fit in an `Instant`.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct PendingEntry {
    created_at: Instant,
    slot: oneshot::Sender<TaskResult>,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, task_id: &str, timeout: Duration) -> Result<PendingWait> {
        let (slot, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + MAX_WAIT);

        let mut entries = self.entries.lock();
        if entries.contains_key(task_id) {
            return Err(MeshError::validation(format!(
                "task {} is already pending",
                task_id
            )));
        }
        entries.insert(
            task_id.to_string(),
            PendingEntry {
                created_at: now,
                slot,
            },
        );

        Ok(PendingWait {
            task_id: task_id.to_string(),
            deadline,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hands `result` to its waiter. Returns false for late or unknown results.
    pub fn fulfill(&self, result: TaskResult) -> bool {
        let Some(entry) = self.entries.lock().remove(&result.task_id) else {
            debug!(task_id = %result.task_id, status = %result.status, "Dropping result with no pending request");
            return false;
        };
        let waited_ms = entry.created_at.elapsed().as_millis() as u64;
        let task_id = result.task_id.clone();
        if entry.slot.send(result).is_err() {
            debug!(task_id = %task_id, "Waiter gone before result arrived");
            return false;
        }
        debug!(task_id = %task_id, waited_ms, "Pending request fulfilled");
        true
    }

    /// Completes every outstanding wait with a result built from its task id.
    pub fn cancel_all(&self, build: impl Fn(&str) -> TaskResult) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (task_id, entry) in drained {
            let _ = entry.slot.send(build(&task_id));
        }
        count
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, task_id: &str) -> bool {
        self.entries.lock().remove(task_id).is_some()
    }
}

/// Waiter side of one pending request.
pub struct PendingWait {
    task_id: String,
    deadline: Instant,
    rx: oneshot::Receiver<TaskResult>,
    table: Arc<PendingRequests>,
}

impl PendingWait {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits until the result arrives or the deadline passes (`None`).
    pub async fn wait(mut self) -> Option<TaskResult> {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if self.table.evict(&self.task_id) {
            debug!(task_id = %self.task_id, "Pending request evicted");
        }
    }
}
