use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{HubError, HubResult};
use crate::types::{PeerId, Task, TaskState};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Tracks asynchronous requests until their reply arrives and the caller has read it.
///
/// Every mutation goes through a single dashmap entry, so the terminal transition, a read
/// and the eviction that follows it never interleave for the same request id.
pub struct TaskCorrelator {
    tasks: DashMap<String, Task>,
    retention: Duration,
}

impl Default for TaskCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl TaskCorrelator {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn open(&self, request_id: &str, peer_id: &PeerId) -> HubResult<Task> {
        match self.tasks.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(HubError::DuplicateRequestId(request_id.to_string())),
            Entry::Vacant(slot) => {
                let task = Task::pending(request_id.to_string(), peer_id.clone());
                slot.insert(task.clone());
                debug!(request_id, peer_id = %peer_id, "Task opened");
                Ok(task)
            }
        }
    }

    /// Applies the terminal transition. Returns `false`, leaving state untouched, when the
    /// request is unknown (never opened or already reaped) or already terminal.
    pub fn resolve(&self, request_id: &str, outcome: Result<Value, String>) -> bool {
        self.transition(request_id, None, outcome)
    }

    /// Like [`resolve`](Self::resolve), but only for a task addressed to `peer_id`, so one
    /// device cannot settle another device's request.
    pub fn resolve_from(
        &self,
        peer_id: &PeerId,
        request_id: &str,
        outcome: Result<Value, String>,
    ) -> bool {
        self.transition(request_id, Some(peer_id), outcome)
    }

    fn transition(
        &self,
        request_id: &str,
        owner: Option<&PeerId>,
        outcome: Result<Value, String>,
    ) -> bool {
        let Some(mut task) = self.tasks.get_mut(request_id) else {
            debug!(request_id, "Reply for unknown task dropped");
            return false;
        };
        if task.state.is_terminal() {
            debug!(request_id, state = ?task.state, "Reply for finished task dropped");
            return false;
        }
        if let Some(owner) = owner {
            if task.peer_id != *owner {
                debug!(
                    request_id,
                    peer_id = %owner,
                    owner = %task.peer_id,
                    "Reply from a peer that does not own the task dropped"
                );
                return false;
            }
        }

        match outcome {
            Ok(result) => {
                task.state = TaskState::Completed;
                task.result = Some(result);
            }
            Err(error) => {
                task.state = TaskState::Failed;
                task.error = Some(error);
            }
        }
        task.completed_at = Some(Utc::now());
        info!(request_id, peer_id = %task.peer_id, state = ?task.state, "Task resolved");
        true
    }

    pub fn read(&self, request_id: &str) -> HubResult<Task> {
        self.read_at(request_id, Utc::now())
    }

    /// Returns the task as of `now`. A terminal task older than the retention window is
    /// handed out one last time and evicted under the same entry lock.
    pub fn read_at(&self, request_id: &str, now: DateTime<Utc>) -> HubResult<Task> {
        match self.tasks.entry(request_id.to_string()) {
            Entry::Vacant(_) => Err(HubError::UnknownTask(request_id.to_string())),
            Entry::Occupied(slot) => {
                if self.is_expired(slot.get(), now) {
                    let task = slot.remove();
                    debug!(request_id, "Task reaped after final read");
                    Ok(task)
                } else {
                    Ok(slot.get().clone())
                }
            }
        }
    }

    /// Drops a task that is still pending, for callers rolling back a failed dispatch.
    pub fn discard_pending(&self, request_id: &str) -> bool {
        self.tasks
            .remove_if(request_id, |_, task| task.state == TaskState::Pending)
            .is_some()
    }

    /// Fails every pending task addressed to `peer_id`; returns how many were failed.
    ///
    /// `rebound` is consulted while each task's entry is locked. A task can only be opened
    /// against a bound peer, so a task whose peer has been bound again is left pending.
    pub fn fail_pending_for_peer(
        &self,
        peer_id: &PeerId,
        error: &str,
        rebound: impl Fn() -> bool,
    ) -> usize {
        let now = Utc::now();
        let mut failed = 0;
        for mut task in self.tasks.iter_mut() {
            if task.peer_id != *peer_id || task.state != TaskState::Pending {
                continue;
            }
            if rebound() {
                debug!(request_id = %task.request_id, peer_id = %peer_id, "Peer rebound, task kept pending");
                continue;
            }
            task.state = TaskState::Failed;
            task.error = Some(error.to_string());
            task.completed_at = Some(now);
            failed += 1;
        }
        if failed > 0 {
            info!(peer_id = %peer_id, failed, "Failed pending tasks of disconnected peer");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn is_expired(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let Some(completed_at) = task.completed_at else {
            return false;
        };
        // Negative elapsed time (clock skew) counts as fresh.
        (now - completed_at)
            .to_std()
            .map(|elapsed| elapsed > self.retention)
            .unwrap_or(false)
    }
}
