//! Sync Status Bus: an in-memory `path -> PathStatus` map with subscriber
//! fan-out, consulted by anything that wants a live or polled snapshot of
//! current sync activity (§4.12).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::model::{ConflictState, PathStatus, SyncPath, SyncState};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub path: SyncPath,
    pub status: PathStatus,
}

/// Owns the status map and the broadcast channel subscribers read events
/// from. Cloning a `StatusBus` handle is cheap (it is `Arc`-backed internally
/// via the broadcast sender); construct one instance per engine and share it.
pub struct StatusBus {
    paths: Mutex<HashMap<SyncPath, PathStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            paths: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<(SyncPath, PathStatus)> {
        let paths = self.paths.lock().unwrap();
        let mut out: Vec<_> = paths.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn get(&self, path: &str) -> Option<PathStatus> {
        self.paths.lock().unwrap().get(path).cloned()
    }

    pub fn summary(&self) -> StatusSummary {
        let paths = self.paths.lock().unwrap();
        let mut summary = StatusSummary::default();
        for status in paths.values() {
            match status.sync_state {
                SyncState::Pending => summary.pending += 1,
                SyncState::Syncing => summary.syncing += 1,
                SyncState::Completed => summary.completed += 1,
                SyncState::Error => summary.error += 1,
            }
        }
        summary
    }

    pub fn set_syncing(&self, path: &str, progress: f32) {
        self.update(path, |s| {
            s.sync_state = SyncState::Syncing;
            s.progress = progress.clamp(0.0, 100.0);
            s.error = None;
        });
    }

    pub fn set_progress(&self, path: &str, progress: f32) {
        self.update(path, |s| {
            s.sync_state = SyncState::Syncing;
            s.progress = progress.clamp(0.0, 100.0);
        });
    }

    /// A plain completion (no conflict) drops the path from the map once the
    /// terminal event has gone out, so a synced tree doesn't accumulate an
    /// ever-growing status map; a conflicted/rejected completion is retained.
    pub fn set_completed(&self, path: &str) {
        let status = {
            let mut paths = self.paths.lock().unwrap();
            let entry = paths.entry(path.to_string()).or_default();
            entry.sync_state = SyncState::Completed;
            entry.progress = 100.0;
            entry.error = None;
            entry.last_updated = Utc::now().timestamp();
            let status = entry.clone();
            if status.conflict_state == ConflictState::None {
                paths.remove(path);
            }
            status
        };
        let _ = self.events.send(StatusEvent {
            path: path.to_string(),
            status,
        });
    }

    /// Forces conflict_state=none and removes the entry regardless, for a
    /// processed delete that should stop appearing in snapshots outright.
    pub fn set_completed_and_remove(&self, path: &str) {
        self.paths.lock().unwrap().remove(path);
    }

    pub fn set_conflicted(&self, path: &str) {
        self.update(path, |s| {
            s.sync_state = SyncState::Completed;
            s.conflict_state = ConflictState::Conflicted;
            s.progress = 100.0;
        });
    }

    pub fn set_rejected(&self, path: &str) {
        self.update(path, |s| {
            s.sync_state = SyncState::Completed;
            s.conflict_state = ConflictState::Rejected;
            s.progress = 100.0;
        });
    }

    pub fn set_error(&self, path: &str, err: impl Into<String>) {
        self.update(path, |s| {
            s.sync_state = SyncState::Error;
            s.progress = 0.0;
            s.error = Some(err.into());
            s.error_count += 1;
        });
    }

    fn update(&self, path: &str, f: impl FnOnce(&mut PathStatus)) {
        let status = {
            let mut paths = self.paths.lock().unwrap();
            let entry = paths.entry(path.to_string()).or_default();
            f(entry);
            entry.last_updated = Utc::now().timestamp();
            entry.clone()
        };
        let _ = self.events.send(StatusEvent {
            path: path.to_string(),
            status,
        });
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatusSummary {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub error: usize,
}
