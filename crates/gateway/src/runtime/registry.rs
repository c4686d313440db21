//! Per-task supervisor lookup.
//!
//! Opening a session attaches to the live supervisor for the task if one
//! exists; otherwise the caller spawns one. A supervisor removes its own
//! entry as the last thing it does on exit.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::supervisor::SupervisorHandle;

#[derive(Default)]
pub struct SupervisorRegistry {
    map: RwLock<HashMap<i64, SupervisorHandle>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live supervisor for a task, if any. Entries whose command
    /// channel has closed are treated as dead and pruned on sight.
    pub fn get(&self, task_id: i64) -> Option<SupervisorHandle> {
        let handle = self.map.read().get(&task_id).cloned()?;
        if handle.is_closed() {
            self.map.write().remove(&task_id);
            return None;
        }
        Some(handle)
    }

    pub fn insert(&self, task_id: i64, handle: SupervisorHandle) {
        self.map.write().insert(task_id, handle);
    }

    pub fn remove(&self, task_id: i64) {
        self.map.write().remove(&task_id);
    }

    /// Task IDs with a live supervisor (input to the repo-lock recovery
    /// sweep).
    pub fn live_task_ids(&self) -> Vec<i64> {
        self.map
            .read()
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Handles of every live supervisor (used at shutdown).
    pub fn all(&self) -> Vec<SupervisorHandle> {
        self.map.read().values().cloned().collect()
    }
}
