//! Process state registry.
//!
//! Processes are keyed by `(container_id, process_id)`. The init process of
//! a container uses the container id as its process id.

use super::state::ProcessState;
use crate::error::{GuestError, GuestResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type ProcessKey = (String, String);

/// Registry of processes across all containers.
#[derive(Clone, Default)]
pub(crate) struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<ProcessKey, ProcessState>>>,
}

impl ProcessRegistry {
    /// Create new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process; fails if the id is taken in that container.
    pub async fn insert(
        &self,
        container_id: &str,
        process_id: &str,
        state: ProcessState,
    ) -> GuestResult<()> {
        use std::collections::hash_map::Entry;

        let mut processes = self.processes.lock().await;
        match processes.entry((container_id.to_string(), process_id.to_string())) {
            Entry::Occupied(_) => Err(GuestError::ProcessExists(process_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    /// Check if a process id is taken.
    pub async fn contains(&self, container_id: &str, process_id: &str) -> bool {
        self.processes
            .lock()
            .await
            .contains_key(&(container_id.to_string(), process_id.to_string()))
    }

    /// Get process state.
    pub async fn get(&self, container_id: &str, process_id: &str) -> GuestResult<ProcessState> {
        self.processes
            .lock()
            .await
            .get(&(container_id.to_string(), process_id.to_string()))
            .cloned()
            .ok_or_else(|| GuestError::ProcessNotFound(process_id.to_string()))
    }

    pub async fn remove(&self, container_id: &str, process_id: &str) -> Option<ProcessState> {
        self.processes
            .lock()
            .await
            .remove(&(container_id.to_string(), process_id.to_string()))
    }

    /// Remove every process of a container.
    pub async fn remove_container(&self, container_id: &str) -> Vec<ProcessState> {
        let mut processes = self.processes.lock().await;
        let keys: Vec<ProcessKey> = processes
            .keys()
            .filter(|(cid, _)| cid == container_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| processes.remove(&key))
            .collect()
    }

    /// Number of tracked processes.
    pub async fn len(&self) -> usize {
        self.processes.lock().await.len()
    }
}
