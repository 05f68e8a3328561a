//! Process registry of one container.
//!
//! Ids are claimed under a short lock and the lock is never held across
//! an RPC: `reserve` marks the id, the caller creates the process with
//! the lock released, then commits. Ids stay claimed after the process is
//! deleted, so they are never reused.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::ProcessError;
use crate::process::{LinuxProcess, ProcessState};

enum Slot {
    /// Creation in progress.
    Reserved,
    Active(LinuxProcess),
}

#[derive(Default)]
pub(crate) struct ProcessRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`. Fails if it is in use, being created, or was used before.
    pub fn reserve(&self, id: &str) -> Result<Reservation<'_>, ProcessError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(id) {
            return Err(ProcessError::AlreadyExists(id.to_string()));
        }
        slots.insert(id.to_string(), Slot::Reserved);
        Ok(Reservation {
            registry: self,
            id: id.to_string(),
            committed: false,
        })
    }

    /// A live (not deleted) process.
    pub fn get(&self, id: &str) -> Option<LinuxProcess> {
        match self.slots.lock().get(id) {
            Some(Slot::Active(process)) if process.state() != ProcessState::Deleted => {
                Some(process.clone())
            }
            _ => None,
        }
    }

    /// Every committed process, deleted ones included.
    pub fn processes(&self) -> Vec<LinuxProcess> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(process) => Some(process.clone()),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Ids of live processes, sorted.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Active(process) if process.state() != ProcessState::Deleted => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    fn settle(&self, id: &str, process: Option<LinuxProcess>) {
        let mut slots = self.slots.lock();
        match process {
            Some(process) => {
                slots.insert(id.to_string(), Slot::Active(process));
            }
            None => {
                slots.remove(id);
            }
        }
    }
}

/// A claimed id. Dropping it without [`commit`](Self::commit) frees the id
/// again, since no process ever existed under it.
pub(crate) struct Reservation<'a> {
    registry: &'a ProcessRegistry,
    id: String,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self, process: LinuxProcess) {
        self.committed = true;
        self.registry.settle(&self.id, Some(process));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.settle(&self.id, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_reservation_rejected() {
        let registry = ProcessRegistry::new();
        let first = registry.reserve("web").unwrap();
        assert!(matches!(
            registry.reserve("web"),
            Err(ProcessError::AlreadyExists(ref id)) if id == "web"
        ));
        drop(first);
        // Never committed: the id is free again.
        assert!(registry.reserve("web").is_ok());
    }

    #[test]
    fn test_concurrent_reservations_one_winner() {
        let registry = Arc::new(ProcessRegistry::new());
        let start = Arc::new(std::sync::Barrier::new(16));
        let done = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let start = Arc::clone(&start);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    start.wait();
                    let reservation = registry.reserve("same");
                    // Hold any claim until every thread has tried.
                    done.wait();
                    reservation.is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ProcessRegistry::new();
        assert!(registry.get("x").is_none());
        assert!(registry.processes().is_empty());
        assert!(registry.live_ids().is_empty());
    }
}
