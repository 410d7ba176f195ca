//! Process-wide mapping from run identifier to its live supervisor.
//!
//! Entries are created at run creation and never implicitly evicted by this
//! core; an external retention policy may prune old workspaces and registry
//! entries together. Reads are concurrent; only insertion and removal take
//! the write lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::supervisor::RunSupervisor;
use crate::domain::RunId;

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Arc<RunSupervisor>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, supervisor: Arc<RunSupervisor>) {
        let run_id = supervisor.workspace().run_id().clone();
        let previous = self
            .runs
            .write()
            .expect("registry lock poisoned")
            .insert(run_id, supervisor);
        // Ids come from a collision-resistant generator; a replacement here
        // would mean two runs sharing a workspace
        debug_assert!(previous.is_none(), "run id collision in registry");
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<RunSupervisor>> {
        self.runs
            .read()
            .expect("registry lock poisoned")
            .get(run_id)
            .cloned()
    }

    /// Remove an entry; for use by an external retention policy
    pub fn remove(&self, run_id: &RunId) -> Option<Arc<RunSupervisor>> {
        self.runs
            .write()
            .expect("registry lock poisoned")
            .remove(run_id)
    }

    pub fn list(&self) -> Vec<RunId> {
        self.runs
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runs.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
