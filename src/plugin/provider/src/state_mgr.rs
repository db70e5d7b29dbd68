use std::collections::hash_map;
use std::sync::{Arc, Weak};

use fnv::FnvHashMap as HashMap;
use nix::unistd::Pid;

/// Per-client-process shared state. An entry lives as long as some handle to it does.
pub struct SharedStateManager<S> {
    states: spin::Mutex<HashMap<Pid, Weak<S>>>,
}

impl<S> Default for SharedStateManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SharedStateManager<S> {
    pub fn new() -> Self {
        SharedStateManager {
            states: spin::Mutex::new(HashMap::default()),
        }
    }

    pub fn get_or_create_with<F: FnOnce() -> S>(&self, pid: Pid, init: F) -> Arc<S> {
        let mut states = self.states.lock();
        match states.entry(pid) {
            hash_map::Entry::Occupied(mut entry) => {
                if let Some(state) = entry.get().upgrade() {
                    state
                } else {
                    let wrapped = Arc::new(init());
                    entry.insert(Arc::downgrade(&wrapped));
                    wrapped
                }
            }
            hash_map::Entry::Vacant(entry) => {
                let wrapped = Arc::new(init());
                entry.insert(Arc::downgrade(&wrapped));
                wrapped
            }
        }
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<S>> {
        self.states.lock().get(&pid).and_then(Weak::upgrade)
    }

    #[inline]
    pub fn contains(&self, pid: Pid) -> bool {
        if let Some(state) = self.states.lock().get(&pid) {
            state.strong_count() > 0
        } else {
            false
        }
    }

    /// Forgets processes whose state is gone. Returns how many entries were dropped.
    pub fn reap(&self) -> usize {
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, s| s.strong_count() > 0);
        before - states.len()
    }

    /// Processes with live state.
    pub fn pids(&self) -> Vec<Pid> {
        self.states
            .lock()
            .iter()
            .filter(|(_, s)| s.strong_count() > 0)
            .map(|(pid, _)| *pid)
            .collect()
    }
}
