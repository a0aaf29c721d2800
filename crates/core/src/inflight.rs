//! Tracking of per-request work that is currently running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Set of request ids with a pass in progress.
///
/// A second caller asking to start work on a busy id is turned away, and the
/// running pass is told to go around once more before it finishes. Any number
/// of such requests collapse into a single re-run.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    // id -> re-run requested
    active: Arc<Mutex<HashMap<String, bool>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, or flag a re-run if it is already claimed.
    pub fn try_begin(&self, id: &str) -> Option<InFlightGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get_mut(id) {
            Some(rerun) => {
                *rerun = true;
                None
            }
            None => {
                active.insert(id.to_string(), false);
                Some(InFlightGuard {
                    id: id.to_string(),
                    active: Arc::clone(&self.active),
                    released: false,
                })
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claim on one request id; released on [`finish`](Self::finish) or drop.
#[derive(Debug)]
pub struct InFlightGuard {
    id: String,
    active: Arc<Mutex<HashMap<String, bool>>>,
    released: bool,
}

impl InFlightGuard {
    /// Returns `true` if another pass was requested meanwhile. The claim is
    /// then kept and the flag cleared; otherwise the claim is released.
    pub fn rerun_requested(&mut self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get_mut(&self.id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                active.remove(&self.id);
                self.released = true;
                false
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.released {
            self.active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}
