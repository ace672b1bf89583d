//! Name-keyed session registry.
//!
//! One mutex guards the map; callers copy `Arc`s out and never hold the lock
//! across PTY I/O or awaits.

use crate::session::BashSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<BashSession>>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<BashSession>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(name).cloned()
    }

    /// Register a session under its own name, returning any replaced entry
    /// so the caller can tear it down outside the lock.
    pub(crate) fn insert(&self, session: Arc<BashSession>) -> Option<Arc<BashSession>> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.name().to_string(), session)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<BashSession>> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(name)
    }

    /// Registered names, sorted for stable listings.
    pub(crate) fn names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        let mut names: Vec<String> = sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered sessions, sorted by name.
    pub(crate) fn snapshot(&self) -> Vec<Arc<BashSession>> {
        let sessions = self.sessions.lock().unwrap();
        let mut all: Vec<Arc<BashSession>> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }
}
