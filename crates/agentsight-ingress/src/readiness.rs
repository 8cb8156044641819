// Dependency freshness tracking for the readiness probe

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How recently a dependency must have succeeded for /ready to pass.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// Tracks the last successful operation against each dependency.
/// Both marks start at construction time: the process only comes up
/// after its initial connections succeeded.
pub struct Readiness {
    last_keydir_ok: Mutex<Instant>,
    last_bus_ok: Mutex<Instant>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_keydir_ok: Mutex::new(now),
            last_bus_ok: Mutex::new(now),
        }
    }

    pub fn mark_keydir_ok(&self) {
        if let Ok(mut guard) = self.last_keydir_ok.lock() {
            *guard = Instant::now();
        }
    }

    pub fn mark_bus_ok(&self) {
        if let Ok(mut guard) = self.last_bus_ok.lock() {
            *guard = Instant::now();
        }
    }

    /// None when ready; otherwise the name of the stale dependency.
    pub fn stale_dependency(&self) -> Option<&'static str> {
        let keydir_elapsed = self
            .last_keydir_ok
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or(Duration::MAX);
        if keydir_elapsed > STALE_AFTER {
            return Some("key directory");
        }
        let bus_elapsed = self
            .last_bus_ok
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or(Duration::MAX);
        if bus_elapsed > STALE_AFTER {
            return Some("event bus");
        }
        None
    }
}
