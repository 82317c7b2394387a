//! Progress reporting for long-running dispatch and evaluation calls.
//!
//! K_i: The engine only ever increments progress; the caller owns the observer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Observer notified as fetches and judgments complete.
pub trait ProgressObserver: Send + Sync {
    /// Set the number of units expected.
    fn set_total(&self, total: usize);

    /// Replace the status text.
    fn set_status(&self, status: &str);

    /// Record one completed unit.
    fn increment(&self);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {
    fn set_total(&self, _total: usize) {}
    fn set_status(&self, _status: &str) {}
    fn increment(&self) {}
}

/// In-memory task progress: counters plus status text.
///
/// One instance per logical task, shared by reference with the engine.
#[derive(Debug, Default)]
pub struct TaskProgress {
    total: AtomicUsize,
    completed: AtomicUsize,
    total_set: AtomicUsize,
    status: Mutex<String>,
    current_step: Mutex<String>,
}

/// Point-in-time copy of a [`TaskProgress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub status: String,
    pub current_step: String,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Whether `set_total` was ever called.
    pub fn was_started(&self) -> bool {
        self.total_set.load(Ordering::Relaxed) > 0
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total(),
            completed: self.completed(),
            status: lock_text(&self.status),
            current_step: lock_text(&self.current_step),
        }
    }
}

fn lock_text(slot: &Mutex<String>) -> String {
    match slot.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn store_text(slot: &Mutex<String>, text: String) {
    match slot.lock() {
        Ok(mut guard) => *guard = text,
        Err(poisoned) => *poisoned.into_inner() = text,
    }
}

impl ProgressObserver for TaskProgress {
    fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.total_set.fetch_add(1, Ordering::Relaxed);
    }

    fn set_status(&self, status: &str) {
        store_text(&self.status, status.to_string());
    }

    fn increment(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        store_text(
            &self.current_step,
            format!("Completed {done}/{}", self.total()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_update_step_text() {
        let progress = TaskProgress::new();
        assert!(!progress.was_started());

        progress.set_total(4);
        progress.set_status("Fetching answers");
        progress.increment();
        progress.increment();

        let snap = progress.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.status, "Fetching answers");
        assert_eq!(snap.current_step, "Completed 2/4");
        assert!(progress.was_started());
    }
}
