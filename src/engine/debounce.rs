//! Per-key debouncer
//!
//! Each key holds at most one pending value. Scheduling a key again replaces
//! the value and pushes its deadline out by the full window, so a burst of
//! edits yields exactly one release carrying the last value. Nothing is
//! queued behind a pending key.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Pending<V> {
    value: V,
    deadline: Instant,
}

/// Deadline-based debouncer driven by an external clock
#[derive(Debug, Clone)]
pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
}

impl<K: Eq + Hash + Copy, V> Debouncer<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Record a value for `key`, restarting its window
    pub fn schedule(&mut self, key: K, value: V, now: Instant) {
        self.pending.insert(
            key,
            Pending {
                value,
                deadline: now + self.window,
            },
        );
    }

    /// Remove and return every entry whose window has elapsed, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut due: Vec<(K, Instant)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, p)| (*k, p.deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        due.into_iter()
            .filter_map(|(key, _)| self.pending.remove(&key).map(|p| (key, p.value)))
            .collect()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
