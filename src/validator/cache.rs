use std::collections::{HashSet, VecDeque};

use hifitime::prelude::{Duration, Epoch};

/// Set of payloads already accepted, forgotten after `retention`
#[derive(Debug, Clone)]
pub struct DedupCache {
    retention: Duration,

    /// Insertion order, oldest first
    order: VecDeque<(Epoch, String)>,

    index: HashSet<String>,
}

impl DedupCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            order: VecDeque::new(),
            index: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, payload: &str) -> bool {
        self.index.contains(payload)
    }

    /// Inserts this payload, returns false if it was already present
    pub fn insert(&mut self, payload: &str, now: Epoch) -> bool {
        if !self.index.insert(payload.to_string()) {
            return false;
        }
        self.order.push_back((now, payload.to_string()));
        true
    }

    /// Drops entries older than retention period
    pub fn evict(&mut self, now: Epoch) {
        while let Some((inserted, _)) = self.order.front() {
            if now - *inserted <= self.retention {
                break;
            }
            if let Some((_, payload)) = self.order.pop_front() {
                self.index.remove(&payload);
            }
        }
    }
}
