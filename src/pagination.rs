//! Batch window storage
//!
//! A batch window records how far a caller has paged through a folder for
//! one query: the lowest UID served so far and how many messages that was.
//! Windows expire after a TTL and the oldest are evicted beyond a size cap,
//! so arbitrary one-off queries cannot grow a folder session without bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Single window entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    /// Lowest UID served; the next page starts strictly below it
    pub boundary: Option<u32>,
    /// Messages served so far through this window
    pub served: usize,
    /// Expiration timestamp (refreshed on access)
    pub expires_at: Instant,
}

/// Window store with TTL and LRU eviction
///
/// Keyed by the normalised query (`""` for the unfiltered folder view).
#[derive(Debug)]
pub struct BatchWindows {
    /// Idle lifetime for windows
    ttl: Duration,
    /// Maximum number of windows to retain
    max_entries: usize,
    /// Active windows keyed by query
    entries: HashMap<String, WindowEntry>,
}

impl BatchWindows {
    pub fn new(ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds),
            max_entries,
            entries: HashMap::new(),
        }
    }

    /// Current window for a query, if still alive
    pub fn get(&mut self, key: &str) -> Option<WindowEntry> {
        self.cleanup();
        self.entries.get(key).cloned()
    }

    /// Record a served page
    ///
    /// Creates the window when missing. An empty page keeps the previous
    /// boundary but still refreshes (or creates) the entry. Returns the
    /// number of messages served through the window so far.
    pub fn advance(&mut self, key: &str, boundary: Option<u32>, served: usize) -> usize {
        self.cleanup();
        let expires_at = Instant::now() + self.ttl;
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| WindowEntry {
                boundary: None,
                served: 0,
                expires_at,
            });
        if boundary.is_some() {
            entry.boundary = boundary;
        }
        entry.served += served;
        entry.expires_at = expires_at;
        let total = entry.served;
        self.evict_if_needed();
        total
    }

    /// Discard one window (`reset=true`)
    pub fn reset(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Discard every window of the folder
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove expired windows
    fn cleanup(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Evict windows if exceeding `max_entries`
    ///
    /// Removes the entries closest to expiry first, which is the least
    /// recently used since expiration is refreshed on access.
    fn evict_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }

        let overflow = self.entries.len() - self.max_entries;
        let mut keys_by_expiry: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.expires_at))
            .collect();
        keys_by_expiry.sort_by_key(|(_, expires_at)| *expires_at);

        for (key, _) in keys_by_expiry.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
    }
}
