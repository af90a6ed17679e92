//! Per-folder message store
//!
//! Holds the cached message summaries of one folder keyed by UID. Iteration
//! is newest first (descending UID, which is arrival order on IMAP servers).
//! The store never talks to the remote; the sync engine feeds it.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::models::{Flag, Message};

/// Case-insensitive keyword filter over envelope fields
///
/// The raw query is lower-cased and split on whitespace; a message matches
/// when every term occurs in at least one of subject, from, to or cc. The
/// normalised form doubles as the batch window key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    terms: Vec<String>,
}

impl SearchQuery {
    pub fn parse(raw: Option<&str>) -> Self {
        let terms = raw
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Normalised key identifying this query's batch window
    pub fn key(&self) -> String {
        self.terms.join(" ")
    }

    pub fn matches(&self, message: &Message) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        let fields: Vec<String> = message
            .envelope
            .searchable_fields()
            .map(str::to_lowercase)
            .collect();
        self.terms
            .iter()
            .all(|term| fields.iter().any(|field| field.contains(term.as_str())))
    }
}

/// Result of comparing a remote UID listing with the cached UIDs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidDiff {
    /// Listed remotely but not cached (ascending)
    pub new_uids: Vec<u32>,
    /// Cached but absent from the listing (ascending)
    pub missing_uids: Vec<u32>,
}

/// Cached messages of one folder
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: BTreeMap<u32, Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, uid: u32) -> Option<&Message> {
        self.messages.get(&uid)
    }

    /// Oldest cached UID (the sync cursor)
    pub fn oldest_uid(&self) -> Option<u32> {
        self.messages.keys().next().copied()
    }

    pub fn uids(&self) -> BTreeSet<u32> {
        self.messages.keys().copied().collect()
    }

    /// Insert or overwrite by UID
    pub fn upsert(&mut self, message: Message) {
        self.messages.insert(message.uid, message);
    }

    pub fn upsert_many(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.upsert(message);
        }
    }

    /// Remove by UID, returning the messages that were present
    ///
    /// Absent UIDs are ignored, so repeating a removal is a no-op.
    pub fn remove(&mut self, uids: &[u32]) -> Vec<Message> {
        uids.iter()
            .filter_map(|uid| self.messages.remove(uid))
            .collect()
    }

    /// Set or clear a flag on cached copies; returns how many were present
    pub fn set_flags(&mut self, uids: &[u32], flag: &Flag, value: bool) -> usize {
        let mut touched = 0;
        for uid in uids {
            if let Some(message) = self.messages.get_mut(uid) {
                if value {
                    message.flags.insert(flag.clone());
                } else {
                    message.flags.remove(flag);
                }
                touched += 1;
            }
        }
        touched
    }

    /// Pure set comparison between a remote listing and the cache
    pub fn diff_against_known_uids(&self, remote_uids: &BTreeSet<u32>) -> UidDiff {
        UidDiff {
            new_uids: remote_uids
                .iter()
                .filter(|uid| !self.messages.contains_key(uid))
                .copied()
                .collect(),
            missing_uids: self
                .messages
                .keys()
                .filter(|uid| !remote_uids.contains(uid))
                .copied()
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Newest-first iterator over messages strictly older than `below`
    pub fn newest_first_below(&self, below: Option<u32>) -> impl Iterator<Item = &Message> {
        let upper = below.map_or(Bound::Unbounded, Bound::Excluded);
        self.messages
            .range((Bound::Unbounded, upper))
            .rev()
            .map(|(_, message)| message)
    }

    pub fn count_matching(&self, query: &SearchQuery) -> usize {
        self.messages.values().filter(|m| query.matches(m)).count()
    }
}
