//! Folder sessions
//!
//! One [`FolderSession`] exists per (account, folder). It owns the folder's
//! message store, batch windows and sync metadata behind a `RwLock`, plus an
//! operation lock that serializes syncs and mutations on that folder.
//!
//! Readers take the state lock only for the duration of a page read. Writers
//! hold the operation lock across their remote calls and take the state lock
//! once, for the merge, so a reader sees either the old or the new state.

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{BatchPage, FolderKey, FolderMeta, MessageSummary};
use crate::pagination::BatchWindows;
use crate::remote::FolderStatus;
use crate::store::{MessageStore, SearchQuery};

/// Cached state of one folder
#[derive(Debug)]
pub struct FolderState {
    pub store: MessageStore,
    pub windows: BatchWindows,
    /// Validity token the cached UIDs belong to
    pub uid_validity: Option<u32>,
    /// No remote message is older than the oldest cached one
    pub history_complete: bool,
    pub remote_total: Option<usize>,
    pub remote_unread: Option<usize>,
    /// The cache may be behind the remote; the next batch read reconciles first
    pub needs_reconcile: bool,
    pub last_synced: Option<DateTime<Utc>>,
}

impl FolderState {
    fn new(window_ttl_seconds: u64, window_max_entries: usize) -> Self {
        Self {
            store: MessageStore::new(),
            windows: BatchWindows::new(window_ttl_seconds, window_max_entries),
            uid_validity: None,
            history_complete: false,
            remote_total: None,
            remote_unread: None,
            needs_reconcile: false,
            last_synced: None,
        }
    }

    /// Whether the next page for `query` can be served without fetching
    pub fn can_serve(&mut self, query: &SearchQuery, size: usize) -> bool {
        if self.needs_reconcile || self.uid_validity.is_none() {
            return false;
        }
        if self.history_complete {
            return true;
        }
        let boundary = self.windows.get(&query.key()).and_then(|w| w.boundary);
        self.store
            .newest_first_below(boundary)
            .filter(|m| query.matches(m))
            .take(size)
            .count()
            >= size
    }

    /// Serve the next page of `query` from the cache and advance its window
    ///
    /// The window is recorded even when the page is empty.
    pub fn take_page(&mut self, key: &FolderKey, query: &SearchQuery, size: usize) -> BatchPage {
        let window_key = query.key();
        let boundary = self.windows.get(&window_key).and_then(|w| w.boundary);

        let messages: Vec<MessageSummary> = self
            .store
            .newest_first_below(boundary)
            .filter(|m| query.matches(m))
            .take(size)
            .map(|m| MessageSummary::from_message(key, self.uid_validity, m))
            .collect();
        let next_boundary = messages.last().map(|m| m.uid).or(boundary);

        let cached_remaining = self
            .store
            .newest_first_below(next_boundary)
            .any(|m| query.matches(m));
        let total = if query.is_empty() {
            self.remote_total
                .unwrap_or_default()
                .max(self.store.len())
        } else {
            self.store.count_matching(query)
        };

        let served = messages.len();
        let window_size = self.windows.advance(
            &window_key,
            messages.last().map(|m| m.uid),
            served,
        );

        BatchPage {
            messages,
            total,
            has_more: cached_remaining || !self.history_complete,
            window_size,
            folder_meta: self.meta(key),
        }
    }

    /// Drop every cached UID after a validity change
    ///
    /// Returns the UIDs that were cached under the old token.
    pub fn invalidate(&mut self, new_validity: u32) -> Vec<u32> {
        let dropped = self.store.uids().into_iter().collect();
        self.store.clear();
        self.windows.clear();
        self.uid_validity = Some(new_validity);
        self.history_complete = false;
        self.needs_reconcile = false;
        dropped
    }

    pub fn apply_status(&mut self, status: &FolderStatus) {
        self.remote_total = Some(status.total);
        self.remote_unread = status.unread;
    }

    pub fn mark_synced(&mut self) {
        self.last_synced = Some(Utc::now());
    }

    pub fn meta(&self, key: &FolderKey) -> FolderMeta {
        FolderMeta {
            account_id: key.account_id.clone(),
            folder: key.folder.clone(),
            uid_validity: self.uid_validity,
            remote_total: self.remote_total,
            remote_unread: self.remote_unread,
            cached: self.store.len(),
            sync_cursor: self.store.oldest_uid(),
            history_complete: self.history_complete,
            needs_reconcile: self.needs_reconcile,
            last_synced_utc: self
                .last_synced
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

/// Per-folder session: cached state plus the folder's operation lock
#[derive(Debug)]
pub struct FolderSession {
    key: FolderKey,
    op_lock: Mutex<()>,
    state: RwLock<FolderState>,
}

impl FolderSession {
    pub fn new(key: FolderKey, window_ttl_seconds: u64, window_max_entries: usize) -> Self {
        Self {
            key,
            op_lock: Mutex::new(()),
            state: RwLock::new(FolderState::new(window_ttl_seconds, window_max_entries)),
        }
    }

    pub fn key(&self) -> &FolderKey {
        &self.key
    }

    /// Acquire the operation lock; released when the guard drops
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, FolderState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, FolderState> {
        self.state.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::FolderSession;
    use crate::models::FolderKey;
    use crate::remote::FolderStatus;
    use crate::store::SearchQuery;
    use crate::testing::fake_message;

    fn session_with(uids: impl IntoIterator<Item = u32>) -> FolderSession {
        let session = FolderSession::new(FolderKey::new("default", "INBOX"), 60, 8);
        {
            let mut state = session.state.try_write().expect("uncontended");
            state.uid_validity = Some(1);
            state
                .store
                .upsert_many(uids.into_iter().map(|uid| fake_message(uid, &format!("Message {uid}"))));
        }
        session
    }

    #[tokio::test]
    async fn pages_continue_below_the_window_boundary() {
        let session = session_with(1..=12);
        let key = session.key().clone();
        let mut state = session.write().await;
        state.history_complete = true;
        let query = SearchQuery::default();

        let first = state.take_page(&key, &query, 5);
        let uids: Vec<u32> = first.messages.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![12, 11, 10, 9, 8]);
        assert!(first.has_more);
        assert_eq!(first.window_size, 5);

        let second = state.take_page(&key, &query, 5);
        assert_eq!(second.messages.first().map(|m| m.uid), Some(7));
        let third = state.take_page(&key, &query, 5);
        let uids: Vec<u32> = third.messages.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![2, 1]);
        assert!(!third.has_more);
        assert_eq!(third.window_size, 12);
    }

    #[tokio::test]
    async fn cannot_serve_short_incomplete_history() {
        let session = session_with(1..=3);
        let mut state = session.write().await;
        assert!(!state.can_serve(&SearchQuery::default(), 5));
        assert!(state.can_serve(&SearchQuery::default(), 3));
        state.history_complete = true;
        assert!(state.can_serve(&SearchQuery::default(), 5));
        state.needs_reconcile = true;
        assert!(!state.can_serve(&SearchQuery::default(), 1));
    }

    #[tokio::test]
    async fn zero_match_query_records_an_empty_window() {
        let session = session_with(1..=4);
        let key = session.key().clone();
        let mut state = session.write().await;
        state.history_complete = true;
        let query = SearchQuery::parse(Some("nothing-matches-this"));

        let page = state.take_page(&key, &query, 10);
        assert!(page.messages.is_empty());
        assert_eq!(page.total, 0);
        assert!(!page.has_more);
        assert!(state.windows.get(&query.key()).is_some());
    }

    #[tokio::test]
    async fn invalidate_drops_everything_and_adopts_new_token() {
        let session = session_with([4, 5, 6]);
        let key = session.key().clone();
        let mut state = session.write().await;
        state.take_page(&key, &SearchQuery::default(), 2);
        state.apply_status(&FolderStatus {
            uid_validity: 1,
            total: 3,
            unread: Some(1),
            uid_next: Some(7),
        });

        let dropped = state.invalidate(2);
        assert_eq!(dropped, vec![4, 5, 6]);
        assert!(state.store.is_empty());
        assert_eq!(state.windows.len(), 0);
        let meta = state.meta(&key);
        assert_eq!(meta.uid_validity, Some(2));
        assert_eq!(meta.cached, 0);
        assert_eq!(meta.sync_cursor, None);
        assert_eq!(meta.remote_unread, Some(1));
    }
}
