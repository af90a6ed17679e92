//! Sync engine
//!
//! Reconciles a [`FolderSession`] with the remote mailbox in two modes:
//!
//! - **growth**: fetch the next page of older history when a batch read
//!   runs past the cached window
//! - **reconciliation**: list the UIDs at or above the sync cursor, fetch the
//!   new ones and drop the cached ones that disappeared
//!
//! Both run under the folder's operation lock and commit in a single state
//! write. A failed remote call aborts before anything is merged.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::errors::AppResult;
use crate::models::{BatchPage, FolderKey, Message, MessageSummary, SyncOutcome};
use crate::remote::{FolderStatus, RemoteMailbox};
use crate::session::FolderSession;
use crate::store::{MessageStore, SearchQuery};

/// Result of one growth round
#[derive(Debug)]
struct Growth {
    /// UIDs fetched and merged
    fetched: Vec<u32>,
    /// UIDs dropped because the validity token changed
    dropped: Vec<u32>,
    invalidated: bool,
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteMailbox>,
    /// Page size used when reconciliation has to rebuild an empty cache
    default_batch_size: usize,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteMailbox>, default_batch_size: usize) -> Self {
        Self {
            remote,
            default_batch_size,
        }
    }

    /// Serve the next page of a folder view, growing the cache if needed
    ///
    /// Every call checks the folder's validity token with a STATUS first; a
    /// changed token drops the cache and paging restarts from the newest
    /// message. With `reset` the query's window is discarded.
    #[instrument(skip_all, fields(account = %session.key().account_id, folder = %session.key().folder, batch_size = batch_size, reset = reset))]
    pub async fn get_batch(
        &self,
        session: &FolderSession,
        query: &SearchQuery,
        batch_size: usize,
        reset: bool,
    ) -> AppResult<BatchPage> {
        if !reset {
            let status = self.folder_status(session).await?;
            let mut state = session.write().await;
            let current = state
                .uid_validity
                .is_none_or(|v| v == status.uid_validity);
            if current && state.can_serve(query, batch_size) {
                debug!("served from cache");
                state.apply_status(&status);
                return Ok(state.take_page(session.key(), query, batch_size));
            }
        }

        let _guard = session.lock_ops().await;

        if session.read().await.needs_reconcile {
            self.reconcile_locked(session, &SearchQuery::default())
                .await?;
        }

        let status = self.folder_status(session).await?;
        let needs_growth = {
            let mut state = session.write().await;
            if state
                .uid_validity
                .is_some_and(|v| v != status.uid_validity)
            {
                let dropped = state.invalidate(status.uid_validity);
                warn!(
                    dropped = dropped.len(),
                    uid_validity = status.uid_validity,
                    "validity changed, cache invalidated"
                );
            }
            state.apply_status(&status);
            if reset {
                state.windows.reset(&query.key());
            }
            !state.can_serve(query, batch_size)
        };
        if needs_growth {
            self.grow(session, &status, batch_size).await?;
        }

        let mut state = session.write().await;
        Ok(state.take_page(session.key(), query, batch_size))
    }

    /// Reconcile a folder with the remote and report what changed
    ///
    /// `query` filters the reported new messages only; the merge always
    /// covers the whole cached range.
    #[instrument(skip_all, fields(account = %session.key().account_id, folder = %session.key().folder))]
    pub async fn reconcile(
        &self,
        session: &FolderSession,
        query: &SearchQuery,
    ) -> AppResult<SyncOutcome> {
        let _guard = session.lock_ops().await;
        self.reconcile_locked(session, query).await
    }

    /// Reconciliation body; the caller holds the operation lock
    async fn reconcile_locked(
        &self,
        session: &FolderSession,
        query: &SearchQuery,
    ) -> AppResult<SyncOutcome> {
        let key = session.key();
        let status = self.folder_status(session).await?;

        let cursor = {
            let state = session.read().await;
            let changed = state
                .uid_validity
                .is_some_and(|v| v != status.uid_validity);
            if changed {
                None
            } else {
                state.store.oldest_uid()
            }
        };

        let Some(cursor) = cursor else {
            let growth = self.grow(session, &status, self.default_batch_size).await?;
            let mut state = session.write().await;
            state.needs_reconcile = false;
            let new_messages =
                summaries(&state.store, key, state.uid_validity, &growth.fetched, query);
            return Ok(SyncOutcome {
                new_messages,
                deleted_uids: growth.dropped,
                invalidated: growth.invalidated,
                meta: state.meta(key),
            });
        };

        // Deletion is inferred from absence, so the listing must cover the
        // whole cached range: everything at or above the oldest cached UID.
        let listed: BTreeSet<u32> = self
            .remote
            .list_uids(&key.account_id, &key.folder, Some(cursor))
            .await?
            .into_iter()
            .filter(|uid| *uid >= cursor)
            .collect();

        let diff = session.read().await.store.diff_against_known_uids(&listed);
        let fetched = if diff.new_uids.is_empty() {
            Vec::new()
        } else {
            self.remote
                .fetch_summaries(&key.account_id, &key.folder, &diff.new_uids)
                .await?
        };
        let fetched_uids: Vec<u32> = fetched.iter().map(|m| m.uid).collect();

        let mut state = session.write().await;
        let removed = state.store.remove(&diff.missing_uids);
        state.store.upsert_many(fetched);
        state.uid_validity = Some(status.uid_validity);
        state.apply_status(&status);
        state.needs_reconcile = false;
        state.mark_synced();

        info!(
            new = fetched_uids.len(),
            deleted = removed.len(),
            cached = state.store.len(),
            "reconciled"
        );

        let new_messages = summaries(&state.store, key, state.uid_validity, &fetched_uids, query);
        Ok(SyncOutcome {
            new_messages,
            deleted_uids: diff.missing_uids,
            invalidated: false,
            meta: state.meta(key),
        })
    }

    /// Fetch up to `size` messages older than the sync cursor and merge them
    ///
    /// The caller holds the operation lock. When `status` carries a validity
    /// token different from the cached one, the cache is rebuilt from the
    /// newest message instead.
    async fn grow(
        &self,
        session: &FolderSession,
        status: &FolderStatus,
        size: usize,
    ) -> AppResult<Growth> {
        let key = session.key();
        let (cursor, invalidated) = {
            let state = session.read().await;
            let changed = state
                .uid_validity
                .is_some_and(|v| v != status.uid_validity);
            let cursor = if changed {
                None
            } else {
                state.store.oldest_uid()
            };
            (cursor, changed)
        };

        let remote_uids = self
            .remote
            .list_uids(&key.account_id, &key.folder, None)
            .await?;
        let page: Vec<u32> = match cursor {
            Some(cursor) => remote_uids.range(..cursor).rev().take(size).copied().collect(),
            None => remote_uids.iter().rev().take(size).copied().collect(),
        };

        let fetched: Vec<Message> = if page.is_empty() {
            Vec::new()
        } else {
            self.remote
                .fetch_summaries(&key.account_id, &key.folder, &page)
                .await?
        };

        let new_cursor = page.last().copied().or(cursor);
        let history_complete = new_cursor.is_none_or(|c| remote_uids.range(..c).next().is_none());

        let mut state = session.write().await;
        let dropped = if invalidated {
            let dropped = state.invalidate(status.uid_validity);
            warn!(
                dropped = dropped.len(),
                uid_validity = status.uid_validity,
                "validity changed, cache invalidated"
            );
            dropped
        } else {
            Vec::new()
        };
        let fetched_uids = fetched.iter().map(|m| m.uid).collect();
        state.store.upsert_many(fetched);
        state.uid_validity = Some(status.uid_validity);
        state.history_complete = history_complete;
        state.apply_status(status);
        state.mark_synced();

        debug!(
            page = page.len(),
            cached = state.store.len(),
            history_complete,
            "grew cache"
        );

        Ok(Growth {
            fetched: fetched_uids,
            dropped,
            invalidated,
        })
    }

    async fn folder_status(&self, session: &FolderSession) -> AppResult<FolderStatus> {
        let key = session.key();
        self.remote
            .folder_status(&key.account_id, &key.folder)
            .await
    }
}

/// Summaries of cached `uids` that match `query`, newest first
fn summaries(
    store: &MessageStore,
    key: &FolderKey,
    uid_validity: Option<u32>,
    uids: &[u32],
    query: &SearchQuery,
) -> Vec<MessageSummary> {
    let mut uids = uids.to_vec();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.iter()
        .filter_map(|uid| store.get(*uid))
        .filter(|m| query.matches(m))
        .map(|m| MessageSummary::from_message(key, uid_validity, m))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::SyncEngine;
    use crate::errors::AppError;
    use crate::models::FolderKey;
    use crate::session::FolderSession;
    use crate::store::SearchQuery;
    use crate::testing::{FakeOp, FakeRemote, fake_message};

    fn setup(count: u32) -> (Arc<FakeRemote>, SyncEngine, FolderSession) {
        let fake = Arc::new(FakeRemote::new());
        fake.add_folder("default", "INBOX", 1, count);
        let engine = SyncEngine::new(fake.clone(), 10);
        let session = FolderSession::new(FolderKey::new("default", "INBOX"), 600, 16);
        (fake, engine, session)
    }

    fn uids(page: &crate::models::BatchPage) -> Vec<u32> {
        page.messages.iter().map(|m| m.uid).collect()
    }

    async fn cached(session: &FolderSession) -> BTreeSet<u32> {
        session.read().await.store.uids()
    }

    #[tokio::test]
    async fn growth_pages_backward_until_history_is_exhausted() {
        let (_fake, engine, session) = setup(25);
        let all = SearchQuery::default();

        let first = engine.get_batch(&session, &all, 10, false).await.expect("first");
        assert_eq!(uids(&first), (16..=25).rev().collect::<Vec<_>>());
        assert!(first.has_more);
        assert_eq!(first.total, 25);

        let second = engine.get_batch(&session, &all, 10, false).await.expect("second");
        assert_eq!(uids(&second), (6..=15).rev().collect::<Vec<_>>());
        assert_eq!(second.window_size, 20);
        assert_eq!(cached(&session).await.len(), 20);

        let third = engine.get_batch(&session, &all, 10, false).await.expect("third");
        assert_eq!(uids(&third), vec![5, 4, 3, 2, 1]);
        assert!(!third.has_more);
        assert!(third.folder_meta.history_complete);
    }

    #[tokio::test]
    async fn reset_restarts_from_newest() {
        let (fake, engine, session) = setup(25);
        let all = SearchQuery::default();
        engine.get_batch(&session, &all, 10, false).await.expect("first");
        engine.get_batch(&session, &all, 10, false).await.expect("second");
        let fetches = fake.calls(FakeOp::FetchSummaries);

        let page = engine.get_batch(&session, &all, 5, true).await.expect("reset");
        assert_eq!(uids(&page), vec![25, 24, 23, 22, 21]);
        assert_eq!(page.window_size, 5);
        assert_eq!(fake.calls(FakeOp::FetchSummaries), fetches);
    }

    #[tokio::test]
    async fn empty_folder_yields_empty_batch() {
        let (_fake, engine, session) = setup(0);
        let page = engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("empty");
        assert!(page.messages.is_empty());
        assert_eq!(page.total, 0);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn oversized_batch_fetches_everything_and_reports_no_more() {
        let (_fake, engine, session) = setup(7);
        let page = engine
            .get_batch(&session, &SearchQuery::default(), 50, false)
            .await
            .expect("batch");
        assert_eq!(page.messages.len(), 7);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn zero_match_query_is_not_refetched_once_history_is_known() {
        let (fake, engine, session) = setup(5);
        let query = SearchQuery::parse(Some("no such subject"));
        let page = engine.get_batch(&session, &query, 10, false).await.expect("query");
        assert!(page.messages.is_empty());
        assert_eq!(page.total, 0);
        assert!(!page.has_more);

        let lists = fake.calls(FakeOp::ListUids);
        engine.get_batch(&session, &query, 10, false).await.expect("again");
        assert_eq!(fake.calls(FakeOp::ListUids), lists);
    }

    #[tokio::test]
    async fn query_filters_cached_envelopes() {
        let (_fake, engine, session) = setup(12);
        let page = engine
            .get_batch(&session, &SearchQuery::parse(Some("message 1")), 10, false)
            .await
            .expect("query");
        // only 12, 11 and 10 carry a "1" among the ten newest
        assert_eq!(uids(&page), vec![12, 11, 10]);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn reconcile_adds_new_and_drops_missing() {
        let (fake, engine, session) = setup(0);
        for uid in [1, 2, 4] {
            fake.add_message("default", "INBOX", fake_message(uid, &format!("Message {uid}")));
        }
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        assert_eq!(cached(&session).await, BTreeSet::from([1, 2, 4]));

        fake.remove_message("default", "INBOX", 4);
        fake.add_message("default", "INBOX", fake_message(3, "Message 3"));

        let outcome = engine
            .reconcile(&session, &SearchQuery::default())
            .await
            .expect("reconcile");
        let new: Vec<u32> = outcome.new_messages.iter().map(|m| m.uid).collect();
        assert_eq!(new, vec![3]);
        assert_eq!(outcome.deleted_uids, vec![4]);
        assert!(!outcome.invalidated);
        assert_eq!(cached(&session).await, BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn reconcile_lists_exactly_the_cached_range() {
        let (fake, engine, session) = setup(25);
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        fake.add_message("default", "INBOX", fake_message(26, "Message 26"));

        let outcome = engine
            .reconcile(&session, &SearchQuery::default())
            .await
            .expect("reconcile");

        assert_eq!(fake.list_since().last(), Some(&Some(16)));
        assert!(outcome.deleted_uids.is_empty());
        let new: Vec<u32> = outcome.new_messages.iter().map(|m| m.uid).collect();
        assert_eq!(new, vec![26]);
        assert_eq!(cached(&session).await, (16..=26).collect::<BTreeSet<_>>());
        assert_eq!(outcome.meta.sync_cursor, Some(16));
    }

    #[tokio::test]
    async fn reconcile_filters_reported_messages_by_query() {
        let (fake, engine, session) = setup(3);
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        fake.add_message("default", "INBOX", fake_message(4, "Invoice April"));
        fake.add_message("default", "INBOX", fake_message(5, "Lunch"));

        let outcome = engine
            .reconcile(&session, &SearchQuery::parse(Some("invoice")))
            .await
            .expect("reconcile");
        let new: Vec<u32> = outcome.new_messages.iter().map(|m| m.uid).collect();
        assert_eq!(new, vec![4]);
        assert_eq!(cached(&session).await, BTreeSet::from([1, 2, 3, 4, 5]));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_untouched() {
        let (fake, engine, session) = setup(5);
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        fake.remove_message("default", "INBOX", 2);
        fake.add_message("default", "INBOX", fake_message(6, "Message 6"));
        fake.fail_next(FakeOp::FetchSummaries, AppError::Connection("reset".to_owned()));

        let err = engine
            .reconcile(&session, &SearchQuery::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::Connection(_)));
        assert_eq!(cached(&session).await, (1..=5).collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn failed_growth_does_not_merge_partial_page() {
        let (fake, engine, session) = setup(25);
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        fake.fail_next(FakeOp::FetchSummaries, AppError::Connection("reset".to_owned()));

        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect_err("must fail");
        assert_eq!(cached(&session).await, (16..=25).collect::<BTreeSet<_>>());
        let meta = session.read().await.meta(session.key());
        assert!(!meta.history_complete);
    }

    #[tokio::test]
    async fn validity_change_on_reset_triggers_full_refetch() {
        let (fake, engine, session) = setup(25);
        let all = SearchQuery::default();
        engine.get_batch(&session, &all, 10, false).await.expect("load");
        fake.reset_epoch("default", "INBOX", 2);

        let page = engine.get_batch(&session, &all, 5, true).await.expect("reset");
        assert_eq!(uids(&page), vec![25, 24, 23, 22, 21]);
        assert_eq!(page.folder_meta.uid_validity, Some(2));
        assert_eq!(page.folder_meta.cached, 5);
        assert!(
            page.messages
                .iter()
                .all(|m| m.envelope.subject.as_deref().is_some_and(|s| s.starts_with("Epoch 2")))
        );
    }

    #[tokio::test]
    async fn validity_change_is_detected_on_a_cached_page() {
        let (fake, engine, session) = setup(25);
        let all = SearchQuery::default();
        engine.get_batch(&session, &all, 10, false).await.expect("load");
        fake.reset_epoch("default", "INBOX", 2);

        // ten matches are cached, so only the token check can tell
        let page = engine
            .get_batch(&session, &SearchQuery::parse(Some("example.com")), 5, false)
            .await
            .expect("batch");
        assert_eq!(page.folder_meta.uid_validity, Some(2));
        assert_eq!(uids(&page), vec![25, 24, 23, 22, 21]);
        assert!(
            page.messages
                .iter()
                .all(|m| m.envelope.subject.as_deref().is_some_and(|s| s.starts_with("Epoch 2")))
        );
        assert_eq!(cached(&session).await, (21..=25).collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn validity_change_on_reconcile_reports_invalidation() {
        let (fake, engine, session) = setup(12);
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        fake.reset_epoch("default", "INBOX", 9);

        let outcome = engine
            .reconcile(&session, &SearchQuery::default())
            .await
            .expect("reconcile");
        assert!(outcome.invalidated);
        assert_eq!(outcome.deleted_uids, (3..=12).collect::<Vec<_>>());
        assert_eq!(outcome.new_messages.len(), 10);
        assert_eq!(outcome.meta.uid_validity, Some(9));
    }

    #[tokio::test]
    async fn flagged_session_reconciles_before_serving() {
        let (fake, engine, session) = setup(12);
        let all = SearchQuery::default();
        engine.get_batch(&session, &all, 5, false).await.expect("load");
        fake.reset_epoch("default", "INBOX", 3);
        session.write().await.needs_reconcile = true;

        let page = engine.get_batch(&session, &all, 5, false).await.expect("batch");
        assert_eq!(page.folder_meta.uid_validity, Some(3));
        assert!(!page.folder_meta.needs_reconcile);
        assert!(
            page.messages
                .iter()
                .all(|m| m.envelope.subject.as_deref().is_some_and(|s| s.starts_with("Epoch 3")))
        );
    }

    #[tokio::test]
    async fn readers_never_observe_a_partial_merge() {
        let (fake, engine, session) = setup(25);
        let engine = Arc::new(engine);
        let session = Arc::new(session);
        engine
            .get_batch(&session, &SearchQuery::default(), 10, false)
            .await
            .expect("load");
        fake.remove_message("default", "INBOX", 20);
        fake.add_message("default", "INBOX", fake_message(26, "Message 26"));

        let (entered, release) = fake.pause_next_fetch();
        let task = {
            let engine = engine.clone();
            let session = session.clone();
            tokio::spawn(async move {
                engine
                    .reconcile(&session, &SearchQuery::default())
                    .await
            })
        };
        entered.notified().await;

        let during = engine
            .get_batch(&session, &SearchQuery::parse(Some("message")), 5, false)
            .await
            .expect("read during sync");
        assert_eq!(uids(&during), vec![25, 24, 23, 22, 21]);
        let before = cached(&session).await;
        assert!(before.contains(&20));
        assert!(!before.contains(&26));

        release.notify_one();
        let outcome = task.await.expect("join").expect("reconcile");
        assert_eq!(outcome.deleted_uids, vec![20]);
        let after = cached(&session).await;
        assert!(!after.contains(&20));
        assert!(after.contains(&26));
    }
}
