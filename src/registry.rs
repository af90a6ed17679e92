//! Folder registry
//!
//! Owns the folder sessions, keyed by (account, folder), and builds the
//! cross-account folder listing from a lightweight status check merged with
//! whatever each session already knows.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::errors::AppResult;
use crate::models::{AccountFolders, FolderKey, FolderListing};
use crate::remote::RemoteMailbox;
use crate::session::FolderSession;

pub struct FolderRegistry {
    config: Arc<ServerConfig>,
    remote: Arc<dyn RemoteMailbox>,
    sessions: RwLock<HashMap<FolderKey, Arc<FolderSession>>>,
}

impl FolderRegistry {
    pub fn new(config: Arc<ServerConfig>, remote: Arc<dyn RemoteMailbox>) -> Self {
        Self {
            config,
            remote,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Session for a folder, created on first use
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is not configured.
    pub async fn session(&self, account_id: &str, folder: &str) -> AppResult<Arc<FolderSession>> {
        self.config.get_account(account_id)?;
        let key = FolderKey::new(account_id, folder);
        if let Some(session) = self.sessions.read().await.get(&key) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key.clone()).or_insert_with(|| {
            Arc::new(FolderSession::new(
                key,
                self.config.window_ttl_seconds,
                self.config.window_max_entries,
            ))
        });
        Ok(session.clone())
    }

    /// Folders of every configured account with their metadata
    ///
    /// Accounts are queried concurrently; a failure on any account fails
    /// the listing.
    pub async fn list_folders(&self) -> AppResult<FolderListing> {
        let accounts = try_join_all(
            self.config
                .accounts
                .keys()
                .map(|account_id| self.list_account(account_id)),
        )
        .await?;
        Ok(FolderListing { accounts })
    }

    async fn list_account(&self, account_id: &str) -> AppResult<AccountFolders> {
        let names = self.remote.list_folders(account_id).await?;
        let statuses: HashMap<String, _> = self
            .remote
            .folder_statuses(account_id, &names)
            .await?
            .into_iter()
            .collect();

        let mut folders = Vec::with_capacity(names.len());
        for name in names {
            let session = self.session(account_id, &name).await?;
            let mut state = session.write().await;
            if let Some(status) = statuses.get(&name) {
                if state
                    .uid_validity
                    .is_some_and(|v| v != status.uid_validity)
                {
                    warn!(
                        account = account_id,
                        folder = %name,
                        uid_validity = status.uid_validity,
                        "validity changed since last sync"
                    );
                    state.needs_reconcile = true;
                }
                state.apply_status(status);
            }
            folders.push(state.meta(session.key()));
        }

        debug!(account = account_id, folders = folders.len(), "listed folders");
        Ok(AccountFolders {
            account_id: account_id.to_owned(),
            folders,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::FolderRegistry;
    use crate::config::test_config;
    use crate::errors::AppError;
    use crate::store::SearchQuery;
    use crate::sync::SyncEngine;
    use crate::testing::{FakeOp, FakeRemote};

    fn registry(fake: &Arc<FakeRemote>) -> FolderRegistry {
        FolderRegistry::new(Arc::new(test_config()), fake.clone())
    }

    #[tokio::test]
    async fn sessions_are_shared_per_folder() {
        let fake = Arc::new(FakeRemote::new());
        let registry = registry(&fake);
        let a = registry.session("default", "INBOX").await.expect("session");
        let b = registry.session("default", "INBOX").await.expect("session");
        let c = registry.session("work", "INBOX").await.expect("session");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let err = registry
            .session("nobody", "INBOX")
            .await
            .expect_err("unknown account");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn lists_every_account_with_status_counts() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_folder("default", "INBOX", 1, 4);
        fake.add_folder("default", "Archive", 2, 9);
        fake.add_folder("work", "INBOX", 5, 2);
        let registry = registry(&fake);

        let listing = registry.list_folders().await.expect("listing");
        assert_eq!(listing.accounts.len(), 2);
        let default = &listing.accounts[0];
        assert_eq!(default.account_id, "default");
        assert_eq!(default.folders.len(), 2);
        let archive = default
            .folders
            .iter()
            .find(|f| f.folder == "Archive")
            .expect("archive listed");
        assert_eq!(archive.remote_total, Some(9));
        assert_eq!(archive.cached, 0);
        assert_eq!(fake.calls(FakeOp::FetchSummaries), 0);
        assert_eq!(listing.accounts[1].folders[0].remote_total, Some(2));
    }

    #[tokio::test]
    async fn listing_flags_validity_changes_for_reconcile() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_folder("default", "INBOX", 1, 6);
        let registry = registry(&fake);
        let session = registry.session("default", "INBOX").await.expect("session");
        let engine = SyncEngine::new(fake.clone(), 10);
        engine
            .get_batch(&session, &SearchQuery::default(), 3, false)
            .await
            .expect("load");
        fake.reset_epoch("default", "INBOX", 2);

        let listing = registry.list_folders().await.expect("listing");
        let inbox = &listing.accounts[0].folders[0];
        assert!(inbox.needs_reconcile);
        assert_eq!(inbox.cached, 3);

        let page = engine
            .get_batch(&session, &SearchQuery::default(), 3, false)
            .await
            .expect("batch");
        assert_eq!(page.folder_meta.uid_validity, Some(2));
        assert!(
            page.messages
                .iter()
                .all(|m| m.envelope.subject.as_deref().is_some_and(|s| s.starts_with("Epoch 2")))
        );
    }

    #[tokio::test]
    async fn listing_failure_propagates() {
        let fake = Arc::new(FakeRemote::new());
        fake.add_folder("default", "INBOX", 1, 1);
        fake.fail_next(
            FakeOp::ListFolders,
            AppError::RemoteUnavailable("down".to_owned()),
        );
        let registry = registry(&fake);
        let err = registry.list_folders().await.expect_err("must fail");
        assert!(matches!(err, AppError::RemoteUnavailable(_)));
    }
}
