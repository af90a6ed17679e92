//! Remote mailbox capability and retry boundary
//!
//! The cache engine only talks to a mail server through [`RemoteMailbox`].
//! [`crate::imap::ImapRemote`] is the real implementation; tests use an
//! in-memory fake. [`RetryingRemote`] wraps either one and is the single
//! place where transient failures are retried.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::models::{Flag, Message};

/// Lightweight folder status (no message fetch)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderStatus {
    /// Validity token; a change invalidates every cached UID
    pub uid_validity: u32,
    /// Messages in the folder
    pub total: usize,
    /// Unread messages, when the server reports them
    pub unread: Option<usize>,
    /// Next UID the server will assign
    pub uid_next: Option<u32>,
}

/// Result of a remote move or copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Destination UIDVALIDITY the new UIDs belong to
    pub destination_uid_validity: Option<u32>,
    /// (source UID, destination UID) pairs; empty when the server does not
    /// report them
    pub uid_map: Vec<(u32, u32)>,
}

/// Operations the engine needs from one account's remote store
///
/// Every call may fail with `Connection` (transient, retryable),
/// `RemoteRejected` (the server said no) or, for mutations,
/// `AmbiguousOutcome` (the command was sent but its result was lost).
#[async_trait]
pub trait RemoteMailbox: Send + Sync {
    /// Selectable folder paths of an account
    async fn list_folders(&self, account_id: &str) -> AppResult<Vec<String>>;

    /// Status of one folder, including its validity token
    async fn folder_status(&self, account_id: &str, folder: &str) -> AppResult<FolderStatus>;

    /// Status of many folders
    ///
    /// Folders the server refuses to report on are skipped. Implementations
    /// that can batch the requests over one connection should override this.
    async fn folder_statuses(
        &self,
        account_id: &str,
        folders: &[String],
    ) -> AppResult<Vec<(String, FolderStatus)>> {
        let mut out = Vec::with_capacity(folders.len());
        for folder in folders {
            match self.folder_status(account_id, folder).await {
                Ok(status) => out.push((folder.clone(), status)),
                Err(AppError::RemoteRejected(msg)) => {
                    warn!(account = account_id, folder = %folder, error = %msg, "folder status rejected");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// UIDs currently in the folder, restricted to `uid >= since` when given
    async fn list_uids(
        &self,
        account_id: &str,
        folder: &str,
        since: Option<u32>,
    ) -> AppResult<BTreeSet<u32>>;

    /// Envelope, flags and size for the given UIDs (absent UIDs are omitted)
    async fn fetch_summaries(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> AppResult<Vec<Message>>;

    /// Full RFC822 source of one message; `NotFound` if the UID is absent
    async fn fetch_raw(&self, account_id: &str, folder: &str, uid: u32) -> AppResult<Vec<u8>>;

    async fn move_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome>;

    async fn copy_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome>;

    async fn set_flag(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        flag: &Flag,
        value: bool,
    ) -> AppResult<()>;
}

/// Retry wrapper around a [`RemoteMailbox`]
///
/// Repeats calls failing with `Connection` using exponential backoff and
/// reports exhaustion as `RemoteUnavailable`. Every other error passes
/// through untouched; in particular an `AmbiguousOutcome` is never retried,
/// since repeating a mutation that may already have been applied is unsafe.
pub struct RetryingRemote<R> {
    inner: R,
    attempts: u32,
    backoff: Duration,
}

impl<R: RemoteMailbox> RetryingRemote<R> {
    pub fn new(inner: R, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> AppResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = AppResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying remote call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    debug!(op, attempts = self.attempts, "remote retries exhausted");
                    return Err(AppError::RemoteUnavailable(format!(
                        "{op} failed after {} attempt(s): {e}",
                        self.attempts
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: RemoteMailbox> RemoteMailbox for RetryingRemote<R> {
    async fn list_folders(&self, account_id: &str) -> AppResult<Vec<String>> {
        self.with_retry("list_folders", move || self.inner.list_folders(account_id))
            .await
    }

    async fn folder_status(&self, account_id: &str, folder: &str) -> AppResult<FolderStatus> {
        self.with_retry("folder_status", move || {
            self.inner.folder_status(account_id, folder)
        })
        .await
    }

    async fn folder_statuses(
        &self,
        account_id: &str,
        folders: &[String],
    ) -> AppResult<Vec<(String, FolderStatus)>> {
        self.with_retry("folder_statuses", move || {
            self.inner.folder_statuses(account_id, folders)
        })
        .await
    }

    async fn list_uids(
        &self,
        account_id: &str,
        folder: &str,
        since: Option<u32>,
    ) -> AppResult<BTreeSet<u32>> {
        self.with_retry("list_uids", move || {
            self.inner.list_uids(account_id, folder, since)
        })
        .await
    }

    async fn fetch_summaries(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> AppResult<Vec<Message>> {
        self.with_retry("fetch_summaries", move || {
            self.inner.fetch_summaries(account_id, folder, uids)
        })
        .await
    }

    async fn fetch_raw(&self, account_id: &str, folder: &str, uid: u32) -> AppResult<Vec<u8>> {
        self.with_retry("fetch_raw", move || {
            self.inner.fetch_raw(account_id, folder, uid)
        })
        .await
    }

    async fn move_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome> {
        self.with_retry("move_messages", move || {
            self.inner
                .move_messages(account_id, from_folder, uids, to_folder)
        })
        .await
    }

    async fn copy_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome> {
        self.with_retry("copy_messages", move || {
            self.inner
                .copy_messages(account_id, from_folder, uids, to_folder)
        })
        .await
    }

    async fn set_flag(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        flag: &Flag,
        value: bool,
    ) -> AppResult<()> {
        self.with_retry("set_flag", move || {
            self.inner.set_flag(account_id, folder, uids, flag, value)
        })
        .await
    }
}
