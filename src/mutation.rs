//! Mutation coordinator
//!
//! Applies move, copy and star/unstar remote-first, cache-second: the cache
//! is only touched after the remote confirmed the change. When the outcome
//! of a dispatched command is unknown the affected sessions are flagged for
//! reconciliation instead of guessing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{Flag, FlagReport, Message, TransferReport};
use crate::remote::{RemoteMailbox, TransferOutcome};
use crate::session::FolderSession;

pub struct MutationCoordinator {
    remote: Arc<dyn RemoteMailbox>,
}

impl MutationCoordinator {
    pub fn new(remote: Arc<dyn RemoteMailbox>) -> Self {
        Self { remote }
    }

    /// Move messages between two folders of one account
    ///
    /// On success the UIDs leave the source cache. They enter the destination
    /// cache directly when the remote reported their new UIDs; otherwise the
    /// destination is flagged so its next read picks them up.
    #[instrument(skip_all, fields(op_id = %Uuid::new_v4(), account = %source.key().account_id, from = %source.key().folder, to = %destination.key().folder, count = uids.len()))]
    pub async fn move_messages(
        &self,
        source: &FolderSession,
        destination: &FolderSession,
        uids: &[u32],
    ) -> AppResult<TransferReport> {
        let mut report = transfer_report(source, destination, uids)?;
        if uids.is_empty() {
            return Ok(report);
        }

        let (outcome, moved) = {
            let _guard = source.lock_ops().await;
            let src = source.key();
            let outcome = self
                .remote
                .move_messages(&src.account_id, &src.folder, uids, &destination.key().folder)
                .await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => return Err(self.note_failure(e, &[source, destination]).await),
            };
            let moved = source.write().await.store.remove(uids);
            (outcome, moved)
        };
        report.removed_from_cache = moved.len();

        {
            let _guard = destination.lock_ops().await;
            report.inserted_into_destination =
                adopt_moved(destination, &outcome, moved, uids.len()).await;
        }

        info!(
            removed = report.removed_from_cache,
            inserted = report.inserted_into_destination,
            "move applied"
        );
        Ok(report)
    }

    /// Copy messages; the source cache is unchanged and the destination is
    /// flagged for reconciliation
    #[instrument(skip_all, fields(op_id = %Uuid::new_v4(), account = %source.key().account_id, from = %source.key().folder, to = %destination.key().folder, count = uids.len()))]
    pub async fn copy_messages(
        &self,
        source: &FolderSession,
        destination: &FolderSession,
        uids: &[u32],
    ) -> AppResult<TransferReport> {
        let report = transfer_report(source, destination, uids)?;
        if uids.is_empty() {
            return Ok(report);
        }

        {
            let _guard = source.lock_ops().await;
            let src = source.key();
            if let Err(e) = self
                .remote
                .copy_messages(&src.account_id, &src.folder, uids, &destination.key().folder)
                .await
            {
                return Err(self.note_failure(e, &[source, destination]).await);
            }
        }

        {
            let _guard = destination.lock_ops().await;
            mark_stale(destination).await;
        }

        info!("copy applied");
        Ok(report)
    }

    /// Set or clear the starred flag
    #[instrument(skip_all, fields(op_id = %Uuid::new_v4(), account = %session.key().account_id, folder = %session.key().folder, count = uids.len(), starred = starred))]
    pub async fn set_star(
        &self,
        session: &FolderSession,
        uids: &[u32],
        starred: bool,
    ) -> AppResult<FlagReport> {
        let key = session.key();
        let mut report = FlagReport {
            account_id: key.account_id.clone(),
            folder: key.folder.clone(),
            uids: uids.to_vec(),
            starred,
            updated_in_cache: 0,
        };
        if uids.is_empty() {
            return Ok(report);
        }

        let _guard = session.lock_ops().await;
        if let Err(e) = self
            .remote
            .set_flag(&key.account_id, &key.folder, uids, &Flag::Flagged, starred)
            .await
        {
            return Err(self.note_failure(e, &[session]).await);
        }
        report.updated_in_cache = session
            .write()
            .await
            .store
            .set_flags(uids, &Flag::Flagged, starred);

        info!(updated = report.updated_in_cache, "flags applied");
        Ok(report)
    }

    /// Record a failed remote mutation and hand the error back
    ///
    /// An ambiguous outcome flags every involved session; the cache itself
    /// is left as it was.
    async fn note_failure(&self, err: AppError, sessions: &[&FolderSession]) -> AppError {
        if matches!(err, AppError::AmbiguousOutcome(_)) {
            for session in sessions {
                session.write().await.needs_reconcile = true;
            }
            warn!(error = %err, "mutation outcome unknown, folders flagged for reconcile");
        } else {
            warn!(error = %err, "mutation rejected, cache untouched");
        }
        err
    }
}

fn transfer_report(
    source: &FolderSession,
    destination: &FolderSession,
    uids: &[u32],
) -> AppResult<TransferReport> {
    let (src, dst) = (source.key(), destination.key());
    if src.account_id != dst.account_id {
        return Err(AppError::InvalidInput(
            "source and destination must belong to the same account".to_owned(),
        ));
    }
    if src.folder == dst.folder {
        return Err(AppError::InvalidInput(
            "destination folder must differ from source folder".to_owned(),
        ));
    }
    Ok(TransferReport {
        account_id: src.account_id.clone(),
        folder: src.folder.clone(),
        new_folder: dst.folder.clone(),
        uids: uids.to_vec(),
        removed_from_cache: 0,
        inserted_into_destination: 0,
    })
}

/// Insert moved messages under their reported destination UIDs
///
/// Only UIDs inside the destination's cached range are inserted, and only
/// when the destination validity matches the reported one. If fewer than
/// `expected` could be placed the destination is marked stale. Returns the
/// number inserted.
async fn adopt_moved(
    destination: &FolderSession,
    outcome: &TransferOutcome,
    moved: Vec<Message>,
    expected: usize,
) -> usize {
    let mut state = destination.write().await;
    let cursor = state.store.oldest_uid();
    let same_epoch = outcome.destination_uid_validity.is_some()
        && outcome.destination_uid_validity == state.uid_validity;

    let mut inserted = 0;
    if same_epoch && let Some(cursor) = cursor {
        let mut by_uid: HashMap<u32, Message> = moved.into_iter().map(|m| (m.uid, m)).collect();
        for (old_uid, new_uid) in &outcome.uid_map {
            if *new_uid < cursor {
                continue;
            }
            if let Some(mut message) = by_uid.remove(old_uid) {
                message.uid = *new_uid;
                state.store.upsert(message);
                inserted += 1;
            }
        }
    }

    if inserted < expected && state.uid_validity.is_some() {
        state.windows.clear();
        state.needs_reconcile = true;
    }
    inserted
}

async fn mark_stale(session: &FolderSession) {
    let mut state = session.write().await;
    if state.uid_validity.is_some() {
        state.windows.clear();
        state.needs_reconcile = true;
    }
}
