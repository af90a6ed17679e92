//! Caller-facing operations
//!
//! [`MailService`] wires the registry, sync engine, mutation coordinator and
//! part resolver together behind the operations the tool layer exposes.
//! Arguments are assumed validated; account ids are still resolved against
//! the configuration here.

use std::sync::Arc;

use tracing::debug;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{BatchPage, FlagReport, FolderListing, MessageText, SyncOutcome, TransferReport};
use crate::mutation::MutationCoordinator;
use crate::parts::{PartResolver, ResolvedPart};
use crate::registry::FolderRegistry;
use crate::remote::RemoteMailbox;
use crate::store::SearchQuery;
use crate::sync::SyncEngine;

pub struct MailService {
    config: Arc<ServerConfig>,
    registry: FolderRegistry,
    sync: SyncEngine,
    mutations: MutationCoordinator,
    parts: Arc<dyn PartResolver>,
}

impl MailService {
    pub fn new(
        config: Arc<ServerConfig>,
        remote: Arc<dyn RemoteMailbox>,
        parts: Arc<dyn PartResolver>,
    ) -> Self {
        Self {
            registry: FolderRegistry::new(config.clone(), remote.clone()),
            sync: SyncEngine::new(remote.clone(), config.default_batch_size),
            mutations: MutationCoordinator::new(remote),
            parts,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn get_folders(&self) -> AppResult<FolderListing> {
        self.registry.list_folders().await
    }

    pub async fn get_batch(
        &self,
        account_id: &str,
        folder: &str,
        query: Option<&str>,
        reset: bool,
        batch_size: Option<usize>,
    ) -> AppResult<BatchPage> {
        let session = self.registry.session(account_id, folder).await?;
        let size = self.config.resolve_batch_size(batch_size);
        self.sync
            .get_batch(&session, &SearchQuery::parse(query), size, reset)
            .await
    }

    pub async fn sync(
        &self,
        account_id: &str,
        folder: &str,
        query: Option<&str>,
    ) -> AppResult<SyncOutcome> {
        let session = self.registry.session(account_id, folder).await?;
        self.sync
            .reconcile(&session, &SearchQuery::parse(query))
            .await
    }

    pub async fn move_messages(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        new_folder: &str,
    ) -> AppResult<TransferReport> {
        let source = self.registry.session(account_id, folder).await?;
        let destination = self.registry.session(account_id, new_folder).await?;
        self.mutations
            .move_messages(&source, &destination, uids)
            .await
    }

    pub async fn copy_messages(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
        new_folder: &str,
    ) -> AppResult<TransferReport> {
        let source = self.registry.session(account_id, folder).await?;
        let destination = self.registry.session(account_id, new_folder).await?;
        self.mutations
            .copy_messages(&source, &destination, uids)
            .await
    }

    pub async fn star(&self, account_id: &str, folder: &str, uids: &[u32]) -> AppResult<FlagReport> {
        let session = self.registry.session(account_id, folder).await?;
        self.mutations.set_star(&session, uids, true).await
    }

    pub async fn unstar(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> AppResult<FlagReport> {
        let session = self.registry.session(account_id, folder).await?;
        self.mutations.set_star(&session, uids, false).await
    }

    /// One MIME part of a message
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the message or the part number does not exist.
    pub async fn get_part(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        part_number: &str,
    ) -> AppResult<ResolvedPart> {
        self.config.get_account(account_id)?;
        self.parts
            .resolve_part(account_id, folder, uid, part_number)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("part {part_number} not found in message uid {uid}"))
            })
    }

    /// Text bodies of several messages; UIDs missing remotely are skipped
    pub async fn get_texts(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> AppResult<Vec<MessageText>> {
        self.config.get_account(account_id)?;
        let mut texts = Vec::with_capacity(uids.len());
        for uid in uids {
            match self.parts.message_text(account_id, folder, *uid).await? {
                Some(text) => texts.push(text),
                None => debug!(account = account_id, folder, uid, "skipping missing message"),
            }
        }
        Ok(texts)
    }
}
