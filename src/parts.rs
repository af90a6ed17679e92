//! Part resolver
//!
//! Resolves individual MIME parts and text bodies of a message on demand.
//! Nothing resolved here is cached. A missing message or part number is
//! reported as `None`, distinct from any remote failure.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::mime;
use crate::models::MessageText;
use crate::remote::RemoteMailbox;

/// A resolved part: MIME type and decoded bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPart {
    pub mime_type: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait PartResolver: Send + Sync {
    /// Part `part_number` of message `uid`, or `None` if either is absent
    async fn resolve_part(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        part_number: &str,
    ) -> AppResult<Option<ResolvedPart>>;

    /// Text bodies of message `uid`, or `None` if the message is absent
    async fn message_text(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
    ) -> AppResult<Option<MessageText>>;
}

/// Resolver that fetches raw messages from the remote and walks their MIME
/// tree locally
pub struct MimePartResolver {
    remote: Arc<dyn RemoteMailbox>,
}

impl MimePartResolver {
    pub fn new(remote: Arc<dyn RemoteMailbox>) -> Self {
        Self { remote }
    }

    async fn raw(&self, account_id: &str, folder: &str, uid: u32) -> AppResult<Option<Vec<u8>>> {
        match self.remote.fetch_raw(account_id, folder, uid).await {
            Ok(raw) => Ok(Some(raw)),
            Err(AppError::NotFound(msg)) => {
                debug!(account = account_id, folder, uid, reason = %msg, "message not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PartResolver for MimePartResolver {
    async fn resolve_part(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        part_number: &str,
    ) -> AppResult<Option<ResolvedPart>> {
        let Some(raw) = self.raw(account_id, folder, uid).await? else {
            return Ok(None);
        };
        Ok(mime::find_part(&raw, part_number)?.map(|part| ResolvedPart {
            mime_type: part.mime_type,
            filename: part.filename,
            data: part.data,
        }))
    }

    async fn message_text(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
    ) -> AppResult<Option<MessageText>> {
        let Some(raw) = self.raw(account_id, folder, uid).await? else {
            return Ok(None);
        };
        mime::extract_texts(uid, &raw).map(Some)
    }
}
