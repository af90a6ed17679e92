//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers 9 MCP tools. Handles
//! input validation and response formatting; everything else is delegated to
//! [`MailService`].

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    GetBatchInput, GetPartInput, GetTextsInput, Meta, StarInput, SyncInput, ToolEnvelope,
    TransferInput,
};
use crate::service::MailService;

/// Maximum UIDs accepted by a single tool call
const MAX_UIDS_PER_CALL: usize = 500;
/// Maximum length of a keyword query
const MAX_QUERY_CHARS: usize = 256;

/// Mail sync MCP server
///
/// Thin tool layer over a shared [`MailService`]. Implements MCP tool
/// handlers via `#[tool]` attribute macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct MailSyncServer {
    service: Arc<MailService>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailSyncServer {
    pub fn new(service: Arc<MailService>) -> Self {
        Self {
            service,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: List folders of every account with cache metadata
    #[tool(
        name = "mail_get_folders",
        description = "List folders of all configured accounts with counts and sync state"
    )]
    async fn get_folders(&self) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = self.service.get_folders().await.and_then(|listing| {
            let count: usize = listing.accounts.iter().map(|a| a.folders.len()).sum();
            Ok((format!("{count} folder(s)"), to_json(&listing)?))
        });
        finalize_tool(started, result)
    }

    /// Tool: Next batch of a folder, newest first
    ///
    /// Serves from cache when the current window can be satisfied, otherwise
    /// grows the cache with the next-older UIDs.
    #[tool(
        name = "mail_get_batch",
        description = "Get the next batch of messages in a folder, newest first"
    )]
    async fn get_batch(
        &self,
        Parameters(input): Parameters<GetBatchInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_batch_impl(input).await.map(|(count, data)| {
                (format!("{count} message(s) returned"), data)
            }),
        )
    }

    /// Tool: Reconcile a folder with the remote
    #[tool(
        name = "mail_sync",
        description = "Reconcile a folder: fetch new messages and drop deleted ones"
    )]
    async fn sync(
        &self,
        Parameters(input): Parameters<SyncInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, self.sync_impl(input).await)
    }

    /// Tool: Text bodies and attachment listings for several messages
    #[tool(
        name = "mail_get_texts",
        description = "Get plain text, sanitized HTML and attachment list for messages"
    )]
    async fn get_texts(
        &self,
        Parameters(input): Parameters<GetTextsInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, self.get_texts_impl(input).await)
    }

    /// Tool: One MIME part, base64 encoded
    #[tool(
        name = "mail_get_part",
        description = "Get one MIME part of a message by IMAP part number"
    )]
    async fn get_part(
        &self,
        Parameters(input): Parameters<GetPartInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_part_impl(input)
                .await
                .map(|data| ("Part retrieved".to_owned(), data)),
        )
    }

    /// Tool: Move messages to another folder
    ///
    /// Requires `MAIL_SYNC_WRITE_ENABLED=true`.
    #[tool(
        name = "mail_move",
        description = "Move messages to another folder of the same account"
    )]
    async fn move_messages(
        &self,
        Parameters(input): Parameters<TransferInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, self.transfer_impl(input, false).await)
    }

    /// Tool: Copy messages to another folder
    ///
    /// Requires `MAIL_SYNC_WRITE_ENABLED=true`.
    #[tool(
        name = "mail_copy",
        description = "Copy messages to another folder of the same account"
    )]
    async fn copy_messages(
        &self,
        Parameters(input): Parameters<TransferInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, self.transfer_impl(input, true).await)
    }

    #[tool(name = "mail_star", description = "Star messages")]
    async fn star(
        &self,
        Parameters(input): Parameters<StarInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, self.star_impl(input, true).await)
    }

    #[tool(name = "mail_unstar", description = "Remove the star from messages")]
    async fn unstar(
        &self,
        Parameters(input): Parameters<StarInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, self.star_impl(input, false).await)
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailSyncServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Mail sync MCP server. Messages are served newest first in batches from a local cache kept in sync with IMAP; write tools require MAIL_SYNC_WRITE_ENABLED=true.",
        )
    }
}

/// Part payload returned by `mail_get_part`
#[derive(Debug, Serialize)]
struct PartData {
    account_id: String,
    folder: String,
    uid: u32,
    part_number: String,
    mime_type: String,
    filename: Option<String>,
    size_bytes: usize,
    data_base64: String,
}

/// Tool implementation methods
///
/// Private methods validate inputs and call the service, separated from the
/// public `#[tool]` methods that handle response formatting.
impl MailSyncServer {
    async fn get_batch_impl(&self, input: GetBatchInput) -> AppResult<(usize, serde_json::Value)> {
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        validate_query(input.query.as_deref())?;

        let page = self
            .service
            .get_batch(
                &input.account_id,
                &input.folder,
                input.query.as_deref(),
                input.reset,
                input.batch_size,
            )
            .await?;
        Ok((page.messages.len(), to_json(&page)?))
    }

    async fn sync_impl(&self, input: SyncInput) -> AppResult<(String, serde_json::Value)> {
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        validate_query(input.query.as_deref())?;

        let outcome = self
            .service
            .sync(&input.account_id, &input.folder, input.query.as_deref())
            .await?;
        let summary = if outcome.invalidated {
            format!(
                "Folder validity changed; cache rebuilt with {} message(s)",
                outcome.new_messages.len()
            )
        } else {
            format!(
                "{} new, {} deleted",
                outcome.new_messages.len(),
                outcome.deleted_uids.len()
            )
        };
        Ok((summary, to_json(&outcome)?))
    }

    async fn get_texts_impl(&self, input: GetTextsInput) -> AppResult<(String, serde_json::Value)> {
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        validate_uids(&input.uids, "uids")?;

        let texts = self
            .service
            .get_texts(&input.account_id, &input.folder, &input.uids)
            .await?;
        Ok((
            format!("{} of {} message(s) found", texts.len(), input.uids.len()),
            serde_json::json!({
                "account_id": input.account_id,
                "folder": input.folder,
                "messages": texts,
            }),
        ))
    }

    async fn get_part_impl(&self, input: GetPartInput) -> AppResult<serde_json::Value> {
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        validate_uid(input.uid)?;
        validate_part_number(&input.part_number)?;

        let part = self
            .service
            .get_part(&input.account_id, &input.folder, input.uid, &input.part_number)
            .await?;
        to_json(&PartData {
            account_id: input.account_id,
            folder: input.folder,
            uid: input.uid,
            part_number: input.part_number,
            mime_type: part.mime_type,
            filename: part.filename,
            size_bytes: part.data.len(),
            data_base64: STANDARD.encode(&part.data),
        })
    }

    async fn transfer_impl(
        &self,
        input: TransferInput,
        copy: bool,
    ) -> AppResult<(String, serde_json::Value)> {
        require_write_enabled(self.config())?;
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        validate_folder(&input.new_folder)?;
        validate_uids(&input.message_uids, "message_uids")?;
        if input.folder == input.new_folder {
            return Err(AppError::invalid("new_folder must differ from folder"));
        }

        let (verb, report) = if copy {
            let report = self
                .service
                .copy_messages(
                    &input.account_id,
                    &input.folder,
                    &input.message_uids,
                    &input.new_folder,
                )
                .await?;
            ("copied", report)
        } else {
            let report = self
                .service
                .move_messages(
                    &input.account_id,
                    &input.folder,
                    &input.message_uids,
                    &input.new_folder,
                )
                .await?;
            ("moved", report)
        };
        Ok((
            format!("{} message(s) {verb}", report.uids.len()),
            to_json(&report)?,
        ))
    }

    async fn star_impl(
        &self,
        input: StarInput,
        starred: bool,
    ) -> AppResult<(String, serde_json::Value)> {
        require_write_enabled(self.config())?;
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        validate_uids(&input.message_uids, "message_uids")?;

        let report = if starred {
            self.service
                .star(&input.account_id, &input.folder, &input.message_uids)
                .await?
        } else {
            self.service
                .unstar(&input.account_id, &input.folder, &input.message_uids)
                .await?
        };
        let verb = if starred { "starred" } else { "unstarred" };
        Ok((
            format!("{} message(s) {verb}", report.uids.len()),
            to_json(&report)?,
        ))
    }

    fn config(&self) -> &ServerConfig {
        self.service.config()
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

fn to_json<T: Serialize>(value: &T) -> AppResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("serialization failure: {e}")))
}

/// Validate account_id format
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if account_id.is_empty() || account_id.len() > 64 {
        return Err(AppError::InvalidInput(
            "account_id must be 1..64 characters".to_owned(),
        ));
    }
    if !account_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::InvalidInput(
            "account_id must match [A-Za-z0-9_-]+".to_owned(),
        ));
    }
    Ok(())
}

/// Validate folder name format
fn validate_folder(folder: &str) -> AppResult<()> {
    if folder.is_empty() || folder.len() > 256 {
        return Err(AppError::InvalidInput(
            "folder must be 1..256 characters".to_owned(),
        ));
    }
    validate_no_controls(folder, "folder")?;
    Ok(())
}

fn validate_query(query: Option<&str>) -> AppResult<()> {
    let Some(query) = query else {
        return Ok(());
    };
    validate_chars(query.chars().count(), 0, MAX_QUERY_CHARS, "query length")?;
    validate_no_controls(query, "query")
}

/// Reject control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Validate numeric value in range
fn validate_chars(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

fn validate_uid(uid: u32) -> AppResult<()> {
    if uid == 0 {
        return Err(AppError::invalid("uid must be a positive integer"));
    }
    Ok(())
}

/// UID lists must be non-empty, bounded and free of zero
fn validate_uids(uids: &[u32], field: &str) -> AppResult<()> {
    validate_chars(uids.len(), 1, MAX_UIDS_PER_CALL, field)?;
    if uids.contains(&0) {
        return Err(AppError::InvalidInput(format!(
            "{field} must contain positive integers"
        )));
    }
    Ok(())
}

/// Part numbers are dot-separated positive integers (`2`, `1.2`)
fn validate_part_number(part_number: &str) -> AppResult<()> {
    let valid = part_number.len() <= 64
        && part_number.split('.').all(|segment| {
            !segment.is_empty()
                && segment.chars().all(|ch| ch.is_ascii_digit())
                && segment.parse::<u32>().is_ok_and(|n| n > 0)
        });
    if !valid {
        return Err(AppError::InvalidInput(format!(
            "invalid part_number '{part_number}'"
        )));
    }
    Ok(())
}

/// Check if write operations are enabled
fn require_write_enabled(config: &ServerConfig) -> AppResult<()> {
    if !config.write_enabled {
        return Err(AppError::InvalidInput(
            "write tools are disabled; set MAIL_SYNC_WRITE_ENABLED=true".to_owned(),
        ));
    }
    Ok(())
}
