//! Domain types, input/output DTOs and schema-bearing types
//!
//! The first half holds the cached message model shared by the store, the
//! sync engine and the remote boundary. The second half defines the MCP tool
//! contracts; each of those is annotated with `JsonSchema` for automatic
//! schema generation.

use std::collections::BTreeSet;

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Message flag
///
/// System flags the client cares about plus free-form keywords. `Flagged`
/// is what the UI calls "starred".
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Keyword(String),
}

impl Flag {
    /// IMAP flag atom used in `STORE` commands
    pub fn imap_atom(&self) -> String {
        match self {
            Self::Seen => "\\Seen".to_owned(),
            Self::Answered => "\\Answered".to_owned(),
            Self::Flagged => "\\Flagged".to_owned(),
            Self::Deleted => "\\Deleted".to_owned(),
            Self::Draft => "\\Draft".to_owned(),
            Self::Keyword(k) => k.clone(),
        }
    }
}

/// Parsed envelope headers of a cached message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// Subject header
    pub subject: Option<String>,
    /// From header
    pub from: Option<String>,
    /// To header
    pub to: Option<String>,
    /// Cc header
    pub cc: Option<String>,
    /// Date header as sent
    pub date: Option<String>,
    /// Date header as a Unix timestamp, when parseable
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Header fields searched by the textual query filter
    pub fn searchable_fields(&self) -> impl Iterator<Item = &str> {
        [&self.subject, &self.from, &self.to, &self.cc]
            .into_iter()
            .filter_map(|v| v.as_deref())
    }
}

/// Cached message summary
///
/// Raw content is never stored here; parts and texts are resolved on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Remote UID, unique within (account, folder, validity epoch)
    pub uid: u32,
    /// Envelope headers
    pub envelope: Envelope,
    /// Current flag set
    pub flags: BTreeSet<Flag>,
    /// RFC822 size in bytes, if reported
    pub size: Option<u32>,
}

impl Message {
    pub fn is_starred(&self) -> bool {
        self.flags.contains(&Flag::Flagged)
    }

    pub fn is_read(&self) -> bool {
        self.flags.contains(&Flag::Seen)
    }
}

/// Identity of a folder: (account, folder path)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FolderKey {
    pub account_id: String,
    pub folder: String,
}

impl FolderKey {
    pub fn new(account_id: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            folder: folder.into(),
        }
    }
}

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Message summary as returned to callers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageSummary {
    /// Account identifier
    pub account_id: String,
    /// Folder containing this message
    pub folder: String,
    /// Folder UIDVALIDITY the UID belongs to
    pub uid_validity: Option<u32>,
    /// Message UID within folder
    pub uid: u32,
    /// URI reference to the message
    pub message_uri: String,
    /// Envelope headers
    pub envelope: Envelope,
    /// Flags (e.g., `seen`, `flagged`)
    pub flags: Vec<Flag>,
    /// Whether `\Seen` is set
    pub read: bool,
    /// Whether `\Flagged` is set
    pub starred: bool,
    /// RFC822 size in bytes
    pub size: Option<u32>,
}

impl MessageSummary {
    pub fn from_message(key: &FolderKey, uid_validity: Option<u32>, message: &Message) -> Self {
        Self {
            account_id: key.account_id.clone(),
            folder: key.folder.clone(),
            uid_validity,
            uid: message.uid,
            message_uri: build_message_uri(&key.account_id, &key.folder, message.uid),
            envelope: message.envelope.clone(),
            flags: message.flags.iter().cloned().collect(),
            read: message.is_read(),
            starred: message.is_starred(),
            size: message.size,
        }
    }
}

/// Per-folder metadata (remote counts, cache state, sync cursor)
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FolderMeta {
    /// Account identifier
    pub account_id: String,
    /// Folder path
    pub folder: String,
    /// Last observed UIDVALIDITY
    pub uid_validity: Option<u32>,
    /// Last known remote message count
    pub remote_total: Option<usize>,
    /// Last known remote unread count
    pub remote_unread: Option<usize>,
    /// Messages currently cached
    pub cached: usize,
    /// Oldest cached UID; remote history at or above it is locally known
    pub sync_cursor: Option<u32>,
    /// Whether the whole remote history is cached
    pub history_complete: bool,
    /// Set after an ambiguous mutation or an observed validity change
    pub needs_reconcile: bool,
    /// RFC 3339 time of the last successful remote merge
    pub last_synced_utc: Option<String>,
}

/// One page of a folder view, returned by `mail_get_batch`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchPage {
    /// Messages of this page, newest first
    pub messages: Vec<MessageSummary>,
    /// Messages matching the query (remote total when unfiltered)
    pub total: usize,
    /// Whether another call may return more messages
    pub has_more: bool,
    /// Messages served through this window so far, including this page
    pub window_size: usize,
    /// Folder state after serving the page
    pub folder_meta: FolderMeta,
}

/// Result of a reconciliation sync, returned by `mail_sync`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncOutcome {
    /// Messages that appeared remotely (filtered by the query), newest first
    pub new_messages: Vec<MessageSummary>,
    /// UIDs that disappeared remotely and were dropped from the cache
    pub deleted_uids: Vec<u32>,
    /// Whether the validity token changed and the cache was rebuilt
    pub invalidated: bool,
    /// Folder state after the merge
    pub meta: FolderMeta,
}

/// Result of a move or copy
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TransferReport {
    pub account_id: String,
    pub folder: String,
    pub new_folder: String,
    /// UIDs forwarded to the remote
    pub uids: Vec<u32>,
    /// Source cache entries dropped (always zero for copy)
    pub removed_from_cache: usize,
    /// Destination cache entries inserted from reported new UIDs
    pub inserted_into_destination: usize,
}

/// Result of star/unstar
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FlagReport {
    pub account_id: String,
    pub folder: String,
    pub uids: Vec<u32>,
    pub starred: bool,
    /// Cached copies updated (absent UIDs are not an error)
    pub updated_in_cache: usize,
}

/// Folders of one account with their metadata
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountFolders {
    pub account_id: String,
    pub folders: Vec<FolderMeta>,
}

/// Listing across all configured accounts, returned by `mail_get_folders`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FolderListing {
    pub accounts: Vec<AccountFolders>,
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentInfo {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`, `image/jpeg`)
    pub content_type: String,
    /// Decoded size in bytes
    pub size_bytes: usize,
    /// IMAP part number (e.g., `2`, `1.2`)
    pub part_number: String,
}

/// Text bodies of one message, returned by `mail_get_texts`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageText {
    /// Message UID within folder
    pub uid: u32,
    /// Plain text body (derived from HTML when no text part exists)
    pub text: Option<String>,
    /// Sanitized HTML body
    pub html: Option<String>,
    /// Attachment parts that can be fetched with `mail_get_part`
    pub attachments: Vec<AttachmentInfo>,
}

/// Input: get a batch of messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetBatchInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Folder path (e.g., `INBOX`, `Archive`)
    pub folder: String,
    /// Case-insensitive keyword filter over subject and participants
    pub query: Option<String>,
    /// Discard the current batch window and start from the newest messages
    #[serde(default)]
    pub reset: bool,
    /// Messages per batch (server default when omitted or zero)
    pub batch_size: Option<usize>,
}

/// Input: reconcile a folder with the remote
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SyncInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Folder path
    pub folder: String,
    /// Filter applied to the returned new messages
    pub query: Option<String>,
}

/// Input: get text bodies for a list of UIDs
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetTextsInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Folder path
    pub folder: String,
    /// Message UIDs (non-empty)
    pub uids: Vec<u32>,
}

/// Input: get one MIME part of a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetPartInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Folder path
    pub folder: String,
    /// Message UID
    pub uid: u32,
    /// IMAP part number (e.g., `2` or `1.2`)
    pub part_number: String,
}

/// Input: move or copy messages to another folder of the same account
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TransferInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Source folder path
    pub folder: String,
    /// Message UIDs (non-empty)
    pub message_uids: Vec<u32>,
    /// Destination folder path
    pub new_folder: String,
}

/// Input: star or unstar messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct StarInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Folder path
    pub folder: String,
    /// Message UIDs (non-empty)
    pub message_uids: Vec<u32>,
}

/// Default value for `account_id` field
pub fn default_account_id() -> String {
    "default".to_owned()
}

/// Build message URI for display
pub fn build_message_uri(account_id: &str, folder: &str, uid: u32) -> String {
    format!(
        "imap://{}/folder/{}/message/{}",
        account_id,
        urlencoding::encode(folder),
        uid
    )
}
