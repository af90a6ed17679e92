//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! [`ImapRemote`] implementation of [`RemoteMailbox`]. All network calls are
//! enforced to use TLS, and timeouts are derived from server config.
//!
//! Error mapping follows the remote contract: `NO`/`BAD` responses are
//! `RemoteRejected`; timeouts and transport failures are `Connection` until a
//! mutating command has been sent, and `AmbiguousOutcome` after.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, Flag as ImapFlag, Mailbox, Name, NameAttribute};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use utf7_imap::{decode_utf7_imap, encode_utf7_imap};

use crate::config::{AccountConfig, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::mime;
use crate::models::{Envelope, Flag, Message};
use crate::remote::{FolderStatus, RemoteMailbox, TransferOutcome};

/// Type alias for authenticated IMAP session over TLS
///
/// Wraps the TLS stream type to simplify signatures throughout the codebase.
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Summary fetch query; `BODY.PEEK` never sets `\Seen`
const SUMMARY_QUERY: &str =
    "(UID FLAGS RFC822.SIZE BODY.PEEK[HEADER.FIELDS (DATE FROM TO CC SUBJECT)])";

/// Maximum UIDs per summary `UID FETCH`
const FETCH_CHUNK: usize = 200;

/// Get socket timeout duration from server config
///
/// Helper to avoid repeatedly accessing the config field.
fn socket_timeout(server: &ServerConfig) -> Duration {
    Duration::from_millis(server.socket_timeout_ms)
}

/// Map an `async-imap` error raised before any mutation was sent
fn classify(err: ImapError, what: &str) -> AppError {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => {
            AppError::RemoteRejected(format!("{what} rejected: {msg}"))
        }
        other => AppError::Connection(format!("{what} failed: {other}")),
    }
}

/// Map an `async-imap` error raised after a mutating command was sent
fn classify_dispatched(err: ImapError, what: &str) -> AppError {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => {
            AppError::RemoteRejected(format!("{what} rejected: {msg}"))
        }
        other => AppError::AmbiguousOutcome(format!("{what} result lost: {other}")),
    }
}

/// Run a read-only protocol step under a timeout
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, ImapError>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Connection(format!("{what} timed out")))
        .and_then(|r| r.map_err(|e| classify(e, what)))
}

/// Run a mutating protocol step under a timeout
async fn dispatched<T, F>(limit: Duration, what: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, ImapError>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::AmbiguousOutcome(format!("{what} timed out after dispatch")))
        .and_then(|r| r.map_err(|e| classify_dispatched(e, what)))
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with system root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Security
///
/// Rejects insecure connections (`secure: false`) to prevent password exposure.
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Connection` if any connection phase fails or times out
/// - `RemoteRejected` if authentication fails
pub async fn connect_authenticated(
    server: &ServerConfig,
    account: &AccountConfig,
) -> AppResult<ImapSession> {
    if !account.secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set MAIL_SYNC_<ACCOUNT>_SECURE=true".to_owned(),
        ));
    }

    let connect_duration = Duration::from_millis(server.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(server.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Connection("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Connection("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Connection("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}"))))?;
    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    timeout(greeting_duration, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Connection("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| match e {
                ImapError::No(msg) | ImapError::Bad(msg) => {
                    AppError::RemoteRejected(format!("authentication failed: {msg}"))
                }
                other => AppError::Connection(format!("IMAP login failed: {other}")),
            })
        })
}

/// Query server capabilities
///
/// Used to detect support for `MOVE`.
pub async fn capabilities(
    server: &ServerConfig,
    session: &mut ImapSession,
) -> AppResult<async_imap::types::Capabilities> {
    bounded(socket_timeout(server), "CAPABILITY", session.capabilities()).await
}

/// List all visible mailboxes/folders
pub async fn list_all_mailboxes(
    server: &ServerConfig,
    session: &mut ImapSession,
) -> AppResult<Vec<Name>> {
    let stream = bounded(socket_timeout(server), "LIST", session.list(None, Some("*"))).await?;
    bounded(socket_timeout(server), "LIST stream", stream.try_collect::<Vec<_>>()).await
}

/// Select mailbox in read-only mode
///
/// Uses `EXAMINE` so reads never change flags.
pub async fn select_mailbox_readonly(
    server: &ServerConfig,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<Mailbox> {
    let encoded = encode_utf7_imap(mailbox.to_owned());
    bounded(socket_timeout(server), "EXAMINE", session.examine(&encoded)).await
}

/// Select mailbox in read-write mode
pub async fn select_mailbox_readwrite(
    server: &ServerConfig,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<Mailbox> {
    let encoded = encode_utf7_imap(mailbox.to_owned());
    bounded(socket_timeout(server), "SELECT", session.select(&encoded)).await
}

/// `STATUS` of a mailbox without selecting it
pub async fn mailbox_status(
    server: &ServerConfig,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<FolderStatus> {
    let encoded = encode_utf7_imap(mailbox.to_owned());
    let status = bounded(
        socket_timeout(server),
        "STATUS",
        session.status(&encoded, "(MESSAGES UNSEEN UIDVALIDITY UIDNEXT)"),
    )
    .await?;
    let uid_validity = status
        .uid_validity
        .ok_or_else(|| AppError::Internal(format!("mailbox '{mailbox}' missing UIDVALIDITY")))?;
    Ok(FolderStatus {
        uid_validity,
        total: status.exists as usize,
        unread: status.unseen.map(|n| n as usize),
        uid_next: status.uid_next,
    })
}

/// Run `UID SEARCH` and return the matching UIDs
pub async fn uid_search(
    server: &ServerConfig,
    session: &mut ImapSession,
    query: &str,
) -> AppResult<BTreeSet<u32>> {
    let set = bounded(socket_timeout(server), "UID SEARCH", session.uid_search(query)).await?;
    Ok(set.into_iter().collect())
}

/// Run `UID FETCH` over a UID set and collect every response
pub async fn uid_fetch(
    server: &ServerConfig,
    session: &mut ImapSession,
    uid_set: &str,
    query: &str,
) -> AppResult<Vec<Fetch>> {
    let stream = bounded(
        socket_timeout(server),
        "UID FETCH",
        session.uid_fetch(uid_set, query),
    )
    .await?;
    bounded(socket_timeout(server), "UID FETCH stream", stream.try_collect()).await
}

/// Store flags on a UID set
///
/// Runs `UID STORE` with a flag query string. Use `+FLAGS.SILENT` to add
/// flags or `-FLAGS.SILENT` to remove flags.
pub async fn uid_store(
    server: &ServerConfig,
    session: &mut ImapSession,
    uid_set: &str,
    query: &str,
) -> AppResult<()> {
    let stream = dispatched(
        socket_timeout(server),
        "UID STORE",
        session.uid_store(uid_set, query),
    )
    .await?;
    let _: Vec<Fetch> =
        dispatched(socket_timeout(server), "UID STORE stream", stream.try_collect()).await?;
    Ok(())
}

/// Copy messages to another mailbox
pub async fn uid_copy(
    server: &ServerConfig,
    session: &mut ImapSession,
    uid_set: &str,
    mailbox: &str,
) -> AppResult<()> {
    let encoded = encode_utf7_imap(mailbox.to_owned());
    dispatched(
        socket_timeout(server),
        "UID COPY",
        session.uid_copy(uid_set, &encoded),
    )
    .await
}

/// Move messages to another mailbox
///
/// Runs `UID MOVE` (RFC 6851); callers check the capability first.
pub async fn uid_move(
    server: &ServerConfig,
    session: &mut ImapSession,
    uid_set: &str,
    mailbox: &str,
) -> AppResult<()> {
    let encoded = encode_utf7_imap(mailbox.to_owned());
    dispatched(
        socket_timeout(server),
        "UID MOVE",
        session.uid_mv(uid_set, &encoded),
    )
    .await
}

/// Permanently remove messages marked as `\Deleted`
pub async fn uid_expunge(
    server: &ServerConfig,
    session: &mut ImapSession,
    uid_set: &str,
) -> AppResult<()> {
    let stream = dispatched(
        socket_timeout(server),
        "UID EXPUNGE",
        session.uid_expunge(uid_set),
    )
    .await?;
    let _: Vec<u32> =
        dispatched(socket_timeout(server), "UID EXPUNGE stream", stream.try_collect()).await?;
    Ok(())
}

/// Expunge every message marked `\Deleted` in the selected mailbox
///
/// Fallback for servers without `UIDPLUS`, where `UID EXPUNGE` is unavailable.
pub async fn expunge(server: &ServerConfig, session: &mut ImapSession) -> AppResult<()> {
    let stream = dispatched(socket_timeout(server), "EXPUNGE", session.expunge()).await?;
    let _: Vec<u32> =
        dispatched(socket_timeout(server), "EXPUNGE stream", stream.try_collect()).await?;
    Ok(())
}

/// Remove already copied messages from the selected source mailbox
async fn remove_copied(
    server: &ServerConfig,
    session: &mut ImapSession,
    uid_set: &str,
    uidplus: bool,
) -> AppResult<()> {
    uid_store(server, session, uid_set, "+FLAGS.SILENT (\\Deleted)").await?;
    if uidplus {
        uid_expunge(server, session, uid_set).await
    } else {
        expunge(server, session).await
    }
}

/// Once COPY succeeded the destination holds the messages, so any later
/// failure leaves both folders in an unknown state
fn copied_but_not_removed(err: AppError) -> AppError {
    match err {
        AppError::AmbiguousOutcome(msg) => AppError::AmbiguousOutcome(msg),
        other => AppError::AmbiguousOutcome(format!(
            "messages copied but not removed from source: {other}"
        )),
    }
}

/// Close the session, ignoring failures
async fn logout(server: &ServerConfig, mut session: ImapSession) {
    if let Ok(Err(e)) = timeout(socket_timeout(server), session.logout()).await {
        debug!(error = %e, "logout failed");
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn convert_flag(flag: &ImapFlag<'_>) -> Option<Flag> {
    match flag {
        ImapFlag::Seen => Some(Flag::Seen),
        ImapFlag::Answered => Some(Flag::Answered),
        ImapFlag::Flagged => Some(Flag::Flagged),
        ImapFlag::Deleted => Some(Flag::Deleted),
        ImapFlag::Draft => Some(Flag::Draft),
        ImapFlag::Custom(name) => Some(Flag::Keyword(name.to_string())),
        _ => None,
    }
}

/// Build a cached message from a summary fetch response
fn summary_from_fetch(fetch: &Fetch) -> Option<Message> {
    let uid = fetch.uid?;
    let envelope = match fetch.header().or_else(|| fetch.body()) {
        Some(bytes) => mime::envelope_from_headers(bytes).unwrap_or_else(|e| {
            warn!(uid, error = %e, "unparseable headers");
            Envelope::default()
        }),
        None => Envelope::default(),
    };
    Some(Message {
        uid,
        envelope,
        flags: fetch.flags().filter_map(|f| convert_flag(&f)).collect(),
        size: fetch.size,
    })
}

/// Remote mailbox backed by one IMAP connection per call
///
/// Every operation opens an authenticated session, runs its commands and
/// logs out. Retries are left to [`crate::remote::RetryingRemote`].
pub struct ImapRemote {
    config: Arc<ServerConfig>,
}

impl ImapRemote {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    async fn connect(&self, account_id: &str) -> AppResult<ImapSession> {
        let account = self.config.get_account(account_id)?;
        connect_authenticated(&self.config, account).await
    }

    async fn transfer(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
        remove_source: bool,
    ) -> AppResult<TransferOutcome> {
        let config = &self.config;
        let mut session = self.connect(account_id).await?;
        let set = uid_set(uids);
        let result = async {
            select_mailbox_readwrite(config, &mut session, from_folder).await?;
            if !remove_source {
                return uid_copy(config, &mut session, &set, to_folder).await;
            }
            let caps = capabilities(config, &mut session).await?;
            if caps.has_str("MOVE") {
                return uid_move(config, &mut session, &set, to_folder).await;
            }
            uid_copy(config, &mut session, &set, to_folder).await?;
            remove_copied(config, &mut session, &set, caps.has_str("UIDPLUS"))
                .await
                .map_err(copied_but_not_removed)
        }
        .await;
        logout(config, session).await;
        result?;
        debug!(
            account = account_id,
            from = from_folder,
            to = to_folder,
            count = uids.len(),
            remove_source,
            "transfer done"
        );
        // async-imap does not surface COPYUID, so new UIDs are unknown
        Ok(TransferOutcome::default())
    }
}

#[async_trait]
impl RemoteMailbox for ImapRemote {
    async fn list_folders(&self, account_id: &str) -> AppResult<Vec<String>> {
        let mut session = self.connect(account_id).await?;
        let result = list_all_mailboxes(&self.config, &mut session).await;
        logout(&self.config, session).await;
        Ok(result?
            .iter()
            .filter(|name| !name.attributes().contains(&NameAttribute::NoSelect))
            .map(|name| decode_utf7_imap(name.name().to_owned()))
            .collect())
    }

    async fn folder_status(&self, account_id: &str, folder: &str) -> AppResult<FolderStatus> {
        let mut session = self.connect(account_id).await?;
        let result = mailbox_status(&self.config, &mut session, folder).await;
        logout(&self.config, session).await;
        result
    }

    async fn folder_statuses(
        &self,
        account_id: &str,
        folders: &[String],
    ) -> AppResult<Vec<(String, FolderStatus)>> {
        let mut session = self.connect(account_id).await?;
        let mut out = Vec::with_capacity(folders.len());
        let mut failure = None;
        for folder in folders {
            match mailbox_status(&self.config, &mut session, folder).await {
                Ok(status) => out.push((folder.clone(), status)),
                Err(AppError::RemoteRejected(msg)) => {
                    warn!(account = account_id, folder = %folder, error = %msg, "folder status rejected");
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        logout(&self.config, session).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    async fn list_uids(
        &self,
        account_id: &str,
        folder: &str,
        since: Option<u32>,
    ) -> AppResult<BTreeSet<u32>> {
        let config = &self.config;
        let mut session = self.connect(account_id).await?;
        let query = since.map_or_else(|| "ALL".to_owned(), |s| format!("UID {s}:*"));
        let result = async {
            select_mailbox_readonly(config, &mut session, folder).await?;
            uid_search(config, &mut session, &query).await
        }
        .await;
        logout(config, session).await;
        // `n:*` always matches the highest UID, even when it is below `n`
        Ok(result?
            .into_iter()
            .filter(|uid| since.is_none_or(|s| *uid >= s))
            .collect())
    }

    async fn fetch_summaries(
        &self,
        account_id: &str,
        folder: &str,
        uids: &[u32],
    ) -> AppResult<Vec<Message>> {
        let config = &self.config;
        let mut session = self.connect(account_id).await?;
        let result = async {
            select_mailbox_readonly(config, &mut session, folder).await?;
            let mut messages = Vec::with_capacity(uids.len());
            for chunk in uids.chunks(FETCH_CHUNK) {
                let fetches = uid_fetch(config, &mut session, &uid_set(chunk), SUMMARY_QUERY).await?;
                messages.extend(fetches.iter().filter_map(summary_from_fetch));
            }
            Ok::<_, AppError>(messages)
        }
        .await;
        logout(config, session).await;
        result
    }

    async fn fetch_raw(&self, account_id: &str, folder: &str, uid: u32) -> AppResult<Vec<u8>> {
        let config = &self.config;
        let mut session = self.connect(account_id).await?;
        let result = async {
            select_mailbox_readonly(config, &mut session, folder).await?;
            uid_fetch(config, &mut session, &uid.to_string(), "(UID BODY.PEEK[])").await
        }
        .await;
        logout(config, session).await;
        result?
            .iter()
            .find(|fetch| fetch.uid == Some(uid))
            .and_then(|fetch| fetch.body())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
    }

    async fn move_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome> {
        self.transfer(account_id, from_folder, uids, to_folder, true)
            .await
    }

    async fn copy_messages(
        &self,
        account_id: &str,
        from_folder: &str,
        uids: &[u32],
        to_folder: &str,
    ) -> AppResult<TransferOutcome> {
        self.transfer(account_id, from_folder, uids, to_folder, false)
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
        let config = &self.config;
        let mut session = self.connect(account_id).await?;
        let query = format!(
            "{}FLAGS.SILENT ({})",
            if value { "+" } else { "-" },
            flag.imap_atom()
        );
        let result = async {
            select_mailbox_readwrite(config, &mut session, folder).await?;
            uid_store(config, &mut session, &uid_set(uids), &query).await
        }
        .await;
        logout(config, session).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use async_imap::error::Error as ImapError;

    use super::{classify, classify_dispatched, copied_but_not_removed, uid_set};
    use crate::errors::AppError;

    #[test]
    fn uid_sets_are_comma_separated() {
        assert_eq!(uid_set(&[3, 1, 9]), "3,1,9");
        assert_eq!(uid_set(&[42]), "42");
    }

    #[test]
    fn no_and_bad_responses_are_rejections() {
        assert!(matches!(
            classify(ImapError::No("no such mailbox".to_owned()), "SELECT"),
            AppError::RemoteRejected(_)
        ));
        assert!(matches!(
            classify_dispatched(ImapError::Bad("syntax".to_owned()), "UID MOVE"),
            AppError::RemoteRejected(_)
        ));
    }

    #[test]
    fn transport_failures_depend_on_dispatch() {
        assert!(matches!(
            classify(ImapError::ConnectionLost, "UID SEARCH"),
            AppError::Connection(_)
        ));
        assert!(matches!(
            classify_dispatched(ImapError::ConnectionLost, "UID MOVE"),
            AppError::AmbiguousOutcome(_)
        ));
    }

    #[test]
    fn failures_after_copy_are_ambiguous() {
        let rejected = AppError::RemoteRejected("UID EXPUNGE rejected: not supported".to_owned());
        let err = copied_but_not_removed(rejected);
        assert!(matches!(err, AppError::AmbiguousOutcome(_)));
        assert!(err.to_string().contains("copied but not removed"));
        assert!(matches!(
            copied_but_not_removed(AppError::AmbiguousOutcome("lost".to_owned())),
            AppError::AmbiguousOutcome(_)
        ));
    }
}
