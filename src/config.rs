//! Configuration module for mail accounts and engine settings
//!
//! All configuration is loaded from environment variables following the pattern
//! `MAIL_SYNC_<SEGMENT>_<KEY>`. Account segments are discovered by scanning for
//! `MAIL_SYNC_*_HOST` variables.

use std::collections::BTreeMap;
use std::env;
use std::env::VarError;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Mail account configuration
///
/// Holds connection details and credentials for a single account. The cache
/// engine only ever refers to an account by `account_id`; the rest is
/// consumed by the IMAP client. Passwords are stored using `SecretString` to
/// prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account identifier (lowercase, used as default `account_id` parameter)
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (currently enforced to `true`)
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
}

/// Server-wide configuration
///
/// Wraps all account configs, remote timeouts, retry policy and cache sizing.
/// Shared via `Arc` between the engine components and the MCP handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// All configured accounts, keyed by `account_id`
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Whether mutating tools (move, copy, star, unstar) are enabled
    pub write_enabled: bool,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Batch size used when a request omits one or sends an invalid one
    pub default_batch_size: usize,
    /// Upper bound applied to requested batch sizes
    pub max_batch_size: usize,
    /// Total attempts for a remote call failing with a connection error
    pub retry_attempts: u32,
    /// Initial backoff between attempts, doubled after each failure
    pub retry_backoff_ms: u64,
    /// Idle lifetime of a batch window in seconds
    pub window_ttl_seconds: u64,
    /// Maximum batch windows retained per folder
    pub window_max_entries: usize,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers accounts by scanning for `MAIL_SYNC_*_HOST` patterns.
    /// If no accounts are explicitly defined, a `default` account is required
    /// via `MAIL_SYNC_DEFAULT_HOST`, `MAIL_SYNC_DEFAULT_USER`, and
    /// `MAIL_SYNC_DEFAULT_PASS`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_SYNC_DEFAULT_HOST=imap.gmail.com
    /// MAIL_SYNC_DEFAULT_USER=user@gmail.com
    /// MAIL_SYNC_DEFAULT_PASS=app-password
    /// MAIL_SYNC_WORK_HOST=outlook.office365.com
    /// MAIL_SYNC_WORK_USER=user@company.com
    /// MAIL_SYNC_WORK_PASS=work-pass
    /// MAIL_SYNC_DEFAULT_BATCH_SIZE=50
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let account_pattern = Regex::new(r"^MAIL_SYNC_([A-Z0-9_]+)_HOST$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut account_segments: Vec<String> = env::vars()
            .filter_map(|(k, _)| {
                account_pattern
                    .captures(&k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();

        if account_segments.is_empty() {
            account_segments.push("DEFAULT".to_owned());
        }

        account_segments.sort();
        account_segments.dedup();

        let mut accounts = BTreeMap::new();
        for seg in account_segments {
            let account = load_account(&seg)?;
            accounts.insert(account.account_id.clone(), account);
        }

        let default_batch_size = parse_env("MAIL_SYNC_DEFAULT_BATCH_SIZE", 50)?;
        let max_batch_size = parse_env("MAIL_SYNC_MAX_BATCH_SIZE", 500)?;
        if default_batch_size == 0 || default_batch_size > max_batch_size {
            return Err(AppError::InvalidInput(
                "MAIL_SYNC_DEFAULT_BATCH_SIZE must be in range 1..MAIL_SYNC_MAX_BATCH_SIZE"
                    .to_owned(),
            ));
        }
        let retry_attempts = parse_env("MAIL_SYNC_RETRY_ATTEMPTS", 3)?;
        if retry_attempts == 0 {
            return Err(AppError::InvalidInput(
                "MAIL_SYNC_RETRY_ATTEMPTS must be at least 1".to_owned(),
            ));
        }

        Ok(Self {
            accounts,
            write_enabled: parse_bool_env("MAIL_SYNC_WRITE_ENABLED", true)?,
            connect_timeout_ms: parse_env("MAIL_SYNC_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_env("MAIL_SYNC_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_env("MAIL_SYNC_SOCKET_TIMEOUT_MS", 300_000)?,
            default_batch_size,
            max_batch_size,
            retry_attempts,
            retry_backoff_ms: parse_env("MAIL_SYNC_RETRY_BACKOFF_MS", 250)?,
            window_ttl_seconds: parse_env("MAIL_SYNC_WINDOW_TTL_SECONDS", 1_800)?,
            window_max_entries: parse_env("MAIL_SYNC_WINDOW_MAX_ENTRIES", 256)?,
        })
    }

    /// Get account configuration by ID
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account ID is not configured.
    pub fn get_account(&self, account_id: &str) -> AppResult<&AccountConfig> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| AppError::NotFound(format!("account '{account_id}' is not configured")))
    }

    /// Resolve a requested batch size
    ///
    /// Sizes outside `1..=max_batch_size` are invalid and fall back to
    /// `default_batch_size`, as do absent ones.
    pub fn resolve_batch_size(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(size) if (1..=self.max_batch_size).contains(&size) => size,
            _ => self.default_batch_size,
        }
    }

    /// Initial backoff between retry attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Load a single account configuration from environment
///
/// Reads `MAIL_SYNC_<SEGMENT>_HOST`, `_USER`, `_PASS`, `_PORT`, and `_SECURE`.
/// Normalizes the segment name to lowercase for `account_id` (except `DEFAULT`
/// becomes `default`).
fn load_account(segment: &str) -> AppResult<AccountConfig> {
    let prefix = format!("MAIL_SYNC_{}_", sanitize_segment(segment));
    let host = required_env(&format!("{prefix}HOST"))?;
    let user = required_env(&format!("{prefix}USER"))?;
    let pass = required_env(&format!("{prefix}PASS"))?;

    Ok(AccountConfig {
        account_id: if segment == "DEFAULT" {
            "default".to_owned()
        } else {
            segment.to_ascii_lowercase()
        },
        host,
        port: parse_env(&format!("{prefix}PORT"), 993)?,
        secure: parse_bool_env(&format!("{prefix}SECURE"), true)?,
        user,
        pass: SecretString::new(pass.into()),
    })
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
///
/// Non-alphanumeric characters are replaced with underscores, and leading/
/// trailing underscores are trimmed.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a numeric environment variable, returning `default` if unset
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse as `T`.
fn parse_env<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!(
                "invalid {} environment variable {key}: '{v}'",
                std::any::type_name::<T>()
            ))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        accounts: BTreeMap::from([
            (
                "default".to_owned(),
                AccountConfig {
                    account_id: "default".to_owned(),
                    host: "imap.example.com".to_owned(),
                    port: 993,
                    secure: true,
                    user: "user@example.com".to_owned(),
                    pass: SecretString::new("secret".into()),
                },
            ),
            (
                "work".to_owned(),
                AccountConfig {
                    account_id: "work".to_owned(),
                    host: "imap.work.example.com".to_owned(),
                    port: 993,
                    secure: true,
                    user: "me@work.example.com".to_owned(),
                    pass: SecretString::new("secret".into()),
                },
            ),
        ]),
        write_enabled: true,
        connect_timeout_ms: 1_000,
        greeting_timeout_ms: 1_000,
        socket_timeout_ms: 1_000,
        default_batch_size: 10,
        max_batch_size: 100,
        retry_attempts: 3,
        retry_backoff_ms: 1,
        window_ttl_seconds: 600,
        window_max_entries: 16,
    }
}
