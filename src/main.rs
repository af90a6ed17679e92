//! mail-sync-mcp-rs: IMAP folder sync and message cache served over MCP stdio
//!
//! Keeps a per-folder cache of message summaries for several IMAP accounts,
//! serves it newest first in batches, reconciles it with the server on
//! demand and applies move, copy and star operations remote-first.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with CLI parsing, env loading and serving
//! - [`config`]: Environment-driven configuration for accounts and sync settings
//! - [`errors`]: Application error model with MCP error mapping
//! - [`store`]: Per-folder message store and keyword query matching
//! - [`pagination`]: Batch windows with TTL and eviction behavior
//! - [`session`]: Folder session: operation lock plus cached state
//! - [`sync`]: Growth and reconciliation sync against the remote
//! - [`mutation`]: Remote-first move, copy and star coordination
//! - [`registry`]: Folder sessions and the cross-account folder listing
//! - [`remote`]: Remote mailbox boundary and the retrying wrapper
//! - [`imap`]: IMAP implementation of the remote boundary
//! - [`mime`]: Message parsing, part lookup, text extraction and sanitization
//! - [`parts`]: On-demand part and text resolution
//! - [`service`]: Caller-facing operations
//! - [`server`]: MCP tool handlers with validation
//! - [`models`]: Domain types and input/output DTOs

mod config;
mod errors;
mod imap;
mod mime;
mod models;
mod mutation;
mod pagination;
mod parts;
mod registry;
mod remote;
mod server;
mod service;
mod session;
mod store;
mod sync;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::imap::ImapRemote;
use crate::parts::MimePartResolver;
use crate::remote::{RemoteMailbox, RetryingRemote};
use crate::service::MailService;

#[derive(Parser, Debug)]
#[command(name = "mail-sync-mcp-rs")]
#[command(about = "IMAP folder sync and message cache served over MCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Serve MCP over stdio (default)
    Serve,
    /// Print the folder listing of every configured account as JSON and exit
    Folders,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and either serves the
/// MCP server over stdio or runs a one-shot folder listing.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_SYNC_DEFAULT_HOST=imap.example.com \
/// MAIL_SYNC_DEFAULT_USER=user@example.com \
/// MAIL_SYNC_DEFAULT_PASS=secret \
/// cargo run -- serve
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(ServerConfig::load_from_env()?);
    let remote: Arc<dyn RemoteMailbox> = Arc::new(RetryingRemote::new(
        ImapRemote::new(config.clone()),
        config.retry_attempts,
        config.retry_backoff(),
    ));
    let parts = Arc::new(MimePartResolver::new(remote.clone()));
    let service = Arc::new(MailService::new(config.clone(), remote, parts));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(accounts = config.accounts.len(), "serving MCP over stdio");
            let running = server::MailSyncServer::new(service).serve(stdio()).await?;
            running.waiting().await?;
        }
        Command::Folders => {
            let listing = service.get_folders().await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}
