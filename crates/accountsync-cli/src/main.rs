//! accountsync CLI
//!
//! Thin wrapper around accountsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show the active account and storage information
//! accountsync info
//!
//! # Register the active anonymous account
//! accountsync account sign-up "Ada Lovelace" --avatar ada.png
//!
//! # Print a token for logging in on another device
//! accountsync account token
//!
//! # Check a token, then log in with it
//! accountsync account check "account:Ada/<id>"
//! accountsync account login "account:Ada/<id>"
//!
//! # Link an AT Protocol account (app password)
//! accountsync account link ada.bsky.social --service https://bsky.social --app-password xxxx-xxxx
//!
//! # Replace the active account with a fresh anonymous one
//! accountsync account logout
//! ```
//!
//! Settings are read from `<data-dir>/config.json` when present.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use accountsync_core::token::{self, AccountToken};
use accountsync_core::{
    AccountConfig, AccountManager, AccountSnapshot, ContactDoc, DocumentId, FileDoc, LoginCheck,
    Storage, SyncOutcome, WebSocketChannel, XrpcProvider,
};

/// Name of the database file inside the data directory
const DATABASE_FILE: &str = "accountsync.redb";

/// Name of the optional settings file inside the data directory
const CONFIG_FILE: &str = "config.json";

/// accountsync - portable identities over Automerge documents
#[derive(Parser)]
#[command(name = "accountsync")]
#[command(version = "0.1.0")]
#[command(about = "accountsync - portable identities over Automerge documents")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.accountsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show account and storage information
    Info,

    /// Account management
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Encode and decode account tokens without touching storage
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Show the active account
    Show,
    /// Print the token of the active account
    Token,
    /// Register the active anonymous account
    SignUp {
        /// Display name
        name: String,
        /// Avatar image file
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
    /// Log in with an account token
    Login {
        /// Account token (account:<label>/<id>)
        token: String,
    },
    /// Check whether a token can be used to log in
    Check {
        /// Account token (account:<label>/<id>)
        token: String,
    },
    /// Replace the active account with a new anonymous one
    Logout,
    /// Link an AT Protocol account and negotiate a personal sync server
    Link {
        /// Handle or DID
        handle: String,
        /// XRPC service URL of the account's PDS
        #[arg(long, default_value = "https://bsky.social")]
        service: String,
        /// App password for the account
        #[arg(long, env = "ACCOUNTSYNC_APP_PASSWORD")]
        app_password: String,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Build a token from a document id and a label
    Encode {
        /// Identity document id (base58)
        id: String,
        /// Display label
        label: String,
    },
    /// Decode a token
    Decode {
        /// Account token (account:<label>/<id>)
        token: String,
    },
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.accountsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".accountsync")
        .join("data")
}

/// Load `config.json` from the data directory, falling back to defaults
fn load_config(data_dir: &Path) -> Result<AccountConfig> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(AccountConfig::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config in {}", path.display()))
}

/// Open storage and build the account manager for this process
fn open_manager(data_dir: &Path, config: AccountConfig) -> Result<AccountManager> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let storage = Storage::new(data_dir.join(DATABASE_FILE))?;
    let manager = AccountManager::open(storage, config);
    debug!(data_dir = %data_dir.display(), origin = %manager.repo().origin(), "Opened storage");
    Ok(manager)
}

fn print_account(snapshot: &AccountSnapshot) {
    println!("Account:");
    println!("  URL: {}", snapshot.account_url);
    println!("  Contact: {}", snapshot.contact_url);
    if let Some(folder) = &snapshot.account.root_folder_url {
        println!("  Root folder: {}", folder);
    }
    match &snapshot.contact {
        ContactDoc::Anonymous => println!("  Status: Anonymous"),
        ContactDoc::Registered(contact) => {
            println!("  Status: Registered");
            println!("  Name: {}", contact.name);
            if let Some(avatar) = &contact.avatar_url {
                println!("  Avatar: {}", avatar);
            }
        }
    }
    if let Some(did) = &snapshot.account.atproto_did {
        println!();
        println!("Linked identity:");
        println!("  DID: {}", did);
        if let Some(handle) = &snapshot.account.atproto_handle {
            println!("  Handle: {}", handle);
        }
        println!(
            "  Sync token: {}",
            if snapshot.account.pss_jwt.is_some() { "present" } else { "none" }
        );
        if let Some(millis) = snapshot.account.last_online_sync {
            if let Some(at) = chrono::DateTime::from_timestamp_millis(millis) {
                println!("  Last online sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
    }
}

fn print_sync_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Synced {
            host,
            root_changed,
            channel_attached,
        } => {
            println!("Personal sync server: {}", host);
            if *root_changed {
                println!("  Switched to the account's canonical identity");
            }
            if !channel_attached {
                println!("  Realtime channel not attached");
            }
        }
        SyncOutcome::Unavailable(reason) => {
            println!("Personal sync server unavailable: {}", reason);
        }
    }
}

fn run_token(action: &TokenAction) -> Result<()> {
    match action {
        TokenAction::Encode { id, label } => {
            let id = DocumentId::from_base58(id)
                .map_err(|e| anyhow::anyhow!("Invalid document id '{}': {}", id, e))?;
            println!("{}", token::encode(id, label));
        }
        TokenAction::Decode { token } => {
            let token = AccountToken::decode(token)?;
            println!("Label: {}", token.label());
            println!("ID: {}", token.document_id());
            println!("URL: {}", token.url());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    // Token commands never touch storage
    if let Commands::Token { action } = &cli.command {
        return run_token(action);
    }

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(&data_dir)?;
    let mut manager = open_manager(&data_dir, config.clone())?;

    // Linking needs the provider wired in before the account is loaded
    let channel = match &cli.command {
        Commands::Account {
            action:
                AccountAction::Link {
                    service,
                    app_password,
                    ..
                },
        } => {
            let provider = XrpcProvider::from_service_url(service, app_password.clone())?;
            let channel = WebSocketChannel::new(config.realtime_scheme.clone());
            manager = manager
                .with_provider(Arc::new(provider))
                .with_realtime_channel(channel.clone());
            Some(channel)
        }
        _ => None,
    };

    let snapshot = manager.load().await?;

    match cli.command {
        Commands::Info => {
            println!("accountsync v0.1.0");
            println!();
            print_account(&snapshot);
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Documents: {}", manager.repo().storage().document_count()?);
        }

        Commands::Account { action } => match action {
            AccountAction::Show => print_account(&snapshot),

            AccountAction::Token => println!("{}", manager.token()?),

            AccountAction::SignUp { name, avatar } => {
                let avatar = match avatar {
                    Some(path) => {
                        let contents = tokio::fs::read(&path)
                            .await
                            .with_context(|| format!("Failed to read avatar {}", path.display()))?;
                        let extension = path
                            .extension()
                            .and_then(|e| e.to_str())
                            .unwrap_or_default()
                            .to_lowercase();
                        Some(
                            FileDoc::new(FileDoc::content_type_for_extension(&extension), contents)
                                .with_extension(extension),
                        )
                    }
                    None => None,
                };
                let snapshot = manager.sign_up(&name, avatar)?;
                println!("Signed up.");
                print_account(&snapshot);
            }

            AccountAction::Login { token } => match manager.check_login(&token).await {
                LoginCheck::Ready { url, name } => {
                    manager.log_in(&url).await?;
                    println!("Logged in as {}.", name);
                    println!("  URL: {}", url);
                }
                LoginCheck::Anonymous { url } => {
                    anyhow::bail!("Account {} is anonymous and can't be logged in to", url)
                }
                LoginCheck::NotFound => anyhow::bail!("Account not found"),
                LoginCheck::Malformed(reason) => anyhow::bail!("Invalid token: {}", reason),
            },

            AccountAction::Check { token } => match manager.check_login(&token).await {
                LoginCheck::Ready { url, name } => {
                    println!("Ready: {} ({})", name, url);
                }
                LoginCheck::Anonymous { url } => {
                    println!("Anonymous: {} can't be logged in to", url);
                }
                LoginCheck::NotFound => println!("Not found"),
                LoginCheck::Malformed(reason) => println!("Malformed: {}", reason),
            },

            AccountAction::Logout => {
                let previous = snapshot.account_url;
                let snapshot = manager.log_out()?;
                println!("Logged out of {}.", previous);
                print_account(&snapshot);
            }

            AccountAction::Link { handle, .. } => {
                let outcome = manager.link_atproto(&handle).await?;
                println!("Linked {} ({}).", outcome.handle, outcome.did);
                print_sync_outcome(&outcome.sync);
                if let Some(channel) = channel {
                    channel.close_all();
                }
            }
        },

        Commands::Token { action } => run_token(&action)?,
    }

    Ok(())
}
