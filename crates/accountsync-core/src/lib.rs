//! accountsync Core Library
//!
//! Portable user identities stored as Automerge documents.
//!
//! ## Overview
//!
//! An account is an *identity document* referencing a *contact document* (the
//! public face: anonymous, or registered with a name and avatar) and a root
//! folder. The identity active on a device is named by a single pointer slot
//! in local storage. Because the identity is just a document, moving it to a
//! new device only needs its address, which is handed over as an account
//! token (`account:<label>/<id>`).
//!
//! An identity can be linked to an external AT Protocol account. When that
//! account publishes a personal sync endpoint, the endpoint decides which
//! identity is canonical and the device converges on it.
//!
//! ## Core Principles
//!
//! - **Local-first**: every operation works against local documents
//! - **Last writer wins**: the pointer slot is the only shared mutable state
//! - **Failures are values**: sync negotiation reports an outcome, never an error
//!
//! ## Quick Start
//!
//! ```ignore
//! use accountsync_core::{AccountConfig, AccountManager, Storage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new("~/.accountsync/data/accountsync.redb")?;
//!     let manager = AccountManager::open(storage, AccountConfig::default());
//!
//!     manager.load().await?;
//!     manager.sign_up("Ada", None)?;
//!     println!("{}", manager.token()?);
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod atproto;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pointer;
pub mod repo;
pub mod storage;
pub mod token;
pub mod types;

// Re-exports
pub use account::{
    validate_link_input, validate_sign_up_name, AccountManager, AccountSnapshot, LinkOutcome,
    LoginCheck, SyncOutcome, SyncUnavailable,
};
pub use atproto::{AtprotoProvider, AtprotoSession, ExternalProfile, XrpcProvider, XrpcSession};
pub use channel::{ChannelFrame, RealtimeChannel, SyncEndpoint, WebSocketChannel};
pub use config::AccountConfig;
pub use coordinator::TabCoordinator;
pub use error::{AccountError, AccountResult};
pub use pointer::{PointerChange, PointerStore, PointerWatch, ACTIVE_POINTER_KEY};
pub use repo::{DocChanges, DocHandle, Repo};
pub use storage::{OriginId, Storage, StorageEvent};
pub use token::AccountToken;
pub use types::*;
