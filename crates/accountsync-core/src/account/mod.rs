//! Account manager - the active identity state machine
//!
//! `AccountManager` owns the active identity pointer and the handles of the
//! active identity and contact documents. It is constructed once per process
//! and passed to whatever needs it; there is no global account.
//!
//! ## State transitions
//!
//! ```text
//!            load()                      sign_up(name)
//!   (none) ─────────► Anonymous ────────────────────────► Registered
//!                        ▲  │ link_atproto(handle)             │
//!                        │  └──────────────────────────────────►│
//!             log_out()  │                                      │
//!   any ─────────────────┘         log_in(url) / root mismatch  │
//!   any ───────────────────────────────────────────────► whatever url holds
//! ```
//!
//! Every transition that changes the active identity writes the pointer and
//! publishes a new [`AccountSnapshot`] on a `watch` channel.
//!
//! # Example
//!
//! ```ignore
//! let storage = Storage::in_memory()?;
//! let origin = OriginId::new();
//! let repo = Arc::new(Repo::new(storage.clone(), origin));
//! let manager = AccountManager::new(repo, PointerStore::new(storage, origin), AccountConfig::default());
//!
//! manager.load().await?;
//! manager.sign_up("Ada", None)?;
//! let token = manager.token()?;
//! ```

mod link;
mod negotiate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::atproto::{AtprotoProvider, AtprotoSession};
use crate::channel::RealtimeChannel;
use crate::config::AccountConfig;
use crate::error::{AccountError, AccountResult};
use crate::pointer::PointerStore;
use crate::repo::{DocHandle, Repo};
use crate::storage::{OriginId, Storage};
use crate::token::AccountToken;
use crate::types::{AccountDoc, ContactDoc, DocumentUrl, FileDoc, FolderDoc};

pub use link::LinkOutcome;
pub use negotiate::{SyncOutcome, SyncUnavailable};

/// Label used in tokens of anonymous accounts
const ANONYMOUS_LABEL: &str = "Anonymous";

/// Title of a new account's root folder
const ROOT_FOLDER_TITLE: &str = "My Documents";

/// Handles of the active identity
#[derive(Debug, Clone)]
struct ActiveAccount {
    account: DocHandle,
    contact: DocHandle,
}

/// Point-in-time view of the active account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// Increases with every published snapshot
    pub generation: u64,
    pub account_url: DocumentUrl,
    pub contact_url: DocumentUrl,
    pub account: AccountDoc,
    pub contact: ContactDoc,
}

/// Result of validating an account token before logging in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginCheck {
    /// The token does not decode
    Malformed(String),
    /// The identity or its contact does not resolve
    NotFound,
    /// The identity resolves but belongs to an anonymous contact
    Anonymous { url: DocumentUrl },
    /// The identity can be logged in to
    Ready { url: DocumentUrl, name: String },
}

impl LoginCheck {
    /// Whether a log-in with this token may be submitted
    pub fn is_submittable(&self) -> bool {
        matches!(self, LoginCheck::Ready { .. })
    }
}

/// Validate a sign-up name, returning it trimmed
pub fn validate_sign_up_name(name: &str) -> AccountResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AccountError::Malformed("name must not be empty".into()));
    }
    Ok(name)
}

/// Validate a handle or DID to link, returning it trimmed
pub fn validate_link_input(handle_or_did: &str) -> AccountResult<&str> {
    let input = handle_or_did.trim();
    if input.is_empty() {
        return Err(AccountError::Malformed("handle or DID must not be empty".into()));
    }
    Ok(input)
}

/// Owner of the active identity
pub struct AccountManager {
    repo: Arc<Repo>,
    pointer: PointerStore,
    config: AccountConfig,
    provider: Option<Arc<dyn AtprotoProvider>>,
    channel: Option<Arc<dyn RealtimeChannel>>,
    http: reqwest::Client,
    active: RwLock<Option<ActiveAccount>>,
    session: Mutex<Option<Arc<dyn AtprotoSession>>>,
    generation: AtomicU64,
    state_tx: watch::Sender<Option<AccountSnapshot>>,
}

impl AccountManager {
    /// Create a manager; call [`AccountManager::load`] before using it
    pub fn new(repo: Arc<Repo>, pointer: PointerStore, config: AccountConfig) -> Self {
        let (state_tx, _) = watch::channel(None);
        Self {
            repo,
            pointer,
            config,
            provider: None,
            channel: None,
            http: reqwest::Client::new(),
            active: RwLock::new(None),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            state_tx,
        }
    }

    /// Open a manager whose documents and pointer share one storage.
    ///
    /// Writes are tagged with a fresh [`OriginId`] and `find` waits up to
    /// `config.find_timeout`.
    pub fn open(storage: Storage, config: AccountConfig) -> Self {
        let origin = OriginId::new();
        let repo = Repo::new(storage.clone(), origin).with_find_timeout(config.find_timeout);
        Self::new(Arc::new(repo), PointerStore::new(storage, origin), config)
    }

    /// Set the external identity provider (builder pattern)
    pub fn with_provider(mut self, provider: Arc<dyn AtprotoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the realtime channel used after sync negotiation (builder pattern)
    pub fn with_realtime_channel(mut self, channel: Arc<dyn RealtimeChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    pub fn pointer(&self) -> &PointerStore {
        &self.pointer
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Observable state
    // ═══════════════════════════════════════════════════════════════════════

    /// The current snapshot, `None` before `load`
    pub fn snapshot(&self) -> Option<AccountSnapshot> {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> watch::Receiver<Option<AccountSnapshot>> {
        self.state_tx.subscribe()
    }

    /// URL of the active identity document
    pub fn active_url(&self) -> Option<DocumentUrl> {
        self.active.read().as_ref().map(|a| a.account.url())
    }

    /// URL of the active contact document
    pub fn active_contact_url(&self) -> Option<DocumentUrl> {
        self.active.read().as_ref().map(|a| a.contact.url())
    }

    /// The external provider session of the last successful link
    pub fn session(&self) -> Option<Arc<dyn AtprotoSession>> {
        self.session.lock().clone()
    }

    fn current(&self) -> AccountResult<ActiveAccount> {
        self.active
            .read()
            .clone()
            .ok_or_else(|| AccountError::InvalidState("no active account; call load() first".into()))
    }

    /// Re-read the active documents and publish a new snapshot
    pub fn refresh(&self) -> AccountResult<AccountSnapshot> {
        let active = self.current()?;
        self.publish(&active)
    }

    fn publish(&self, active: &ActiveAccount) -> AccountResult<AccountSnapshot> {
        let snapshot = AccountSnapshot {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            account_url: active.account.url(),
            contact_url: active.contact.url(),
            account: active.account.doc()?,
            contact: active.contact.doc()?,
        };
        self.state_tx.send_replace(Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Swap in a new active identity, persist the pointer and publish
    fn activate(&self, next: ActiveAccount) -> AccountResult<AccountSnapshot> {
        self.pointer.set(&next.account.url())?;
        *self.active.write() = Some(next.clone());
        self.publish(&next)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the identity named by the pointer, creating one on first run.
    ///
    /// A pointer that is malformed or names an identity that does not resolve
    /// is replaced by a fresh anonymous identity.
    pub async fn load(&self) -> AccountResult<AccountSnapshot> {
        let stored = match self.pointer.get() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed active pointer");
                None
            }
        };

        if let Some(url) = stored {
            match self.resolve(&url).await {
                Ok(active) => {
                    self.backfill_root_folder(&active)?;
                    info!(%url, "Loaded existing account");
                    return self.activate(active);
                }
                Err(AccountError::NotFound(what)) => {
                    warn!(%url, missing = %what, "Stored account did not resolve, creating a new one");
                }
                Err(e) => return Err(e),
            }
        }

        let active = self.create_account()?;
        info!(url = %active.account.url(), "Created new anonymous account");
        self.activate(active)
    }

    /// Resolve an identity document and its contact
    async fn resolve(&self, url: &DocumentUrl) -> AccountResult<ActiveAccount> {
        let account = self.repo.find(url).await?;
        let contact_url = account
            .doc::<AccountDoc>()?
            .contact_url
            .ok_or_else(|| AccountError::NotFound(format!("{} has no contact", url)))?;
        let contact = self.repo.find(&contact_url).await?;
        Ok(ActiveAccount { account, contact })
    }

    /// Legacy identities may predate the root folder
    fn backfill_root_folder(&self, active: &ActiveAccount) -> AccountResult<()> {
        if active.account.doc::<AccountDoc>()?.root_folder_url.is_some() {
            return Ok(());
        }
        let folder = self
            .repo
            .create_with(|doc| FolderDoc::init(doc, ROOT_FOLDER_TITLE))?;
        active
            .account
            .change(|doc| AccountDoc::set_root_folder(doc, &folder.url()))?;
        info!(account = %active.account.url(), folder = %folder.url(), "Backfilled root folder");
        Ok(())
    }

    /// Create identity, anonymous contact and root folder documents
    fn create_account(&self) -> AccountResult<ActiveAccount> {
        let contact = self.repo.create_with(ContactDoc::init_anonymous)?;
        let folder = self
            .repo
            .create_with(|doc| FolderDoc::init(doc, ROOT_FOLDER_TITLE))?;
        let account = self
            .repo
            .create_with(|doc| AccountDoc::init(doc, &contact.url(), &folder.url()))?;
        Ok(ActiveAccount { account, contact })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Register the active anonymous account under `name`.
    ///
    /// # Errors
    ///
    /// - `AccountError::Malformed` if the name is empty
    /// - `AccountError::InvalidState` if the account is already registered
    pub fn sign_up(&self, name: &str, avatar: Option<FileDoc>) -> AccountResult<AccountSnapshot> {
        let name = validate_sign_up_name(name)?;
        let active = self.current()?;

        if active.contact.doc::<ContactDoc>()?.is_registered() {
            return Err(AccountError::InvalidState(
                "account is already registered".into(),
            ));
        }

        let avatar_url = match avatar {
            Some(file) => {
                let handle = self.repo.create_with(|doc| file.write(doc))?;
                debug!(url = %handle.url(), bytes = file.contents.len(), "Stored avatar");
                Some(handle.url())
            }
            None => None,
        };

        active
            .contact
            .change(|doc| ContactDoc::register(doc, name, avatar_url.as_ref()))?;
        info!(account = %active.account.url(), name, "Signed up");
        self.publish(&active)
    }

    /// Switch the active identity to `url`.
    ///
    /// # Errors
    ///
    /// Returns `AccountError::NotFound` if the identity or its contact does not
    /// resolve within the find timeout. The active identity is unchanged.
    pub async fn log_in(&self, url: &DocumentUrl) -> AccountResult<AccountSnapshot> {
        let next = self.resolve(url).await?;
        info!(%url, "Logging in");
        self.activate(next)
    }

    /// Adopt the identity another process switched the pointer to.
    ///
    /// Unlike [`AccountManager::log_in`] the pointer is not written, so
    /// following a switch never looks like a new switch to other processes.
    /// Returns `None` if the pointer moved on while the identity resolved.
    pub(crate) async fn follow_pointer(
        &self,
        url: &DocumentUrl,
    ) -> AccountResult<Option<AccountSnapshot>> {
        let next = self.resolve(url).await?;
        if self.pointer.get().ok().flatten() != Some(*url) {
            debug!(%url, "Pointer moved on before the identity resolved");
            return Ok(None);
        }
        *self.active.write() = Some(next.clone());
        self.publish(&next).map(Some)
    }

    /// Decode an account token and log in to the identity it names.
    ///
    /// Returns `AccountError::Malformed` for tokens that do not decode.
    pub async fn log_in_with_token(&self, token: &str) -> AccountResult<AccountSnapshot> {
        let token = AccountToken::decode(token)?;
        self.log_in(&token.url()).await
    }

    /// Replace the active identity with a brand-new anonymous one.
    ///
    /// The previous identity is left as it is.
    pub fn log_out(&self) -> AccountResult<AccountSnapshot> {
        let previous = self.active_url();
        let next = self.create_account()?;
        *self.session.lock() = None;
        info!(?previous, url = %next.account.url(), "Logged out");
        self.activate(next)
    }

    /// Token for moving the active identity to another device
    pub fn token(&self) -> AccountResult<AccountToken> {
        let active = self.current()?;
        let contact = active.contact.doc::<ContactDoc>()?;
        let label = contact.name().unwrap_or(ANONYMOUS_LABEL);
        Ok(AccountToken::new(active.account.id(), label))
    }

    /// Check whether a token may be used to log in
    pub async fn check_login(&self, token: &str) -> LoginCheck {
        let token = match AccountToken::decode(token) {
            Ok(token) => token,
            Err(e) => return LoginCheck::Malformed(e.to_string()),
        };
        let url = token.url();

        let contact = match self.resolve(&url).await {
            Ok(active) => active.contact.doc::<ContactDoc>(),
            Err(e) => {
                debug!(%url, error = %e, "Login check did not resolve");
                return LoginCheck::NotFound;
            }
        };

        match contact {
            Ok(ContactDoc::Registered(contact)) => LoginCheck::Ready {
                url,
                name: contact.name,
            },
            Ok(ContactDoc::Anonymous) => LoginCheck::Anonymous { url },
            Err(_) => LoginCheck::NotFound,
        }
    }
}
