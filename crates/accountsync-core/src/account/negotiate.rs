//! Personal sync endpoint negotiation
//!
//! Runs after a successful link:
//!
//! 1. Read the provider record naming the endpoint host
//!    (`<sync_record_collection>/self`, field `host`).
//! 2. `POST <scheme>://<host>/authenticate` through the provider session with
//!    `{ lexiconAuthorityDomain, rootDocUrl }`; the reply names the canonical
//!    root identity and a session token.
//! 3. If the canonical root differs from the active identity, carry the
//!    provider fields over to the root, then switch to it (logging out of the
//!    linked identity and into the root as a single pointer write).
//! 4. Store the token as `pssJwt` and attach a realtime channel.
//!
//! Steps 1, 2 and the channel attach are bounded by the negotiation timeout.
//! Every failure is reported as [`SyncOutcome::Unavailable`] and leaves the
//! active identity as it was.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::AccountManager;
use crate::atproto::AtprotoSession;
use crate::channel::SyncEndpoint;
use crate::error::{AccountError, AccountResult};
use crate::types::{AccountDoc, ContactDoc, DocumentUrl};

/// Record key of the sync endpoint record
const SYNC_RECORD_KEY: &str = "self";

/// Field of the sync endpoint record holding the host
const SYNC_RECORD_HOST: &str = "host";

/// Whether a personal sync endpoint was negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced {
        host: String,
        /// The active identity was switched to the endpoint's canonical root
        root_changed: bool,
        /// A realtime channel was attached
        channel_attached: bool,
    },
    Unavailable(SyncUnavailable),
}

impl SyncOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }
}

/// Why negotiation did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUnavailable {
    /// The account publishes no sync endpoint record
    NoEndpoint,
    /// Discovery or authentication exceeded the negotiation timeout
    TimedOut,
    /// Any other failure
    Failed(String),
}

impl fmt::Display for SyncUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncUnavailable::NoEndpoint => write!(f, "no sync endpoint record"),
            SyncUnavailable::TimedOut => write!(f, "negotiation timed out"),
            SyncUnavailable::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateRequest<'a> {
    lexicon_authority_domain: &'a str,
    root_doc_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateResponse {
    root_doc_url: String,
    token: String,
}

struct Authenticated {
    host: String,
    root: DocumentUrl,
    token: String,
}

enum Discovery {
    NoEndpoint,
    Authenticated(Authenticated),
}

/// Negotiate the personal sync endpoint for `session`
pub(super) async fn run(manager: &AccountManager, session: &dyn AtprotoSession) -> SyncOutcome {
    let limit = manager.config.negotiation_timeout;
    let authenticated = match tokio::time::timeout(limit, discover(manager, session)).await {
        Ok(Ok(Discovery::Authenticated(authenticated))) => authenticated,
        Ok(Ok(Discovery::NoEndpoint)) => {
            return SyncOutcome::Unavailable(SyncUnavailable::NoEndpoint)
        }
        Ok(Err(e)) => return SyncOutcome::Unavailable(SyncUnavailable::Failed(e.to_string())),
        Err(_) => return SyncOutcome::Unavailable(SyncUnavailable::TimedOut),
    };

    let root_changed = match adopt(manager, &authenticated).await {
        Ok(root_changed) => root_changed,
        Err(e) => {
            warn!(host = %authenticated.host, error = %e, "Failed to adopt negotiated root");
            return SyncOutcome::Unavailable(SyncUnavailable::Failed(e.to_string()));
        }
    };

    let channel_attached = attach(manager, &authenticated).await;
    SyncOutcome::Synced {
        host: authenticated.host,
        root_changed,
        channel_attached,
    }
}

/// Find the endpoint host and authenticate to it
async fn discover(
    manager: &AccountManager,
    session: &dyn AtprotoSession,
) -> AccountResult<Discovery> {
    let collection = manager.config.sync_record_collection.as_str();
    let Some(record) = session.get_record(collection, SYNC_RECORD_KEY).await? else {
        debug!(did = session.did(), collection, "No sync endpoint record");
        return Ok(Discovery::NoEndpoint);
    };
    let Some(host) = record
        .get(SYNC_RECORD_HOST)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
    else {
        debug!(did = session.did(), collection, "Sync endpoint record has no host");
        return Ok(Discovery::NoEndpoint);
    };

    let current = manager
        .active_url()
        .ok_or_else(|| AccountError::InvalidState("no active account".into()))?;
    let endpoint = Url::parse(&format!(
        "{}://{}/authenticate",
        manager.config.sync_scheme, host
    ))
    .map_err(|e| AccountError::NegotiationFailed(format!("invalid sync host '{host}': {e}")))?;

    let request = manager
        .http
        .post(endpoint)
        .json(&AuthenticateRequest {
            lexicon_authority_domain: &manager.config.lexicon_authority_domain,
            root_doc_url: current.to_string(),
        })
        .build()
        .map_err(|e| AccountError::NegotiationFailed(format!("failed to build request: {e}")))?;

    debug!(%host, root = %current, "Authenticating to sync endpoint");
    let response = session.fetch(request).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AccountError::NegotiationFailed(format!(
            "sync endpoint {host} returned {status}"
        )));
    }
    let body: AuthenticateResponse = response.json().await.map_err(|e| {
        AccountError::NegotiationFailed(format!("unexpected authenticate response: {e}"))
    })?;
    let root = DocumentUrl::parse(&body.root_doc_url).map_err(|e| {
        AccountError::NegotiationFailed(format!("sync endpoint returned a bad root: {e}"))
    })?;

    Ok(Discovery::Authenticated(Authenticated {
        host,
        root,
        token: body.token,
    }))
}

/// Make the negotiated root the active identity and store the token.
///
/// Returns whether the active identity changed.
async fn adopt(manager: &AccountManager, authenticated: &Authenticated) -> AccountResult<bool> {
    let current = manager.current()?;
    let now = chrono::Utc::now().timestamp_millis();

    if current.account.url() == authenticated.root {
        current.account.change(|doc| {
            AccountDoc::set_pss_jwt(doc, &authenticated.token)?;
            AccountDoc::set_last_online_sync(doc, now)
        })?;
        manager.publish(&current)?;
        info!(host = %authenticated.host, "Sync endpoint confirmed active identity");
        return Ok(false);
    }

    // Fields to carry over from the identity the user linked
    let linked = current.account.doc::<AccountDoc>()?;
    let linked_contact = current.contact.doc::<ContactDoc>()?;

    // Every fallible step runs before the active identity changes
    let root = manager.resolve(&authenticated.root).await?;
    if let Some(name) = linked_contact.name() {
        root.contact.change(|doc| {
            ContactDoc::set_atproto_profile(doc, name, linked_contact.atproto_profile())
        })?;
    }
    root.account.change(|doc| {
        AccountDoc::set_atproto(
            doc,
            linked.atproto_did.as_deref(),
            linked.atproto_handle.as_deref(),
        )?;
        AccountDoc::set_pss_jwt(doc, &authenticated.token)?;
        AccountDoc::set_last_online_sync(doc, now)
    })?;

    info!(
        from = %current.account.url(),
        to = %authenticated.root,
        host = %authenticated.host,
        "Switching to canonical root identity"
    );
    // Log out of the linked identity and into the root in one step
    manager.activate(root)?;
    Ok(true)
}

async fn attach(manager: &AccountManager, authenticated: &Authenticated) -> bool {
    let Some(channel) = manager.channel.as_ref() else {
        return false;
    };
    let endpoint = SyncEndpoint::new(authenticated.host.clone(), authenticated.token.clone());
    match tokio::time::timeout(manager.config.negotiation_timeout, channel.attach(&endpoint)).await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(host = %endpoint.host, error = %e, "Failed to attach realtime channel");
            false
        }
        Err(_) => {
            warn!(host = %endpoint.host, "Timed out attaching realtime channel");
            false
        }
    }
}
