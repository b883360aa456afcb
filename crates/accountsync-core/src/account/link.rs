//! Linking the active account to an external provider identity

use tracing::{info, warn};

use super::{negotiate, validate_link_input, AccountManager, SyncOutcome};
use crate::error::{AccountError, AccountResult};
use crate::types::{AccountDoc, AtprotoProfile, ContactDoc};

/// Result of a successful link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub did: String,
    pub handle: String,
    /// Whether a personal sync endpoint was negotiated
    pub sync: SyncOutcome,
}

impl AccountManager {
    /// Link the active account to an external identity.
    ///
    /// Authenticates `handle_or_did` with the configured provider, imports the
    /// profile into the active identity and contact, then tries to negotiate a
    /// personal sync endpoint. Negotiation failures are reported in
    /// [`LinkOutcome::sync`]; the link itself still succeeds.
    ///
    /// # Errors
    ///
    /// - `AccountError::Malformed` if the input is empty
    /// - `AccountError::LinkFailed` if authentication, the profile fetch or
    ///   the profile import fails; no provider fields are left behind
    pub async fn link_atproto(&self, handle_or_did: &str) -> AccountResult<LinkOutcome> {
        let input = validate_link_input(handle_or_did)?;
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| AccountError::LinkFailed("no identity provider configured".into()))?;
        // Fail early rather than after an interactive flow
        self.current()?;

        let session = provider
            .authorize(input)
            .await
            .map_err(|e| AccountError::LinkFailed(format!("authorization failed: {e}")))?;
        let profile = session
            .profile()
            .await
            .map_err(|e| AccountError::LinkFailed(format!("profile fetch failed: {e}")))?;

        let did = session.did().to_string();
        let name = profile.name().to_string();
        let imported = AtprotoProfile {
            display_name: name.clone(),
            handle: profile.handle.clone(),
            avatar: profile.avatar.clone(),
        };

        // The active identity may have changed while the user authenticated
        let active = self.current()?;
        let previous = active.account.doc::<AccountDoc>()?;
        active
            .account
            .change(|doc| AccountDoc::set_atproto(doc, Some(&did), Some(&profile.handle)))?;
        if let Err(e) = active
            .contact
            .change(|doc| ContactDoc::set_atproto_profile(doc, &name, Some(&imported)))
        {
            active.account.change(|doc| {
                AccountDoc::set_atproto(
                    doc,
                    previous.atproto_did.as_deref(),
                    previous.atproto_handle.as_deref(),
                )
            })?;
            return Err(AccountError::LinkFailed(format!("profile import failed: {e}")));
        }
        *self.session.lock() = Some(session.clone());
        self.publish(&active)?;
        info!(%did, handle = %profile.handle, account = %active.account.url(), "Linked external identity");

        let sync = negotiate::run(self, session.as_ref()).await;
        if let SyncOutcome::Unavailable(reason) = &sync {
            warn!(%did, %reason, "Personal sync endpoint unavailable");
        }
        if let Err(e) = self.refresh() {
            warn!(error = %e, "Failed to publish state after negotiation");
        }

        Ok(LinkOutcome {
            did,
            handle: profile.handle,
            sync,
        })
    }
}
