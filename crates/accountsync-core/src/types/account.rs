//! Identity document: the root of an account's document graph.

use automerge::{transaction::Transactable, AutoCommit, ROOT};
use serde::{Deserialize, Serialize};

use super::fields::{get_i64, get_str, get_url, put_opt_str};
use crate::error::AccountResult;
use crate::types::DocumentUrl;

const CONTACT_URL: &str = "contactUrl";
const ROOT_FOLDER_URL: &str = "rootFolderUrl";
const ATPROTO_DID: &str = "atprotoDid";
const ATPROTO_HANDLE: &str = "atprotoHandle";
const PSS_JWT: &str = "pssJwt";
const LAST_ONLINE_SYNC: &str = "lastOnlineSync";

/// Snapshot of an identity document's fields
///
/// `contact_url` is only `None` while another process is still creating the
/// document; `root_folder_url` may be `None` on legacy identities until it is
/// backfilled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDoc {
    pub contact_url: Option<DocumentUrl>,
    pub root_folder_url: Option<DocumentUrl>,
    pub atproto_did: Option<String>,
    pub atproto_handle: Option<String>,
    pub pss_jwt: Option<String>,
    pub last_online_sync: Option<i64>,
}

impl AccountDoc {
    /// Read the identity fields out of an Automerge document
    pub fn read(doc: &AutoCommit) -> AccountResult<Self> {
        Ok(Self {
            contact_url: get_url(doc, &ROOT, CONTACT_URL)?,
            root_folder_url: get_url(doc, &ROOT, ROOT_FOLDER_URL)?,
            atproto_did: get_str(doc, &ROOT, ATPROTO_DID)?,
            atproto_handle: get_str(doc, &ROOT, ATPROTO_HANDLE)?,
            pss_jwt: get_str(doc, &ROOT, PSS_JWT)?,
            last_online_sync: get_i64(doc, &ROOT, LAST_ONLINE_SYNC)?,
        })
    }

    /// True once the document carries its contact reference
    pub fn is_initialized(&self) -> bool {
        self.contact_url.is_some()
    }

    /// Initialize a freshly created identity document
    pub fn init(
        doc: &mut AutoCommit,
        contact_url: &DocumentUrl,
        root_folder_url: &DocumentUrl,
    ) -> AccountResult<()> {
        doc.put(&ROOT, ROOT_FOLDER_URL, root_folder_url.to_string())?;
        doc.put(&ROOT, CONTACT_URL, contact_url.to_string())?;
        Ok(())
    }

    /// Backfill the root folder reference on legacy identities
    pub fn set_root_folder(doc: &mut AutoCommit, root_folder_url: &DocumentUrl) -> AccountResult<()> {
        doc.put(&ROOT, ROOT_FOLDER_URL, root_folder_url.to_string())?;
        Ok(())
    }

    /// Record the linked external identity
    pub fn set_atproto(doc: &mut AutoCommit, did: Option<&str>, handle: Option<&str>) -> AccountResult<()> {
        put_opt_str(doc, &ROOT, ATPROTO_DID, did)?;
        put_opt_str(doc, &ROOT, ATPROTO_HANDLE, handle)?;
        Ok(())
    }

    /// Replace the realtime sync session token
    pub fn set_pss_jwt(doc: &mut AutoCommit, jwt: &str) -> AccountResult<()> {
        doc.put(&ROOT, PSS_JWT, jwt)?;
        Ok(())
    }

    /// Record the time of the last successful online sync
    pub fn set_last_online_sync(doc: &mut AutoCommit, timestamp: i64) -> AccountResult<()> {
        doc.put(&ROOT, LAST_ONLINE_SYNC, timestamp)?;
        Ok(())
    }
}
