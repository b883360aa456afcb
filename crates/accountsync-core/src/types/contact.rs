//! Contact document: the user-facing profile of an account.
//!
//! A contact is either anonymous or registered. The variant is stored under
//! the `type` key; registered contacts carry a name and optionally an avatar
//! reference and a profile imported from the linked AT Protocol account.

use automerge::{transaction::Transactable, AutoCommit, ObjType, ROOT};
use serde::{Deserialize, Serialize};

use super::fields::{get_map, get_str, get_url, put_opt_str};
use crate::error::{AccountError, AccountResult};
use crate::types::DocumentUrl;

const TYPE: &str = "type";
const TYPE_ANONYMOUS: &str = "anonymous";
const TYPE_REGISTERED: &str = "registered";
const NAME: &str = "name";
const AVATAR_URL: &str = "avatarUrl";
const ATPROTO_PROFILE: &str = "atprotoProfile";
const DISPLAY_NAME: &str = "displayName";
const HANDLE: &str = "handle";
const AVATAR: &str = "avatar";

/// Profile imported from the external provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtprotoProfile {
    pub display_name: String,
    pub handle: String,
    pub avatar: Option<String>,
}

/// Fields of a registered contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredContact {
    pub name: String,
    pub avatar_url: Option<DocumentUrl>,
    pub atproto_profile: Option<AtprotoProfile>,
}

/// Contact document variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContactDoc {
    Anonymous,
    Registered(RegisteredContact),
}

/// Registered contacts always carry a name
fn require_name(name: &str) -> AccountResult<()> {
    if name.trim().is_empty() {
        return Err(AccountError::Malformed(
            "registered contact needs a name".into(),
        ));
    }
    Ok(())
}

impl ContactDoc {
    /// Read a contact out of an Automerge document.
    ///
    /// A document without a `type` field reads as anonymous.
    pub fn read(doc: &AutoCommit) -> AccountResult<Self> {
        match get_str(doc, &ROOT, TYPE)?.as_deref() {
            Some(TYPE_REGISTERED) => {
                let atproto_profile = match get_map(doc, &ROOT, ATPROTO_PROFILE)? {
                    Some(profile) => Some(AtprotoProfile {
                        display_name: get_str(doc, &profile, DISPLAY_NAME)?.unwrap_or_default(),
                        handle: get_str(doc, &profile, HANDLE)?.unwrap_or_default(),
                        avatar: get_str(doc, &profile, AVATAR)?,
                    }),
                    None => None,
                };
                Ok(ContactDoc::Registered(RegisteredContact {
                    name: get_str(doc, &ROOT, NAME)?.unwrap_or_default(),
                    avatar_url: get_url(doc, &ROOT, AVATAR_URL)?,
                    atproto_profile,
                }))
            }
            _ => Ok(ContactDoc::Anonymous),
        }
    }

    /// Initialize a freshly created contact as anonymous
    pub fn init_anonymous(doc: &mut AutoCommit) -> AccountResult<()> {
        doc.put(&ROOT, TYPE, TYPE_ANONYMOUS)?;
        Ok(())
    }

    /// Turn the contact into a registered one with the given name.
    ///
    /// The avatar reference is only written when one is given.
    pub fn register(
        doc: &mut AutoCommit,
        name: &str,
        avatar_url: Option<&DocumentUrl>,
    ) -> AccountResult<()> {
        require_name(name)?;
        doc.put(&ROOT, TYPE, TYPE_REGISTERED)?;
        doc.put(&ROOT, NAME, name)?;
        if let Some(url) = avatar_url {
            doc.put(&ROOT, AVATAR_URL, url.to_string())?;
        }
        Ok(())
    }

    /// Overwrite name and imported profile, leaving every other field alone
    pub fn set_atproto_profile(
        doc: &mut AutoCommit,
        name: &str,
        profile: Option<&AtprotoProfile>,
    ) -> AccountResult<()> {
        require_name(name)?;
        doc.put(&ROOT, TYPE, TYPE_REGISTERED)?;
        doc.put(&ROOT, NAME, name)?;
        match profile {
            Some(profile) => {
                let obj = doc.put_object(&ROOT, ATPROTO_PROFILE, ObjType::Map)?;
                doc.put(&obj, DISPLAY_NAME, profile.display_name.as_str())?;
                doc.put(&obj, HANDLE, profile.handle.as_str())?;
                put_opt_str(doc, &obj, AVATAR, profile.avatar.as_deref())?;
            }
            None => {
                if get_map(doc, &ROOT, ATPROTO_PROFILE)?.is_some() {
                    doc.delete(&ROOT, ATPROTO_PROFILE)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, ContactDoc::Registered(_))
    }

    /// Display name, if registered
    pub fn name(&self) -> Option<&str> {
        match self {
            ContactDoc::Registered(c) => Some(c.name.as_str()),
            ContactDoc::Anonymous => None,
        }
    }

    pub fn avatar_url(&self) -> Option<&DocumentUrl> {
        match self {
            ContactDoc::Registered(c) => c.avatar_url.as_ref(),
            ContactDoc::Anonymous => None,
        }
    }

    pub fn atproto_profile(&self) -> Option<&AtprotoProfile> {
        match self {
            ContactDoc::Registered(c) => c.atproto_profile.as_ref(),
            ContactDoc::Anonymous => None,
        }
    }
}
