//! Core types for accountsync
//!
//! Documents are addressed by a [`DocumentId`] (16 random bytes, base58) and
//! referenced from other documents by a [`DocumentUrl`] (`automerge:<id>`).

mod account;
mod contact;
pub(crate) mod fields;
mod folder;

use automerge::AutoCommit;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{AccountError, AccountResult};

pub use account::AccountDoc;
pub use contact::{AtprotoProfile, ContactDoc, RegisteredContact};
pub use folder::{FileDoc, FolderDoc};

/// Typed, read-only view over an Automerge document
pub trait DocumentView: Sized {
    fn hydrate(doc: &AutoCommit) -> AccountResult<Self>;
}

impl DocumentView for AccountDoc {
    fn hydrate(doc: &AutoCommit) -> AccountResult<Self> {
        AccountDoc::read(doc)
    }
}

impl DocumentView for ContactDoc {
    fn hydrate(doc: &AutoCommit) -> AccountResult<Self> {
        ContactDoc::read(doc)
    }
}

impl DocumentView for FolderDoc {
    fn hydrate(doc: &AutoCommit) -> AccountResult<Self> {
        FolderDoc::read(doc)
    }
}

impl DocumentView for FileDoc {
    fn hydrate(doc: &AutoCommit) -> AccountResult<Self> {
        FileDoc::read(doc)
    }
}

/// URL scheme used for document references
pub const URL_SCHEME: &str = "automerge:";

/// Number of bytes in a document identifier
const DOCUMENT_ID_LEN: usize = 16;

/// Unique identifier for a document in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; DOCUMENT_ID_LEN]);

impl DocumentId {
    /// Create a new random DocumentId
    pub fn new() -> Self {
        let mut bytes = [0u8; DOCUMENT_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a DocumentId from raw bytes
    pub fn from_bytes(bytes: [u8; DOCUMENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the DocumentId
    pub fn as_bytes(&self) -> &[u8; DOCUMENT_ID_LEN] {
        &self.0
    }

    /// Convert to base58 string for display/storage
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    ///
    /// This is the store's identifier-validity check: the string must be
    /// base58 and decode to exactly 16 bytes.
    pub fn from_base58(s: &str) -> Result<Self, AccountError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AccountError::Malformed(format!("invalid document id '{}': {}", s, e)))?;
        let arr: [u8; DOCUMENT_ID_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            AccountError::Malformed(format!(
                "invalid document id '{}': expected {} bytes, got {}",
                s,
                DOCUMENT_ID_LEN,
                b.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// The URL referencing this document
    pub fn url(&self) -> DocumentUrl {
        DocumentUrl(*self)
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl std::str::FromStr for DocumentId {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

/// Returns true if `s` is a valid document identifier
pub fn is_valid_document_id(s: &str) -> bool {
    DocumentId::from_base58(s).is_ok()
}

/// Reference to a document, rendered as `automerge:<base58 id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentUrl(DocumentId);

impl DocumentUrl {
    /// Parse a document reference.
    ///
    /// Accepts `automerge:<id>` as well as a bare `<id>`.
    pub fn parse(s: &str) -> Result<Self, AccountError> {
        let s = s.trim();
        let id = s.strip_prefix(URL_SCHEME).unwrap_or(s);
        if id.is_empty() {
            return Err(AccountError::Malformed(format!(
                "empty document reference '{}'",
                s
            )));
        }
        Ok(Self(DocumentId::from_base58(id)?))
    }

    /// The referenced document's identifier
    pub fn document_id(&self) -> DocumentId {
        self.0
    }
}

impl From<DocumentId> for DocumentUrl {
    fn from(id: DocumentId) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DocumentUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", URL_SCHEME, self.0)
    }
}

impl std::str::FromStr for DocumentUrl {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentUrl {
    type Error = AccountError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DocumentUrl> for String {
    fn from(url: DocumentUrl) -> Self {
        url.to_string()
    }
}
