//! Account tokens for moving an identity between devices
//!
//! An account token is a human-copyable string that points at an identity
//! document:
//!
//! ```text
//! account:<percent-encoded label>/<document id>
//! ```
//!
//! The label is cosmetic (usually the contact's name). Only the document id
//! is load-bearing; the label never changes which document a token names,
//! but it must be in the exact percent-encoded form `encode` writes.
//!
//! This is a convenience mechanism, not a credential: anyone holding a token
//! can log in to the identity it points at.

use crate::error::AccountError;
use crate::types::{DocumentId, DocumentUrl};

/// Prefix for encoded account tokens
const TOKEN_PREFIX: &str = "account:";

/// A decoded account token
///
/// # Example
///
/// ```
/// use accountsync_core::token::AccountToken;
/// use accountsync_core::DocumentId;
///
/// let id = DocumentId::new();
/// let token = AccountToken::new(id, "Ada Lovelace");
/// let encoded = token.encode();
/// assert!(encoded.starts_with("account:Ada%20Lovelace/"));
///
/// let decoded: AccountToken = encoded.parse().unwrap();
/// assert_eq!(decoded.document_id(), id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountToken {
    document_id: DocumentId,
    label: String,
}

impl AccountToken {
    pub fn new(document_id: DocumentId, label: impl Into<String>) -> Self {
        Self {
            document_id,
            label: label.into(),
        }
    }

    /// The identity document this token points at
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// URL of the identity document
    pub fn url(&self) -> DocumentUrl {
        self.document_id.url()
    }

    /// Display label carried by the token
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Encode as `account:<label>/<id>`
    pub fn encode(&self) -> String {
        format!(
            "{}{}/{}",
            TOKEN_PREFIX,
            urlencoding::encode(&self.label),
            self.document_id.to_base58()
        )
    }

    /// Decode a token, rejecting anything outside the token grammar.
    ///
    /// # Errors
    ///
    /// Returns `AccountError::Malformed` if:
    /// - The string doesn't start with `account:`
    /// - There is no `/` separating label and identifier
    /// - The label is not valid percent-encoding, or not in the form
    ///   [`AccountToken::encode`] writes (raw `/`, spaces, lowercase escapes)
    /// - The identifier segment is empty or not a valid document id
    pub fn decode(s: &str) -> Result<Self, AccountError> {
        let s = s.trim();
        let rest = s.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            AccountError::Malformed(format!(
                "Invalid prefix: expected '{}', got '{}'",
                TOKEN_PREFIX,
                s.chars().take(15).collect::<String>()
            ))
        })?;

        // Encoded labels never contain '/', so the last one is the separator.
        let (label, id) = rest
            .rsplit_once('/')
            .ok_or_else(|| AccountError::Malformed("missing '/' before document id".into()))?;

        if id.is_empty() {
            return Err(AccountError::Malformed("empty document id".into()));
        }

        let decoded = urlencoding::decode(label)
            .map_err(|e| AccountError::Malformed(format!("invalid label encoding: {}", e)))?
            .into_owned();
        // Only the exact form `encode` produces is accepted
        if urlencoding::encode(&decoded) != label {
            return Err(AccountError::Malformed(format!(
                "label '{}' is not percent-encoded",
                label
            )));
        }
        let document_id = DocumentId::from_base58(id)?;

        Ok(Self {
            document_id,
            label: decoded,
        })
    }
}

impl std::fmt::Display for AccountToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for AccountToken {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Encode a document id and label as an account token
pub fn encode(document_id: DocumentId, label: &str) -> String {
    AccountToken::new(document_id, label).encode()
}

/// Decode an account token to the document id it points at
pub fn decode(token: &str) -> Result<DocumentId, AccountError> {
    AccountToken::decode(token).map(|t| t.document_id())
}
