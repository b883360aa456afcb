//! Configuration for an account manager.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use accountsync_core::AccountConfig;
//!
//! let config = AccountConfig::default()
//!     .with_find_timeout(Duration::from_secs(10))
//!     .with_lexicon_authority_domain("example.com");
//! assert_eq!(config.find_timeout, Duration::from_secs(10));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time to wait for a referenced document to resolve
pub const DEFAULT_FIND_TIMEOUT_SECS: u64 = 5;

/// Default bound on sync endpoint discovery and authentication
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 10;

/// Default lexicon authority presented to sync endpoints
pub const DEFAULT_LEXICON_AUTHORITY_DOMAIN: &str = "accountsync.dev";

/// Default record collection describing a personal sync endpoint
pub const DEFAULT_SYNC_RECORD_COLLECTION: &str = "dev.accountsync.syncServer";

/// Configuration for [`crate::AccountManager`]
///
/// # Defaults
///
/// - `find_timeout`: 5 seconds
/// - `negotiation_timeout`: 10 seconds
/// - `lexicon_authority_domain`: `accountsync.dev`
/// - `sync_record_collection`: `dev.accountsync.syncServer`
/// - `sync_scheme`: `https`
/// - `realtime_scheme`: `wss`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// How long a document lookup waits before reporting `NotFound`.
    #[serde(with = "duration_secs")]
    pub find_timeout: Duration,

    /// Upper bound on the whole sync endpoint negotiation.
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,

    /// Sent to the sync endpoint as `lexiconAuthorityDomain`.
    pub lexicon_authority_domain: String,

    /// Collection of the provider record naming the sync endpoint host.
    pub sync_record_collection: String,

    /// Scheme for the `/authenticate` request (`http` for local servers).
    pub sync_scheme: String,

    /// Scheme for the realtime channel (`ws` for local servers).
    pub realtime_scheme: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            find_timeout: Duration::from_secs(DEFAULT_FIND_TIMEOUT_SECS),
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
            lexicon_authority_domain: DEFAULT_LEXICON_AUTHORITY_DOMAIN.to_string(),
            sync_record_collection: DEFAULT_SYNC_RECORD_COLLECTION.to_string(),
            sync_scheme: "https".to_string(),
            realtime_scheme: "wss".to_string(),
        }
    }
}

impl AccountConfig {
    pub fn with_find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_lexicon_authority_domain(mut self, domain: impl Into<String>) -> Self {
        self.lexicon_authority_domain = domain.into();
        self
    }

    pub fn with_sync_record_collection(mut self, collection: impl Into<String>) -> Self {
        self.sync_record_collection = collection.into();
        self
    }

    /// Use plain `http`/`ws` for the sync endpoint (local development servers)
    pub fn insecure_sync(mut self) -> Self {
        self.sync_scheme = "http".to_string();
        self.realtime_scheme = "ws".to_string();
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AccountConfig::default();
        assert_eq!(config.find_timeout, Duration::from_secs(5));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(config.sync_scheme, "https");
        assert_eq!(config.realtime_scheme, "wss");
    }

    #[test]
    fn test_builder() {
        let config = AccountConfig::default()
            .with_negotiation_timeout(Duration::from_millis(500))
            .with_sync_record_collection("com.example.sync")
            .insecure_sync();
        assert_eq!(config.negotiation_timeout, Duration::from_millis(500));
        assert_eq!(config.sync_record_collection, "com.example.sync");
        assert_eq!(config.sync_scheme, "http");
        assert_eq!(config.realtime_scheme, "ws");
    }

    #[test]
    fn test_serde_partial() {
        let config: AccountConfig =
            serde_json::from_str(r#"{"find_timeout": 1.5, "sync_scheme": "http"}"#).unwrap();
        assert_eq!(config.find_timeout, Duration::from_millis(1500));
        assert_eq!(config.sync_scheme, "http");
        assert_eq!(config.realtime_scheme, "wss");

        let json = serde_json::to_string(&config).unwrap();
        let back: AccountConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
