//! External identity provider (AT Protocol)
//!
//! The account manager talks to the provider through two traits:
//!
//! - [`AtprotoProvider`] performs the interactive authentication for a handle
//!   or DID and yields a session. It may suspend for as long as the user takes.
//! - [`AtprotoSession`] is the authenticated capability: it knows who it is,
//!   fetches the profile and repo records, and performs authenticated requests
//!   on behalf of the account (used to authenticate to a sync endpoint).
//!
//! [`XrpcProvider`] implements both over the XRPC HTTP API using app-password
//! sessions (`com.atproto.server.createSession`). The OAuth flow itself lives
//! outside this crate; any implementation of the traits can be plugged in.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{AccountError, AccountResult};

/// Profile of an external account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProfile {
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

impl ExternalProfile {
    /// Display name, falling back to the handle when unset or blank
    pub fn name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.handle,
        }
    }
}

/// Performs the interactive authentication against the provider
#[async_trait]
pub trait AtprotoProvider: Send + Sync {
    /// Authenticate the given handle or DID.
    ///
    /// Suspends until the user completes the flow; an abandoned flow is an error.
    async fn authorize(&self, handle_or_did: &str) -> AccountResult<Arc<dyn AtprotoSession>>;
}

/// An authenticated provider session
#[async_trait]
pub trait AtprotoSession: Send + Sync {
    /// DID of the authenticated account
    fn did(&self) -> &str;

    /// Fetch the profile of the authenticated account
    async fn profile(&self) -> AccountResult<ExternalProfile>;

    /// Fetch a record from the account's own repo.
    ///
    /// Returns `Ok(None)` when the record does not exist.
    async fn get_record(&self, collection: &str, rkey: &str)
        -> AccountResult<Option<serde_json::Value>>;

    /// Execute a request carrying the session's credentials
    async fn fetch(&self, request: reqwest::Request) -> AccountResult<reqwest::Response>;
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    access_jwt: String,
    did: String,
    handle: String,
}

#[derive(Deserialize)]
struct GetRecordResponse {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Provider backed by an XRPC service (PDS) and an app password
pub struct XrpcProvider {
    client: reqwest::Client,
    service: Url,
    app_password: String,
}

impl XrpcProvider {
    pub fn new(service: Url, app_password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            service,
            app_password: app_password.into(),
        }
    }

    /// Parse the service URL and create a provider
    pub fn from_service_url(service: &str, app_password: impl Into<String>) -> AccountResult<Self> {
        let service = Url::parse(service)
            .map_err(|e| AccountError::Malformed(format!("invalid service URL '{}': {}", service, e)))?;
        Ok(Self::new(service, app_password))
    }
}

#[async_trait]
impl AtprotoProvider for XrpcProvider {
    async fn authorize(&self, handle_or_did: &str) -> AccountResult<Arc<dyn AtprotoSession>> {
        info!(identifier = handle_or_did, service = %self.service, "Creating XRPC session");

        let url = xrpc_url(&self.service, "com.atproto.server.createSession")?;
        let response = self
            .client
            .post(url)
            .json(&CreateSessionRequest {
                identifier: handle_or_did,
                password: &self.app_password,
            })
            .send()
            .await
            .map_err(|e| AccountError::Network(format!("failed to connect to provider: {e}")))?;

        let response = check_status(response).await?;
        let session: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| AccountError::Serialization(format!("invalid session response: {e}")))?;

        debug!(did = %session.did, handle = %session.handle, "XRPC session created");
        Ok(Arc::new(XrpcSession {
            client: self.client.clone(),
            service: self.service.clone(),
            did: session.did,
            access_jwt: session.access_jwt,
        }))
    }
}

/// Session created by [`XrpcProvider`]
pub struct XrpcSession {
    client: reqwest::Client,
    service: Url,
    did: String,
    access_jwt: String,
}

impl XrpcSession {
    fn bearer(&self) -> AccountResult<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.access_jwt))
            .map_err(|e| AccountError::Malformed(format!("invalid access token: {e}")))
    }
}

#[async_trait]
impl AtprotoSession for XrpcSession {
    fn did(&self) -> &str {
        &self.did
    }

    async fn profile(&self) -> AccountResult<ExternalProfile> {
        let mut url = xrpc_url(&self.service, "app.bsky.actor.getProfile")?;
        url.query_pairs_mut().append_pair("actor", &self.did);

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.bearer()?)
            .send()
            .await
            .map_err(|e| AccountError::Network(format!("failed to fetch profile: {e}")))?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AccountError::Serialization(format!("invalid profile response: {e}")))
    }

    async fn get_record(
        &self,
        collection: &str,
        rkey: &str,
    ) -> AccountResult<Option<serde_json::Value>> {
        let mut url = xrpc_url(&self.service, "com.atproto.repo.getRecord")?;
        url.query_pairs_mut()
            .append_pair("repo", &self.did)
            .append_pair("collection", collection)
            .append_pair("rkey", rkey);

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.bearer()?)
            .send()
            .await
            .map_err(|e| AccountError::Network(format!("failed to fetch record: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status() == StatusCode::BAD_REQUEST {
            let body: Option<XrpcErrorBody> = response.json().await.ok();
            if body.as_ref().and_then(|b| b.error.as_deref()) == Some("RecordNotFound") {
                return Ok(None);
            }
            let message = body.and_then(|b| b.message).unwrap_or_default();
            return Err(AccountError::Network(format!(
                "getRecord rejected: {message}"
            )));
        }

        let record: GetRecordResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AccountError::Serialization(format!("invalid record response: {e}")))?;
        Ok(Some(record.value))
    }

    async fn fetch(&self, mut request: reqwest::Request) -> AccountResult<reqwest::Response> {
        request.headers_mut().insert(AUTHORIZATION, self.bearer()?);
        self.client
            .execute(request)
            .await
            .map_err(|e| AccountError::Network(format!("authenticated request failed: {e}")))
    }
}

fn xrpc_url(service: &Url, method: &str) -> AccountResult<Url> {
    service
        .join(&format!("/xrpc/{method}"))
        .map_err(|e| AccountError::Malformed(format!("invalid XRPC URL: {e}")))
}

async fn check_status(response: reqwest::Response) -> AccountResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(AccountError::Network(format!(
        "provider returned {status}: {text}"
    )))
}
