//! Account lifecycle scenarios across devices and tabs
//!
//! ## Test Architecture
//!
//! - A *device* is an `AccountManager` with its own pointer storage. Devices
//!   share one document storage, standing in for the sync transport.
//! - A *tab* is an `AccountManager` sharing both document and pointer storage
//!   with other tabs of the same device.
//! - The external provider and the sync endpoint are served by `wiremock`.

use std::sync::Arc;
use std::time::Duration;

use accountsync_core::{
    AccountConfig, AccountDoc, AccountError, AccountManager, AccountResult, ContactDoc,
    LoginCheck, OriginId, PointerStore, RealtimeChannel, Repo, Storage, SyncEndpoint,
    SyncOutcome, TabCoordinator, XrpcProvider,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn device_with(docs: &Storage, pointers: &Storage, config: AccountConfig) -> AccountManager {
    let origin = OriginId::new();
    let repo = Arc::new(Repo::new(docs.clone(), origin).with_find_timeout(config.find_timeout));
    AccountManager::new(repo, PointerStore::new(pointers.clone(), origin), config)
}

fn device(docs: &Storage) -> AccountManager {
    let pointers = Storage::in_memory().unwrap();
    device_with(
        docs,
        &pointers,
        AccountConfig::default().with_find_timeout(Duration::from_millis(300)),
    )
}

#[derive(Default)]
struct RecordingChannel {
    attached: Mutex<Vec<SyncEndpoint>>,
}

#[async_trait]
impl RealtimeChannel for RecordingChannel {
    async fn attach(&self, endpoint: &SyncEndpoint) -> AccountResult<()> {
        self.attached.lock().push(endpoint.clone());
        Ok(())
    }
}

// ============================================================================
// Device Scenarios
// ============================================================================

/// A registered identity created on one device can be logged in on another.
#[tokio::test]
async fn test_two_device_login() {
    let docs = Storage::in_memory().unwrap();
    let laptop = device(&docs);
    let phone = device(&docs);

    let created = laptop.load().await.unwrap();
    laptop.sign_up("Ada", None).unwrap();
    let token = laptop.token().unwrap().encode();
    assert!(token.starts_with("account:Ada/"));

    let phone_initial = phone.load().await.unwrap();
    assert_ne!(phone_initial.account_url, created.account_url);

    assert_eq!(
        phone.check_login(&token).await,
        LoginCheck::Ready {
            url: created.account_url,
            name: "Ada".into()
        }
    );
    let logged_in = phone.log_in_with_token(&token).await.unwrap();
    assert_eq!(logged_in.account_url, created.account_url);
    assert_eq!(logged_in.contact.name(), Some("Ada"));
    assert_eq!(phone.pointer().get().unwrap(), Some(created.account_url));

    // Devices keep their own pointer
    assert_eq!(laptop.pointer().get().unwrap(), Some(created.account_url));
}

/// Anonymous identities are not offered for log-in.
#[tokio::test]
async fn test_anonymous_identity_not_submittable() {
    let docs = Storage::in_memory().unwrap();
    let laptop = device(&docs);
    let phone = device(&docs);

    let anonymous = laptop.load().await.unwrap();
    let token = laptop.token().unwrap().encode();
    assert!(token.starts_with("account:Anonymous/"));

    phone.load().await.unwrap();
    let check = phone.check_login(&token).await;
    assert_eq!(
        check,
        LoginCheck::Anonymous {
            url: anonymous.account_url
        }
    );
    assert!(!check.is_submittable());
}

/// Signing up twice fails and leaves the contact as it was.
#[tokio::test]
async fn test_double_sign_up() {
    let docs = Storage::in_memory().unwrap();
    let laptop = device(&docs);
    laptop.load().await.unwrap();

    laptop.sign_up("Ada", None).unwrap();
    let err = laptop.sign_up("Grace", None).unwrap_err();
    assert!(matches!(err, AccountError::InvalidState(_)));
    assert_eq!(laptop.refresh().unwrap().contact.name(), Some("Ada"));
}

/// Logging out yields a fresh anonymous identity whose references resolve,
/// and the choice survives a restart.
#[tokio::test]
async fn test_logout_persists_across_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("accountsync.redb");

    let (old, new) = {
        let storage = Storage::new(&db).unwrap();
        let manager = device_with(&storage, &storage, AccountConfig::default());
        let old = manager.load().await.unwrap();
        manager.sign_up("Ada", None).unwrap();
        let new = manager.log_out().unwrap();
        (old, new)
    };
    assert_ne!(old.account_url, new.account_url);
    assert_eq!(new.contact, ContactDoc::Anonymous);

    let storage = Storage::new(&db).unwrap();
    let manager = device_with(&storage, &storage, AccountConfig::default());
    let reloaded = manager.load().await.unwrap();
    assert_eq!(reloaded.account_url, new.account_url);
    assert_eq!(reloaded.contact_url, new.contact_url);
    assert!(reloaded.account.root_folder_url.is_some());

    // The old identity is intact and still loggable
    let back = manager.log_in(&old.account_url).await.unwrap();
    assert_eq!(back.contact.name(), Some("Ada"));
}

// ============================================================================
// Sync Negotiation
// ============================================================================

async fn mount_provider(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.server.createSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessJwt": "access-1",
            "refreshJwt": "refresh-1",
            "did": "did:plc:ada",
            "handle": "ada.test"
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/xrpc/app.bsky.actor.getProfile"))
        .and(query_param("actor", "did:plc:ada"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "did": "did:plc:ada",
            "handle": "ada.test",
            "displayName": "Ada Lovelace",
            "avatar": "https://cdn.test/ada.jpg"
        })))
        .mount(server)
        .await;
}

async fn mount_sync_record(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .and(query_param("collection", "dev.accountsync.syncServer"))
        .and(query_param("rkey", "self"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": "at://did:plc:ada/dev.accountsync.syncServer/self",
            "value": { "host": server.address().to_string() }
        })))
        .mount(server)
        .await;
}

/// Linking on a new device converges on the canonical root identity.
#[tokio::test]
async fn test_link_switches_to_canonical_root() {
    tracing_subscriber::fmt()
        .with_env_filter("accountsync_core=debug,hyper=warn,reqwest=warn")
        .try_init()
        .ok();

    let server = MockServer::start().await;
    mount_provider(&server).await;
    mount_sync_record(&server).await;

    let docs = Storage::in_memory().unwrap();
    let laptop = device(&docs);
    let root = laptop.load().await.unwrap();
    laptop.sign_up("Ada", None).unwrap();

    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rootDocUrl": root.account_url.to_string(),
            "token": "pss-token"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let channel = Arc::new(RecordingChannel::default());
    let pointers = Storage::in_memory().unwrap();
    let config = AccountConfig::default()
        .insecure_sync()
        .with_find_timeout(Duration::from_millis(300));
    let phone = device_with(&docs, &pointers, config)
        .with_provider(Arc::new(
            XrpcProvider::from_service_url(&server.uri(), "app-pw").unwrap(),
        ))
        .with_realtime_channel(channel.clone());
    let local = phone.load().await.unwrap();

    let outcome = phone.link_atproto("ada.test").await.unwrap();
    assert_eq!(outcome.did, "did:plc:ada");
    assert_eq!(
        outcome.sync,
        SyncOutcome::Synced {
            host: server.address().to_string(),
            root_changed: true,
            channel_attached: true,
        }
    );

    // The phone now runs on the canonical root with the provider fields
    let snapshot = phone.snapshot().unwrap();
    assert_eq!(snapshot.account_url, root.account_url);
    assert_eq!(phone.pointer().get().unwrap(), Some(root.account_url));
    assert_eq!(snapshot.account.atproto_did.as_deref(), Some("did:plc:ada"));
    assert_eq!(snapshot.account.atproto_handle.as_deref(), Some("ada.test"));
    assert_eq!(snapshot.account.pss_jwt.as_deref(), Some("pss-token"));
    assert_eq!(snapshot.contact.name(), Some("Ada Lovelace"));
    assert_eq!(
        snapshot.contact.atproto_profile().map(|p| p.handle.as_str()),
        Some("ada.test")
    );

    // The identity the phone linked from was left behind, without a token
    let left = phone.repo().find(&local.account_url).await.unwrap();
    assert_eq!(left.doc::<AccountDoc>().unwrap().pss_jwt, None);

    let attached = channel.attached.lock().clone();
    assert_eq!(
        attached,
        vec![SyncEndpoint::new(server.address().to_string(), "pss-token")]
    );
}

/// Linking where the endpoint already knows this identity keeps it.
#[tokio::test]
async fn test_link_confirms_current_root() {
    let server = MockServer::start().await;
    mount_provider(&server).await;
    mount_sync_record(&server).await;

    let docs = Storage::in_memory().unwrap();
    let pointers = Storage::in_memory().unwrap();
    let laptop = device_with(&docs, &pointers, AccountConfig::default().insecure_sync())
        .with_provider(Arc::new(
            XrpcProvider::from_service_url(&server.uri(), "app-pw").unwrap(),
        ));
    let current = laptop.load().await.unwrap();

    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .and(body_json(json!({
            "lexiconAuthorityDomain": "accountsync.dev",
            "rootDocUrl": current.account_url.to_string(),
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rootDocUrl": current.account_url.to_string(),
            "token": "pss-token"
        })))
        .mount(&server)
        .await;

    let outcome = laptop.link_atproto("ada.test").await.unwrap();
    assert_eq!(
        outcome.sync,
        SyncOutcome::Synced {
            host: server.address().to_string(),
            root_changed: false,
            channel_attached: false,
        }
    );
    let snapshot = laptop.snapshot().unwrap();
    assert_eq!(snapshot.account_url, current.account_url);
    assert_eq!(snapshot.account.pss_jwt.as_deref(), Some("pss-token"));
}

/// Without a published endpoint the link still succeeds.
#[tokio::test]
async fn test_link_without_sync_endpoint() {
    let server = MockServer::start().await;
    mount_provider(&server).await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "RecordNotFound",
            "message": "Could not locate record"
        })))
        .mount(&server)
        .await;

    let docs = Storage::in_memory().unwrap();
    let laptop = device(&docs).with_provider(Arc::new(
        XrpcProvider::from_service_url(&server.uri(), "app-pw").unwrap(),
    ));
    let before = laptop.load().await.unwrap();

    let outcome = laptop.link_atproto("ada.test").await.unwrap();
    assert!(!outcome.sync.is_synced());
    let snapshot = laptop.snapshot().unwrap();
    assert_eq!(snapshot.account_url, before.account_url);
    assert_eq!(snapshot.account.atproto_did.as_deref(), Some("did:plc:ada"));
    assert_eq!(snapshot.account.pss_jwt, None);
}

// ============================================================================
// Tabs
// ============================================================================

/// A log-in in one tab is followed by the other tabs of the device.
#[tokio::test]
async fn test_cross_tab_switch() {
    tracing_subscriber::fmt()
        .with_env_filter("accountsync_core=debug,hyper=warn,reqwest=warn")
        .try_init()
        .ok();

    let docs = Storage::in_memory().unwrap();
    let laptop = device(&docs);
    let target = laptop.load().await.unwrap();
    laptop.sign_up("Ada", None).unwrap();
    let token = laptop.token().unwrap().encode();

    // Two tabs of another device
    let pointers = Storage::in_memory().unwrap();
    let config = AccountConfig::default().with_find_timeout(Duration::from_millis(300));
    let tab_a = Arc::new(device_with(&docs, &pointers, config.clone()));
    let tab_b = Arc::new(device_with(&docs, &pointers, config));
    let initial = tab_a.load().await.unwrap();
    assert_eq!(tab_b.load().await.unwrap().account_url, initial.account_url);

    let coordinator_a = TabCoordinator::spawn(tab_a.clone());
    let coordinator_b = TabCoordinator::spawn(tab_b.clone());

    tab_a.log_in_with_token(&token).await.unwrap();

    let mut rx = tab_b.subscribe();
    let followed = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| s.as_ref().map(|s| s.account_url) == Some(target.account_url)),
    )
    .await
    .expect("tab b followed");
    assert!(followed.is_ok());
    drop(followed);
    assert_eq!(tab_b.snapshot().unwrap().contact.name(), Some("Ada"));

    // Tab A does not react to its own write
    assert_eq!(tab_a.active_url(), Some(target.account_url));

    coordinator_a.stop().await;
    coordinator_b.stop().await;
}
