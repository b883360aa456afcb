//! Edge case and boundary condition tests
//!
//! These tests verify the system handles unusual inputs,
//! error conditions, and boundary values correctly.

use std::sync::Arc;
use std::time::Duration;

use accountsync_core::token::{self, AccountToken};
use accountsync_core::{
    AccountConfig, AccountError, AccountManager, DocumentId, DocumentUrl, LoginCheck, OriginId,
    PointerStore, Repo, Storage, ACTIVE_POINTER_KEY,
};

fn manager(storage: &Storage) -> AccountManager {
    let origin = OriginId::new();
    let repo = Arc::new(
        Repo::new(storage.clone(), origin).with_find_timeout(Duration::from_millis(100)),
    );
    AccountManager::new(
        repo,
        PointerStore::new(storage.clone(), origin),
        AccountConfig::default(),
    )
}

// ============================================================================
// Token Decoding
// ============================================================================

#[test]
fn test_token_rejects_structural_errors() {
    let id = DocumentId::new();
    let cases = [
        String::new(),
        "account:".to_string(),
        "account:label".to_string(),
        "account:label/".to_string(),
        format!("acount:label/{id}"),
        format!("ACCOUNT:label/{id}"),
        format!("account:label/{id}extra"),
        format!("account:%FF/{id}"),
        format!("account:a/b/{id}"),
        format!("account:Ada Lovelace/{id}"),
        "account:label/!!!".to_string(),
    ];
    for case in cases {
        assert!(
            matches!(token::decode(&case), Err(AccountError::Malformed(_))),
            "expected rejection of {case:?}"
        );
    }
}

#[test]
fn test_token_with_empty_label() {
    let id = DocumentId::new();
    let encoded = token::encode(id, "");
    assert_eq!(encoded, format!("account:/{id}"));
    assert_eq!(token::decode(&encoded).unwrap(), id);
}

#[test]
fn test_token_label_with_slashes() {
    let id = DocumentId::new();
    let token = AccountToken::decode(&token::encode(id, "a/b/c")).unwrap();
    assert_eq!(token.label(), "a/b/c");
    assert_eq!(token.document_id(), id);
}

#[test]
fn test_token_ignores_surrounding_whitespace() {
    let id = DocumentId::new();
    let encoded = format!("  {}\n", token::encode(id, "Ada"));
    assert_eq!(token::decode(&encoded).unwrap(), id);
}

// ============================================================================
// Document References
// ============================================================================

#[test]
fn test_document_url_forms() {
    let id = DocumentId::new();
    let full = DocumentUrl::parse(&format!("automerge:{id}")).unwrap();
    let bare = DocumentUrl::parse(&id.to_string()).unwrap();
    assert_eq!(full, bare);
    assert_eq!(full.to_string(), format!("automerge:{id}"));

    assert!(DocumentUrl::parse("").is_err());
    assert!(DocumentUrl::parse("automerge:").is_err());
    assert!(DocumentUrl::parse("automerge:0OIl").is_err());
}

// ============================================================================
// Manager Boundaries
// ============================================================================

#[tokio::test]
async fn test_check_login_for_identity_without_contact() {
    let storage = Storage::in_memory().unwrap();
    let manager = manager(&storage);
    manager.load().await.unwrap();

    // A document exists but was never initialized as an identity
    let bare = manager.repo().create().unwrap();
    let token = token::encode(bare.id(), "Ghost");
    assert_eq!(manager.check_login(&token).await, LoginCheck::NotFound);
    assert!(matches!(
        manager.log_in(&bare.url()).await,
        Err(AccountError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_load_ignores_malformed_pointer() {
    let storage = Storage::in_memory().unwrap();
    storage
        .put_setting(ACTIVE_POINTER_KEY, "not a url", OriginId::new())
        .unwrap();

    let manager = manager(&storage);
    let snapshot = manager.load().await.unwrap();
    assert_eq!(
        manager.pointer().get().unwrap(),
        Some(snapshot.account_url)
    );
}

#[tokio::test]
async fn test_generation_increases() {
    let storage = Storage::in_memory().unwrap();
    let manager = manager(&storage);

    let mut last = manager.load().await.unwrap().generation;
    for _ in 0..3 {
        let next = manager.log_out().unwrap().generation;
        assert!(next > last);
        last = next;
    }
}
