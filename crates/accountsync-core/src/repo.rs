//! Document store facade over Automerge documents
//!
//! `Repo` hands out [`DocHandle`]s for documents kept in [`Storage`]. Each
//! handle owns a local Automerge document; before every read or change it
//! pulls in whatever is currently persisted (a CRDT merge), and every change
//! is merged with the persisted bytes inside one storage write transaction.
//! Several repos attached to one storage therefore converge on the same
//! document state, even when they change it concurrently.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Repo (one per process)                                         │
//! │  ├── create()  -> DocHandle   new empty document, persisted     │
//! │  ├── find(url) -> DocHandle   waits up to find_timeout          │
//! │  └── handles: cache of open documents                           │
//! │                                                                 │
//! │  DocHandle                                                      │
//! │  ├── doc::<T>()      typed snapshot of the latest state         │
//! │  ├── change(|doc|)   atomic mutation, rolled back on error      │
//! │  └── subscribe()     notifications of saves from any process    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use automerge::AutoCommit;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DEFAULT_FIND_TIMEOUT_SECS;
use crate::error::{AccountError, AccountResult};
use crate::storage::{OriginId, Storage, StorageEvent};
use crate::types::{DocumentId, DocumentUrl, DocumentView};

struct HandleInner {
    id: DocumentId,
    doc: Mutex<AutoCommit>,
    storage: Storage,
    origin: OriginId,
}

/// Handle to a single document
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

impl DocHandle {
    fn new(id: DocumentId, doc: AutoCommit, storage: Storage, origin: OriginId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                doc: Mutex::new(doc),
                storage,
                origin,
            }),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.inner.id
    }

    pub fn url(&self) -> DocumentUrl {
        self.inner.id.url()
    }

    /// Merge the persisted state into the local document
    fn refresh(&self, doc: &mut AutoCommit) -> AccountResult<()> {
        if let Some(bytes) = self.inner.storage.load_document(&self.inner.id)? {
            doc.load_incremental(&bytes)?;
        }
        Ok(())
    }

    /// Read the latest state through a closure
    pub fn with_doc<R>(&self, f: impl FnOnce(&AutoCommit) -> AccountResult<R>) -> AccountResult<R> {
        let mut doc = self.inner.doc.lock();
        self.refresh(&mut doc)?;
        f(&doc)
    }

    /// Typed snapshot of the latest state
    pub fn doc<T: DocumentView>(&self) -> AccountResult<T> {
        self.with_doc(T::hydrate)
    }

    /// Apply a mutation and persist it.
    ///
    /// If the closure fails, its pending operations are rolled back and
    /// nothing is written.
    pub fn change<R>(
        &self,
        f: impl FnOnce(&mut AutoCommit) -> AccountResult<R>,
    ) -> AccountResult<R> {
        let mut doc = self.inner.doc.lock();
        self.refresh(&mut doc)?;

        let result = match f(&mut doc) {
            Ok(result) => result,
            Err(e) => {
                doc.rollback();
                return Err(e);
            }
        };

        doc.commit();
        // Fold in saves made since the refresh before writing back
        let written = self
            .inner
            .storage
            .merge_document(&self.inner.id, self.inner.origin, |persisted| {
                if let Some(persisted) = persisted {
                    doc.load_incremental(persisted)?;
                }
                Ok(doc.save())
            })?;
        trace!(id = %self.inner.id, bytes = written, "Document changed");
        Ok(result)
    }

    /// Subscribe to saves of this document from any process
    pub fn subscribe(&self) -> DocChanges {
        DocChanges {
            id: self.inner.id,
            events: self.inner.storage.subscribe(),
        }
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle").field("url", &self.url()).finish()
    }
}

/// Stream of change notifications for one document
pub struct DocChanges {
    id: DocumentId,
    events: broadcast::Receiver<StorageEvent>,
}

impl DocChanges {
    /// Wait for the next save of the document.
    ///
    /// A lagged receiver reports a change, since saves may have been missed.
    pub async fn changed(&mut self) -> AccountResult<()> {
        loop {
            match self.events.recv().await {
                Ok(StorageEvent::DocumentSaved { id, .. }) if id == self.id => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(AccountError::Storage("storage event channel closed".into()))
                }
            }
        }
    }
}

/// Document store
pub struct Repo {
    storage: Storage,
    origin: OriginId,
    find_timeout: Duration,
    handles: Mutex<HashMap<DocumentId, DocHandle>>,
}

impl Repo {
    /// Create a repo over the given storage, writing as `origin`
    pub fn new(storage: Storage, origin: OriginId) -> Self {
        Self {
            storage,
            origin,
            find_timeout: Duration::from_secs(DEFAULT_FIND_TIMEOUT_SECS),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Set how long `find` waits for a missing document (builder pattern).
    ///
    /// Defaults to `AccountConfig::default().find_timeout`.
    pub fn with_find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Create a new, empty document and persist it
    pub fn create(&self) -> AccountResult<DocHandle> {
        let id = DocumentId::new();
        let mut doc = AutoCommit::new();
        self.storage.save_document(&id, &doc.save(), self.origin)?;
        debug!(url = %id.url(), "Created document");

        let handle = DocHandle::new(id, doc, self.storage.clone(), self.origin);
        self.handles.lock().insert(id, handle.clone());
        Ok(handle)
    }

    /// Create a document and initialize it before it is first persisted
    pub fn create_with(
        &self,
        init: impl FnOnce(&mut AutoCommit) -> AccountResult<()>,
    ) -> AccountResult<DocHandle> {
        let id = DocumentId::new();
        let mut doc = AutoCommit::new();
        init(&mut doc)?;
        doc.commit();
        self.storage.save_document(&id, &doc.save(), self.origin)?;
        debug!(url = %id.url(), "Created document");

        let handle = DocHandle::new(id, doc, self.storage.clone(), self.origin);
        self.handles.lock().insert(id, handle.clone());
        Ok(handle)
    }

    /// Find a document, waiting up to the find timeout for it to appear.
    ///
    /// # Errors
    ///
    /// Returns `AccountError::NotFound` if the document does not resolve in time.
    pub async fn find(&self, url: &DocumentUrl) -> AccountResult<DocHandle> {
        let id = url.document_id();
        if let Some(handle) = self.handles.lock().get(&id) {
            return Ok(handle.clone());
        }

        // Subscribe before the first check so a concurrent save is not missed
        let mut events = self.storage.subscribe();
        let deadline = Instant::now() + self.find_timeout;

        let bytes = loop {
            if let Some(bytes) = self.storage.load_document(&id)? {
                break bytes;
            }
            let waited = tokio::time::timeout_at(deadline, async {
                loop {
                    match events.recv().await {
                        Ok(StorageEvent::DocumentSaved { id: saved, .. }) if saved == id => {
                            return true
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => return true,
                        Err(broadcast::error::RecvError::Closed) => return false,
                    }
                }
            })
            .await;
            match waited {
                Ok(true) => continue,
                Ok(false) | Err(_) => {
                    debug!(%url, "Document did not resolve");
                    return Err(AccountError::NotFound(url.to_string()));
                }
            }
        };

        let doc = AutoCommit::load(&bytes)?;
        let handle = DocHandle::new(id, doc, self.storage.clone(), self.origin);
        let handle = self
            .handles
            .lock()
            .entry(id)
            .or_insert(handle)
            .clone();
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountDoc, ContactDoc};

    fn repo(storage: &Storage) -> Repo {
        Repo::new(storage.clone(), OriginId::new()).with_find_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let storage = Storage::in_memory().unwrap();
        let repo = repo(&storage);

        let handle = repo.create().unwrap();
        handle.change(|doc| ContactDoc::init_anonymous(doc)).unwrap();

        let found = repo.find(&handle.url()).await.unwrap();
        assert_eq!(found.url(), handle.url());
        assert_eq!(found.doc::<ContactDoc>().unwrap(), ContactDoc::Anonymous);
    }

    #[tokio::test]
    async fn test_find_missing_times_out() {
        let storage = Storage::in_memory().unwrap();
        let repo = repo(&storage);

        let result = repo.find(&DocumentId::new().url()).await;
        assert!(matches!(result, Err(AccountError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_find_waits_for_document_created_elsewhere() {
        let storage = Storage::in_memory().unwrap();
        let reader = Repo::new(storage.clone(), OriginId::new())
            .with_find_timeout(Duration::from_secs(2));
        let writer = repo(&storage);

        let id = DocumentId::new();
        let url = id.url();
        let find = tokio::spawn(async move { reader.find(&url).await.map(|h| h.url()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        storage
            .save_document(&id, &AutoCommit::new().save(), writer.origin())
            .unwrap();

        assert_eq!(find.await.unwrap().unwrap(), id.url());
    }

    #[tokio::test]
    async fn test_repos_sharing_storage_converge() {
        let storage = Storage::in_memory().unwrap();
        let a = repo(&storage);
        let b = repo(&storage);

        let handle_a = a.create().unwrap();
        let handle_b = b.find(&handle_a.url()).await.unwrap();

        handle_b
            .change(|doc| AccountDoc::set_pss_jwt(doc, "from-b"))
            .unwrap();
        let seen = handle_a.doc::<AccountDoc>().unwrap();
        assert_eq!(seen.pss_jwt.as_deref(), Some("from-b"));
    }

    #[tokio::test]
    async fn test_concurrent_changes_from_two_repos_are_kept() {
        use automerge::transaction::Transactable;
        use automerge::{ReadDoc, ROOT};

        const WRITES: usize = 200;

        let storage = Storage::in_memory().unwrap();
        let a = repo(&storage);
        let b = repo(&storage);
        let handle_a = a.create().unwrap();
        let handle_b = b.find(&handle_a.url()).await.unwrap();
        let id = handle_a.id();

        let writers: Vec<_> = [("a", handle_a), ("b", handle_b)]
            .into_iter()
            .map(|(prefix, handle)| {
                std::thread::spawn(move || {
                    for i in 0..WRITES {
                        handle
                            .change(|doc| {
                                doc.put(ROOT, format!("{prefix}{i}"), i as i64)?;
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let persisted = storage.load_document(&id).unwrap().unwrap();
        let doc = AutoCommit::load(&persisted).unwrap();
        assert_eq!(doc.keys(ROOT).count(), 2 * WRITES);
    }

    #[tokio::test]
    async fn test_failed_change_is_rolled_back() {
        let storage = Storage::in_memory().unwrap();
        let repo = repo(&storage);
        let handle = repo.create().unwrap();

        let result: AccountResult<()> = handle.change(|doc| {
            AccountDoc::set_pss_jwt(doc, "partial")?;
            Err(AccountError::InvalidState("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(handle.doc::<AccountDoc>().unwrap().pss_jwt, None);
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes_from_other_repo() {
        let storage = Storage::in_memory().unwrap();
        let a = repo(&storage);
        let b = repo(&storage);

        let handle_a = a.create().unwrap();
        let handle_b = b.find(&handle_a.url()).await.unwrap();
        let mut changes = handle_a.subscribe();

        handle_b
            .change(|doc| AccountDoc::set_pss_jwt(doc, "jwt"))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), changes.changed())
            .await
            .expect("change notification")
            .unwrap();
    }
}
