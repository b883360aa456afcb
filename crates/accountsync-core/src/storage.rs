//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Documents (Automerge CRDT blobs, keyed by document id)
//! - Settings (small string slots such as the active identity pointer)
//!
//! Every write is announced on a broadcast channel shared by all clones of a
//! `Storage`, tagged with the [`OriginId`] of the writer. Several repos or
//! pointer stores attached to one `Storage` therefore observe each other's
//! writes, which is how tabs of one device (and devices joined through a
//! shared transport in tests) see changes they did not make.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::AccountError;
use crate::types::DocumentId;

// Table definitions
const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const SETTINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Default capacity for the storage event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifies the process (tab, window, CLI invocation) that made a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId(u64);

impl OriginId {
    pub fn new() -> Self {
        Self(rand::rng().next_u64())
    }
}

impl Default for OriginId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "origin_{:016x}", self.0)
    }
}

/// Notification of a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// A document's bytes were saved
    DocumentSaved { id: DocumentId, origin: OriginId },
    /// A setting was written or removed
    SettingChanged {
        key: String,
        value: Option<String>,
        origin: OriginId,
    },
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AccountError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        debug!(path = %path.display(), "Opened storage");
        Self::init(db)
    }

    /// Create a storage instance that lives only in memory
    pub fn in_memory() -> Result<Self, AccountError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, AccountError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DOCUMENTS_TABLE)?;
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            events,
        })
    }

    /// Subscribe to write notifications from every clone of this storage
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StorageEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Document Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a document (Automerge blob).
    ///
    /// Documents are stored as raw bytes and can be any size.
    pub fn save_document(
        &self,
        id: &DocumentId,
        data: &[u8],
        origin: OriginId,
    ) -> Result<(), AccountError> {
        {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
                let key = id.to_base58();
                table.insert(key.as_str(), data)?;
            }
            write_txn.commit()?;
        }
        self.emit(StorageEvent::DocumentSaved { id: *id, origin });
        Ok(())
    }

    /// Merge a document with its persisted bytes and store the result.
    ///
    /// `merge` receives the currently stored bytes (if any) and returns the
    /// bytes to write. Both happen inside one write transaction, and redb runs
    /// write transactions one at a time, so a concurrent writer's save is
    /// always seen by `merge` rather than overwritten. Nothing is written if
    /// `merge` fails.
    pub fn merge_document(
        &self,
        id: &DocumentId,
        origin: OriginId,
        merge: impl FnOnce(Option<&[u8]>) -> Result<Vec<u8>, AccountError>,
    ) -> Result<usize, AccountError> {
        let written = {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            let merged = {
                let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
                let key = id.to_base58();
                let current = table.get(key.as_str())?.map(|v| v.value().to_vec());
                match merge(current.as_deref()) {
                    Ok(bytes) => {
                        table.insert(key.as_str(), bytes.as_slice())?;
                        Ok(bytes.len())
                    }
                    Err(e) => Err(e),
                }
            };
            match merged {
                Ok(len) => {
                    write_txn.commit()?;
                    len
                }
                Err(e) => {
                    write_txn.abort()?;
                    return Err(e);
                }
            }
        };
        self.emit(StorageEvent::DocumentSaved { id: *id, origin });
        Ok(written)
    }

    /// Load a document's bytes.
    ///
    /// Returns `None` if no document with the given id exists.
    pub fn load_document(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, AccountError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;
        let key = id.to_base58();

        match table.get(key.as_str())? {
            Some(v) => Ok(Some(v.value().to_vec())),
            None => Ok(None),
        }
    }

    /// Check whether a document exists
    pub fn has_document(&self, id: &DocumentId) -> Result<bool, AccountError> {
        Ok(self.load_document(id)?.is_some())
    }

    /// Number of stored documents
    pub fn document_count(&self) -> Result<usize, AccountError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;
        let mut count = 0;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a setting
    pub fn get_setting(&self, key: &str) -> Result<Option<String>, AccountError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Write a setting, overwriting any previous value.
    ///
    /// Writing the value already stored is a no-op: nothing is committed and
    /// no event is sent. Returns whether the value changed.
    pub fn put_setting(&self, key: &str, value: &str, origin: OriginId) -> Result<bool, AccountError> {
        {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            let unchanged = {
                let mut table = write_txn.open_table(SETTINGS_TABLE)?;
                let unchanged = table.get(key)?.is_some_and(|v| v.value() == value);
                if !unchanged {
                    table.insert(key, value)?;
                }
                unchanged
            };
            if unchanged {
                write_txn.abort()?;
                return Ok(false);
            }
            write_txn.commit()?;
        }
        self.emit(StorageEvent::SettingChanged {
            key: key.to_string(),
            value: Some(value.to_string()),
            origin,
        });
        Ok(true)
    }

    /// Remove a setting
    pub fn remove_setting(&self, key: &str, origin: OriginId) -> Result<(), AccountError> {
        {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SETTINGS_TABLE)?;
                table.remove(key)?;
            }
            write_txn.commit()?;
        }
        self.emit(StorageEvent::SettingChanged {
            key: key.to_string(),
            value: None,
            origin,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_document_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("accountsync.redb");
        let storage = Storage::new(&path).unwrap();

        let id = DocumentId::new();
        assert!(storage.load_document(&id).unwrap().is_none());

        storage.save_document(&id, b"hello", OriginId::new()).unwrap();
        assert_eq!(storage.load_document(&id).unwrap().unwrap(), b"hello");
        assert!(storage.has_document(&id).unwrap());
        assert_eq!(storage.document_count().unwrap(), 1);
        drop(storage);

        // Survives reopen
        let storage = Storage::new(&path).unwrap();
        assert_eq!(storage.load_document(&id).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_settings() {
        let storage = Storage::in_memory().unwrap();
        let origin = OriginId::new();

        assert_eq!(storage.get_setting("k").unwrap(), None);
        storage.put_setting("k", "v1", origin).unwrap();
        storage.put_setting("k", "v2", origin).unwrap();
        assert_eq!(storage.get_setting("k").unwrap().as_deref(), Some("v2"));

        storage.remove_setting("k", origin).unwrap();
        assert_eq!(storage.get_setting("k").unwrap(), None);
    }

    #[test]
    fn test_events_are_shared_between_clones() {
        let storage = Storage::in_memory().unwrap();
        let other = storage.clone();
        let mut events = storage.subscribe();

        let origin = OriginId::new();
        let id = DocumentId::new();
        other.save_document(&id, b"x", origin).unwrap();
        other.put_setting("k", "v", origin).unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            StorageEvent::DocumentSaved { id, origin }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            StorageEvent::SettingChanged {
                key: "k".to_string(),
                value: Some("v".to_string()),
                origin,
            }
        );
    }

    #[test]
    fn test_rewriting_same_setting_is_silent() {
        let storage = Storage::in_memory().unwrap();
        let origin = OriginId::new();
        assert!(storage.put_setting("k", "v", origin).unwrap());

        let mut events = storage.subscribe();
        assert!(!storage.put_setting("k", "v", OriginId::new()).unwrap());
        assert!(events.try_recv().is_err());

        assert!(storage.put_setting("k", "w", origin).unwrap());
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::SettingChanged { value: Some(v), .. } if v == "w"
        ));
    }

    #[test]
    fn test_merge_document_sees_stored_bytes() {
        let storage = Storage::in_memory().unwrap();
        let origin = OriginId::new();
        let id = DocumentId::new();

        storage
            .merge_document(&id, origin, |current| {
                assert!(current.is_none());
                Ok(b"one".to_vec())
            })
            .unwrap();
        storage
            .merge_document(&id, origin, |current| {
                let mut bytes = current.unwrap().to_vec();
                bytes.extend_from_slice(b"+two");
                Ok(bytes)
            })
            .unwrap();
        assert_eq!(storage.load_document(&id).unwrap().unwrap(), b"one+two");
    }

    #[test]
    fn test_failed_merge_writes_nothing() {
        let storage = Storage::in_memory().unwrap();
        let origin = OriginId::new();
        let id = DocumentId::new();
        storage.save_document(&id, b"kept", origin).unwrap();

        let mut events = storage.subscribe();
        let result = storage.merge_document(&id, origin, |_| {
            Err(AccountError::InvalidState("merge failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(storage.load_document(&id).unwrap().unwrap(), b"kept");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_origin_ids_differ() {
        assert_ne!(OriginId::new(), OriginId::new());
    }
}
