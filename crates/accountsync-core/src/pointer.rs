//! Active identity pointer storage
//!
//! The pointer is a single settings slot holding the URL of the identity
//! document that is active on this device. It is the only mutable state
//! shared between processes; writes are last-writer-wins.

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{AccountError, AccountResult};
use crate::storage::{OriginId, Storage, StorageEvent};
use crate::types::DocumentUrl;

/// Settings key holding the active identity document URL
pub const ACTIVE_POINTER_KEY: &str = "identity:activePointer";

/// A write to the pointer slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerChange {
    /// New pointer value, `None` when the slot was cleared
    pub value: Option<String>,
    /// Process that made the write
    pub origin: OriginId,
}

/// Pointer slot bound to one process
#[derive(Clone)]
pub struct PointerStore {
    storage: Storage,
    origin: OriginId,
}

impl PointerStore {
    pub fn new(storage: Storage, origin: OriginId) -> Self {
        Self { storage, origin }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Read the raw pointer value
    pub fn get_raw(&self) -> AccountResult<Option<String>> {
        self.storage.get_setting(ACTIVE_POINTER_KEY)
    }

    /// Read the pointer as a document URL.
    ///
    /// # Errors
    ///
    /// Returns `AccountError::Malformed` if the stored value is not a document URL.
    pub fn get(&self) -> AccountResult<Option<DocumentUrl>> {
        self.get_raw()?.map(|s| DocumentUrl::parse(&s)).transpose()
    }

    /// Replace the pointer.
    ///
    /// Setting the value already stored does not notify watchers.
    pub fn set(&self, url: &DocumentUrl) -> AccountResult<()> {
        if self
            .storage
            .put_setting(ACTIVE_POINTER_KEY, &url.to_string(), self.origin)?
        {
            debug!(%url, origin = %self.origin, "Wrote active pointer");
        }
        Ok(())
    }

    /// Clear the pointer
    pub fn clear(&self) -> AccountResult<()> {
        self.storage.remove_setting(ACTIVE_POINTER_KEY, self.origin)
    }

    /// Watch every write to the pointer slot, including our own
    pub fn watch(&self) -> PointerWatch {
        PointerWatch {
            events: self.storage.subscribe(),
        }
    }
}

/// Receiver of pointer writes
pub struct PointerWatch {
    events: broadcast::Receiver<StorageEvent>,
}

impl PointerWatch {
    /// Wait for the next pointer write.
    ///
    /// Returns `Ok(None)` once the storage is gone. Lagging is reported as an
    /// error so the caller can re-read the slot.
    pub async fn next(&mut self) -> AccountResult<Option<PointerChange>> {
        loop {
            match self.events.recv().await {
                Ok(StorageEvent::SettingChanged { key, value, origin })
                    if key == ACTIVE_POINTER_KEY =>
                {
                    return Ok(Some(PointerChange { value, origin }))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(AccountError::Storage(format!(
                        "pointer watch lagged by {} events",
                        n
                    )))
                }
            }
        }
    }
}
