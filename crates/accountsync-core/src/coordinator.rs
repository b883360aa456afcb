//! Cross-tab coordination
//!
//! Several processes (tabs) may share one pointer slot. When another process
//! switches the active identity, the [`TabCoordinator`] follows it so every
//! process shows the same account. It also republishes the manager's snapshot
//! when another process edits the active identity or contact.
//!
//! Pointer events only say that the slot was written. The coordinator always
//! acts on the value stored now, so an event that was overtaken by a later
//! write is harmless, and it never writes the slot itself. Two tabs switching
//! at the same moment therefore settle on whichever write landed last.
//!
//! ```text
//!   tab A: log_in(X) ──► pointer := X ──► event
//!                                           │
//!   tab B coordinator ◄─────────────────────┘
//!     slot == active?         ignore
//!     slot.contactUrl set?    adopt slot (no pointer write)
//!     otherwise               watch slot, adopt once contactUrl appears
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::account::AccountManager;
use crate::error::AccountResult;
use crate::pointer::PointerWatch;
use crate::storage::StorageEvent;
use crate::types::{AccountDoc, DocumentUrl};

/// Follows pointer changes made by other processes
pub struct TabCoordinator {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TabCoordinator {
    /// Start following the pointer slot of `manager`.
    ///
    /// Writes made after this returns are observed, even if the task has not
    /// been polled yet.
    pub fn spawn(manager: Arc<AccountManager>) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let pointer = manager.pointer().watch();
        let documents = manager.repo().storage().subscribe();
        let task = tokio::spawn(run(manager, pointer, documents, shutdown_rx));
        Self {
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Stop following and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!(error = %e, "Tab coordinator task failed");
            }
        }
    }
}

impl Drop for TabCoordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    manager: Arc<AccountManager>,
    mut pointer: PointerWatch,
    mut documents: broadcast::Receiver<StorageEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let own = manager.pointer().origin();
    // Login waiting for a half-written identity to be completed
    let mut pending: Option<JoinHandle<()>> = None;

    debug!(origin = %own, "Tab coordinator started");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            change = pointer.next() => {
                match change {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => debug!(error = %e, "Pointer watch lagged"),
                }
                // The slot holds the last write; the event may be stale
                let target = match manager.pointer().get_raw() {
                    Ok(Some(target)) => target,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Failed to read active pointer");
                        continue;
                    }
                };
                let url = match DocumentUrl::parse(&target) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(value = %target, error = %e, "Ignoring malformed pointer write");
                        continue;
                    }
                };

                // A newer write supersedes any login still waiting
                if let Some(task) = pending.take() {
                    task.abort();
                }
                if manager.active_url() == Some(url) {
                    continue;
                }
                if let Err(e) = follow(&manager, url, &mut pending).await {
                    warn!(%url, error = %e, "Failed to follow pointer change");
                }
            }

            event = documents.recv() => {
                let refresh = match event {
                    Ok(StorageEvent::DocumentSaved { id, origin }) if origin != own => {
                        let id = id.url();
                        manager.active_url() == Some(id) || manager.active_contact_url() == Some(id)
                    }
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if refresh {
                    if let Err(e) = manager.refresh() {
                        warn!(error = %e, "Failed to refresh account snapshot");
                    }
                }
            }
        }
    }

    if let Some(task) = pending.take() {
        task.abort();
    }
    debug!(origin = %own, "Tab coordinator stopped");
}

/// Adopt `url` now, or once its contact reference has been written
async fn follow(
    manager: &Arc<AccountManager>,
    url: DocumentUrl,
    pending: &mut Option<JoinHandle<()>>,
) -> AccountResult<()> {
    let handle = manager.repo().find(&url).await?;
    let mut changes = handle.subscribe();
    if handle.doc::<AccountDoc>()?.is_initialized() {
        if manager.follow_pointer(&url).await?.is_some() {
            info!(%url, "Followed identity switch from another tab");
        }
        return Ok(());
    }

    debug!(%url, "Identity not initialized yet, waiting for its contact");
    let manager = Arc::clone(manager);
    *pending = Some(tokio::spawn(async move {
        loop {
            if let Err(e) = changes.changed().await {
                warn!(%url, error = %e, "Stopped waiting for identity");
                return;
            }
            match handle.doc::<AccountDoc>() {
                Ok(doc) if doc.is_initialized() => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(%url, error = %e, "Failed to read identity");
                    return;
                }
            }
        }
        if manager.active_url() == Some(url) {
            return;
        }
        match manager.follow_pointer(&url).await {
            Ok(Some(_)) => info!(%url, "Followed identity switch from another tab"),
            Ok(None) => {}
            Err(e) => warn!(%url, error = %e, "Failed to follow identity switch"),
        }
    }));
    Ok(())
}
