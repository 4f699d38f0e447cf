//! Process-wide "active block" pointer with change notification.
//!
//! [`SelectionRegistry`] is shared as `Arc<SelectionRegistry>` and injected
//! into every surface that reads, writes, or follows the active block. It
//! persists the selection under [`ACTIVE_BLOCK_KEY`] and fans out a
//! [`SelectionChange`] on every write through a `tokio::sync::broadcast`
//! channel.
//!
//! Every `set` and `clear` notifies, even when the value did not change, so
//! subscribers treat a notification as "re-read the selection" rather than
//! as a diff. Reads always go to the store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use llwatch_core::types::BlockId;
use tokio::sync::broadcast;

use crate::store::{MemoryStore, SelectionStore, StoreError};

/// Key under which the active block id is persisted.
pub const ACTIVE_BLOCK_KEY: &str = "active_block_id";

/// Buffer capacity for selection notifications.
const DEFAULT_CAPACITY: usize = 64;

/// Notification published on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionChange {
    /// Value written by the call that produced this notification.
    pub active: Option<BlockId>,
    /// Monotonic write counter, starting at 1.
    pub seq: u64,
}

/// Shared, persisted selection of the active block.
///
/// If the store fails, the registry logs a warning and keeps serving from
/// memory for the rest of its life. No method returns an error.
pub struct SelectionRegistry {
    store: Box<dyn SelectionStore>,
    /// Mirror of the last written value, served once the store is degraded.
    fallback: Mutex<Option<BlockId>>,
    degraded: AtomicBool,
    seq: AtomicU64,
    sender: broadcast::Sender<SelectionChange>,
}

impl SelectionRegistry {
    pub fn new(store: Box<dyn SelectionStore>) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            store,
            fallback: Mutex::new(None),
            degraded: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            sender,
        }
    }

    /// A registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    /// Subscribe to selection notifications.
    ///
    /// A receiver that falls behind sees `RecvError::Lagged`; it should
    /// re-read with [`get`](Self::get), which is always current.
    pub fn subscribe(&self) -> broadcast::Receiver<SelectionChange> {
        self.sender.subscribe()
    }

    /// Whether persistence failed and the registry is memory-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// The persisted active block, or `None`.
    pub fn get(&self) -> Option<BlockId> {
        if self.is_degraded() {
            return self.fallback_value();
        }
        match self.store.load(ACTIVE_BLOCK_KEY) {
            Ok(None) => None,
            Ok(Some(raw)) => match raw.parse::<BlockId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(raw = %raw, error = %e, "Ignoring unparsable active block id");
                    None
                }
            },
            Err(e) => {
                self.degrade(&e);
                self.fallback_value()
            }
        }
    }

    /// Persist `id` as the active block and notify all subscribers.
    pub fn set(&self, id: BlockId) {
        self.set_fallback(Some(id));
        if !self.is_degraded() {
            if let Err(e) = self.store.save(ACTIVE_BLOCK_KEY, &id.to_string()) {
                self.degrade(&e);
            }
        }
        tracing::debug!(block_id = id, "Active block set");
        self.notify(Some(id));
    }

    /// Remove the persisted selection and notify with `None`.
    pub fn clear(&self) {
        self.set_fallback(None);
        if !self.is_degraded() {
            if let Err(e) = self.store.remove(ACTIVE_BLOCK_KEY) {
                self.degrade(&e);
            }
        }
        tracing::debug!("Active block cleared");
        self.notify(None);
    }

    // ---- private helpers ----

    fn notify(&self, active: Option<BlockId>) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        // A send error only means there are no subscribers.
        let _ = self.sender.send(SelectionChange { active, seq });
    }

    fn degrade(&self, error: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(error = %error, "Selection storage unavailable, continuing in memory");
        }
    }

    fn fallback_value(&self) -> Option<BlockId> {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_fallback(&self, value: Option<BlockId>) {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

impl Default for SelectionRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}
