//! Cross-surface signalling for the dashboard client.
//!
//! Holds the shared active-block selection and its persistence backends.

pub mod selection;
pub mod store;

pub use selection::{SelectionChange, SelectionRegistry, ACTIVE_BLOCK_KEY};
pub use store::{FileStore, MemoryStore, SelectionStore, StoreError};
