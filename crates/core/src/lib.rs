//! Domain types and pure merge logic for the Lucas-Lehmer dashboard client.
//!
//! Nothing in this crate performs IO. Wire models, live frame parsing, and
//! the reconciler live here so they can be tested without a network.

pub mod digits;
pub mod error;
pub mod listing;
pub mod live;
pub mod models;
pub mod reconcile;
pub mod status;
pub mod types;
