//! Progress sync engine for the Lucas-Lehmer dashboard.
//!
//! Talks to the compute service over REST ([`api`]) and WebSocket
//! ([`channel`]) and keeps a set of long-lived [`surfaces`] converged on the
//! service's state. Surfaces publish immutable views through `watch`
//! channels; renderers only read them.

pub mod api;
pub mod artifact;
pub mod channel;
pub mod config;
pub mod poller;
pub mod refresh;
pub mod scope;
pub mod surfaces;

#[cfg(test)]
mod fake;

pub use api::{ComputeApi, ComputeService, FetchError};
pub use channel::{ChannelClient, ChannelEvent, ChannelSubject, LiveChannel};
pub use config::ClientConfig;
pub use poller::{DigitsState, PollError, PollOutcome};
pub use surfaces::{ConnectionState, SessionError, SurfaceContext};
