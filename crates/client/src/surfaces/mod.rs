//! Long-lived dashboard surfaces.
//!
//! Each surface is one task spawned under the context's root token. A
//! surface owns at most one live channel and any pollers it started, and
//! closes them when it is shut down or dropped.

pub mod active_block;
pub mod block_grid;
pub mod drawer;
pub mod prime_list;
pub mod runner;

use std::sync::Arc;

use llwatch_core::error::CoreError;
use llwatch_events::SelectionRegistry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::{ComputeApi, ComputeService, FetchError};
use crate::channel::{ChannelClient, ChannelError, ChannelEvent, LiveChannel};
use crate::config::ClientConfig;
use crate::scope::SurfaceClosed;

pub use active_block::{ActiveBlockPanel, PanelView};
pub use block_grid::{BlockGrid, GridView};
pub use drawer::{BlockDrawer, DrawerView};
pub use prime_list::{PrimeList, PrimeListView};
pub use runner::{RunSurface, RunnerView};

/// Failure of a user action sent to a surface.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Closed(#[from] SurfaceClosed),

    /// The action does not apply to the surface's current state.
    #[error("{0}")]
    NotReady(String),
}

/// Errors building a [`SurfaceContext`].
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Lifecycle of a surface's live channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing to follow.
    #[default]
    Idle,
    Connecting,
    Live,
    /// Closed normally, by either side.
    Closed,
    /// Dropped or refused. Only a user retry reconnects.
    Lost(String),
}

/// Everything a surface needs from the outside world.
///
/// Cheap to clone; clones share the service, registry, and root token.
#[derive(Clone)]
pub struct SurfaceContext {
    pub service: Arc<dyn ComputeService>,
    pub channels: ChannelClient,
    pub registry: Arc<SelectionRegistry>,
    pub config: ClientConfig,
    /// Parent of every surface token.
    pub root: CancellationToken,
}

impl SurfaceContext {
    /// Build a context talking to `config.api_base` over HTTP.
    pub fn connect(config: ClientConfig, registry: Arc<SelectionRegistry>) -> Result<Self, ContextError> {
        let service = Arc::new(ComputeApi::from_config(&config)?);
        Self::with_service(service, config, registry)
    }

    /// Build a context around an existing service implementation.
    pub fn with_service(
        service: Arc<dyn ComputeService>,
        config: ClientConfig,
        registry: Arc<SelectionRegistry>,
    ) -> Result<Self, ContextError> {
        let channels = ChannelClient::new(&config.api_base)?;
        Ok(Self {
            service,
            channels,
            registry,
            config,
            root: CancellationToken::new(),
        })
    }

    /// Cancel every surface spawned from this context.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

/// Next event from an optional channel; pending forever when there is none.
pub(crate) async fn next_channel_event(channel: &mut Option<LiveChannel>) -> ChannelEvent {
    match channel.as_mut() {
        Some(live) => match live.recv().await {
            Some(event) => event,
            None => ChannelEvent::Lost("channel reader exited".to_string()),
        },
        None => std::future::pending().await,
    }
}

/// Close the channel in `slot`, if any.
pub(crate) async fn close_channel(slot: &mut Option<LiveChannel>) {
    if let Some(live) = slot.take() {
        live.close().await;
    }
}
