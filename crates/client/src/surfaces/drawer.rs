//! Detail drawer for one block: exponent table plus its own live channel.

use llwatch_core::listing::visible_exponents;
use llwatch_core::live::LiveUpdateEvent;
use llwatch_core::models::{BlockStartAck, TrackedExponent};
use llwatch_core::reconcile::BlockDetailView;
use llwatch_core::types::{BlockId, Exponent};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{close_channel, next_channel_event, ConnectionState, SessionError, SurfaceContext};
use crate::channel::{ChannelError, ChannelEvent, ChannelSubject, LiveChannel};
use crate::refresh::LoadState;
use crate::scope::{publish, spawn_surface, SurfaceClosed, SurfaceHandle, SurfaceTask};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawerView {
    pub detail: BlockDetailView,
    /// Rows to display, capped and ordered per `prime_first`.
    pub visible: Vec<TrackedExponent>,
    pub prime_first: bool,
    /// Exponent offered to the runner; defaults to the block's first.
    pub selected_p: Option<Exponent>,
    pub connection: ConnectionState,
    pub seed: LoadState,
}

impl DrawerView {
    fn new(block_id: BlockId) -> Self {
        Self {
            detail: BlockDetailView::new(block_id),
            visible: Vec::new(),
            prime_first: false,
            selected_p: None,
            connection: ConnectionState::Connecting,
            seed: LoadState::Loading,
        }
    }

    fn refresh_visible(&mut self) {
        self.visible = visible_exponents(&self.detail.exponents, self.prime_first);
    }
}

pub enum DrawerCommand {
    Start {
        reply: oneshot::Sender<Result<BlockStartAck, SessionError>>,
    },
    TogglePrimeFirst,
    Select(Exponent),
    Retry,
}

pub struct BlockDrawer {
    block_id: BlockId,
    handle: SurfaceHandle<DrawerView, DrawerCommand>,
}

impl BlockDrawer {
    pub fn spawn(ctx: &SurfaceContext, block_id: BlockId) -> Self {
        let state = DrawerState {
            ctx: ctx.clone(),
            view: DrawerView::new(block_id),
            channel: None,
        };
        let handle = spawn_surface("drawer", &ctx.root, DrawerView::new(block_id), |task| {
            state.run(task)
        });
        Self { block_id, handle }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn view(&self) -> DrawerView {
        self.handle.view()
    }

    pub fn watch(&self) -> watch::Receiver<DrawerView> {
        self.handle.watch()
    }

    pub async fn wait_for(&self, predicate: impl FnMut(&DrawerView) -> bool) -> Result<DrawerView, SurfaceClosed> {
        self.handle.wait_for(predicate).await
    }

    /// Ask the service to start this block.
    pub async fn start(&self) -> Result<BlockStartAck, SessionError> {
        self.handle.request(|reply| DrawerCommand::Start { reply }).await?
    }

    pub async fn toggle_prime_first(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(DrawerCommand::TogglePrimeFirst).await
    }

    pub async fn select(&self, p: Exponent) -> Result<(), SurfaceClosed> {
        self.handle.send(DrawerCommand::Select(p)).await
    }

    pub async fn retry(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(DrawerCommand::Retry).await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

struct DrawerState {
    ctx: SurfaceContext,
    view: DrawerView,
    channel: Option<LiveChannel>,
}

impl DrawerState {
    fn block_id(&self) -> BlockId {
        self.view.detail.progress.block_id
    }

    async fn run(mut self, task: SurfaceTask<DrawerView, DrawerCommand>) {
        let SurfaceTask {
            view: view_tx,
            mut commands,
            cancel,
        } = task;

        self.open(&cancel).await;
        publish(&view_tx, self.view.clone());

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &view_tx, &cancel).await,
                    None => break,
                },

                event = next_channel_event(&mut self.channel) => self.on_channel_event(event),
            }
            publish(&view_tx, self.view.clone());
        }

        close_channel(&mut self.channel).await;
        tracing::debug!(block_id = self.block_id(), "Block drawer closed");
    }

    async fn open(&mut self, cancel: &CancellationToken) {
        let id = self.block_id();
        close_channel(&mut self.channel).await;
        self.view.detail.progress.reopen();

        let seeded = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.ctx.service.block_detail(id) => result,
        };
        match seeded {
            Ok(detail) => {
                self.view.detail.apply_snapshot(&detail);
                if self.view.selected_p.is_none() {
                    self.view.selected_p = detail.exponents.first().map(|e| e.p);
                }
                self.view.refresh_visible();
                self.view.seed = LoadState::Loaded;
                tracing::debug!(block_id = id, exponents = detail.exponents.len(), "Drawer seeded");
            }
            Err(e) => {
                tracing::warn!(block_id = id, error = %e, "Drawer seed failed");
                self.view.seed = LoadState::from_error(&e);
            }
        }

        self.view.connection = ConnectionState::Connecting;
        match self.ctx.channels.open(ChannelSubject::Block(id), cancel).await {
            Ok(live) => {
                self.channel = Some(live);
                self.view.connection = ConnectionState::Live;
            }
            Err(ChannelError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(block_id = id, error = %e, "Drawer channel failed to open");
                self.view.connection = ConnectionState::Lost(e.to_string());
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Update(LiveUpdateEvent::Block(progress)) => {
                let report = self.view.detail.apply_event(&progress);
                if report.changed {
                    self.view.refresh_visible();
                }
                if report.terminal {
                    tracing::info!(block_id = self.block_id(), "Drawer block finished");
                    self.channel = None;
                    self.view.connection = ConnectionState::Closed;
                }
            }
            ChannelEvent::Update(LiveUpdateEvent::Job(_)) => {
                tracing::warn!(block_id = self.block_id(), "Job frame on a block channel, ignoring");
            }
            ChannelEvent::Closed { .. } => {
                self.channel = None;
                self.view.connection = ConnectionState::Closed;
            }
            ChannelEvent::Lost(reason) => {
                tracing::warn!(block_id = self.block_id(), reason = %reason, "Drawer channel lost");
                self.channel = None;
                self.view.connection = ConnectionState::Lost(reason);
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: DrawerCommand,
        view_tx: &watch::Sender<DrawerView>,
        cancel: &CancellationToken,
    ) {
        match cmd {
            DrawerCommand::Start { reply } => {
                let id = self.block_id();
                let result = self
                    .ctx
                    .service
                    .start_block(id, self.ctx.config.block_concurrency)
                    .await
                    .map_err(SessionError::from);
                if let Err(e) = &result {
                    tracing::warn!(block_id = id, error = %e, "Drawer start failed");
                }
                let _ = reply.send(result);
            }
            DrawerCommand::TogglePrimeFirst => {
                self.view.prime_first = !self.view.prime_first;
                self.view.refresh_visible();
            }
            DrawerCommand::Select(p) => {
                self.view.selected_p = Some(p);
            }
            DrawerCommand::Retry => {
                if self.channel.is_none() {
                    self.view.seed = LoadState::Loading;
                    publish(view_tx, self.view.clone());
                    self.open(cancel).await;
                }
            }
        }
    }
}
