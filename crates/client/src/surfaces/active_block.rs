//! Floating panel that follows whichever block is currently selected.
//!
//! The panel never receives a block id from its caller. It reads the
//! [`SelectionRegistry`](llwatch_events::SelectionRegistry) at start and
//! again on every selection notification, seeds the view from a snapshot,
//! then opens the block's channel. When the block reports `done` the panel
//! closes the channel, keeps the final view, and clears the selection.

use llwatch_core::live::LiveUpdateEvent;
use llwatch_core::reconcile::BlockView;
use llwatch_core::types::BlockId;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{close_channel, next_channel_event, ConnectionState, SessionError, SurfaceContext};
use crate::channel::{ChannelError, ChannelEvent, ChannelSubject, LiveChannel};
use crate::refresh::LoadState;
use crate::scope::{publish, spawn_surface, SurfaceClosed, SurfaceHandle, SurfaceTask};

/// What the panel shows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PanelView {
    /// `None` while hidden.
    pub block: Option<BlockView>,
    pub connection: ConnectionState,
    pub seed: LoadState,
}

impl PanelView {
    pub fn is_hidden(&self) -> bool {
        self.block.is_none()
    }
}

pub enum PanelCommand {
    /// Ask the service to stop the block, then hide.
    Stop {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Close the channel, clear the selection, reset the view.
    Hide,
    /// Reseed and reopen after a lost connection.
    Retry,
}

/// Handle to the running panel.
pub struct ActiveBlockPanel {
    handle: SurfaceHandle<PanelView, PanelCommand>,
}

impl ActiveBlockPanel {
    pub fn spawn(ctx: &SurfaceContext) -> Self {
        let state = PanelState {
            ctx: ctx.clone(),
            view: PanelView::default(),
            followed: None,
            channel: None,
        };
        let handle = spawn_surface("active_block", &ctx.root, PanelView::default(), |task| {
            state.run(task)
        });
        Self { handle }
    }

    pub fn view(&self) -> PanelView {
        self.handle.view()
    }

    pub fn watch(&self) -> watch::Receiver<PanelView> {
        self.handle.watch()
    }

    pub async fn wait_for(&self, predicate: impl FnMut(&PanelView) -> bool) -> Result<PanelView, SurfaceClosed> {
        self.handle.wait_for(predicate).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.handle.request(|reply| PanelCommand::Stop { reply }).await?
    }

    pub async fn hide(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(PanelCommand::Hide).await
    }

    pub async fn retry(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(PanelCommand::Retry).await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

struct PanelState {
    ctx: SurfaceContext,
    view: PanelView,
    /// Block whose channel this panel owns or is about to open.
    followed: Option<BlockId>,
    channel: Option<LiveChannel>,
}

impl PanelState {
    async fn run(mut self, task: SurfaceTask<PanelView, PanelCommand>) {
        let SurfaceTask {
            view: view_tx,
            mut commands,
            cancel,
        } = task;
        let mut selection = self.ctx.registry.subscribe();

        if let Some(id) = self.ctx.registry.get() {
            self.follow(id, &view_tx, &cancel).await;
            publish(&view_tx, self.view.clone());
        }

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &view_tx, &cancel).await,
                    None => break,
                },

                change = selection.recv() => match change {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.reevaluate(&view_tx, &cancel).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                event = next_channel_event(&mut self.channel) => self.on_channel_event(event),
            }
            publish(&view_tx, self.view.clone());
        }

        close_channel(&mut self.channel).await;
        tracing::debug!("Active block panel stopped");
    }

    /// Re-read the selection and converge on it.
    async fn reevaluate(&mut self, view_tx: &watch::Sender<PanelView>, cancel: &CancellationToken) {
        match (self.ctx.registry.get(), self.followed) {
            // Same block while connected: nothing to do.
            (Some(id), Some(followed)) if id == followed && self.channel.is_some() => {}
            (Some(id), _) => self.follow(id, view_tx, cancel).await,
            (None, Some(_)) => self.unfollow().await,
            (None, None) => {}
        }
    }

    /// Switch to `id`: close the old channel, seed, then open the new one.
    async fn follow(&mut self, id: BlockId, view_tx: &watch::Sender<PanelView>, cancel: &CancellationToken) {
        close_channel(&mut self.channel).await;
        self.followed = Some(id);

        // A restarted block keeps its view so the reconciler can spot the new run.
        match self.view.block.as_mut() {
            Some(block) if block.block_id == id => {
                if block.reopen() {
                    tracing::debug!(block_id = id, "Following a finished block again");
                }
            }
            _ => self.view.block = Some(BlockView::new(id)),
        }
        self.view.seed = LoadState::Loading;
        self.view.connection = ConnectionState::Connecting;
        publish(view_tx, self.view.clone());

        let seeded = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.ctx.service.block_detail(id) => result,
        };
        match seeded {
            Ok(detail) => {
                if let Some(block) = self.view.block.as_mut() {
                    let report = block.apply_snapshot(&detail.block);
                    tracing::debug!(block_id = id, new_run = report.new_run, "Active block seeded");
                }
                self.view.seed = LoadState::Loaded;
            }
            Err(e) => {
                tracing::warn!(block_id = id, error = %e, "Active block seed failed");
                self.view.seed = LoadState::from_error(&e);
            }
        }

        // The selection may have moved on while the seed was in flight.
        if self.ctx.registry.get() != Some(id) {
            tracing::debug!(block_id = id, "Selection changed during seed, not opening channel");
            return;
        }

        match self.ctx.channels.open(ChannelSubject::Block(id), cancel).await {
            Ok(live) => {
                self.channel = Some(live);
                self.view.connection = ConnectionState::Live;
            }
            Err(ChannelError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(block_id = id, error = %e, "Active block channel failed to open");
                self.view.connection = ConnectionState::Lost(e.to_string());
            }
        }
    }

    /// Selection cleared elsewhere. A finished view stays on screen.
    async fn unfollow(&mut self) {
        close_channel(&mut self.channel).await;
        self.followed = None;
        let finished = self.view.block.as_ref().is_some_and(|b| b.finished);
        if finished {
            self.view.connection = ConnectionState::Closed;
        } else {
            self.view = PanelView::default();
        }
    }

    async fn hide(&mut self) {
        close_channel(&mut self.channel).await;
        self.followed = None;
        self.view = PanelView::default();
        self.ctx.registry.clear();
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Update(LiveUpdateEvent::Block(progress)) => {
                let Some(block) = self.view.block.as_mut() else {
                    return;
                };
                let report = block.apply_event(&progress);
                if report.stale {
                    tracing::debug!(block_id = block.block_id, "Dropped stale values from block frame");
                }
                if report.terminal {
                    let id = block.block_id;
                    tracing::info!(block_id = id, coverage = block.coverage_pct(), "Block finished");
                    // The reader closes with 1000 after forwarding `done`;
                    // dropping the channel here only releases it.
                    self.channel = None;
                    self.followed = None;
                    self.view.connection = ConnectionState::Closed;
                    if self.ctx.registry.get() == Some(id) {
                        self.ctx.registry.clear();
                    }
                }
            }
            ChannelEvent::Update(LiveUpdateEvent::Job(_)) => {
                tracing::warn!("Job frame on a block channel, ignoring");
            }
            ChannelEvent::Closed { code, reason } => {
                tracing::info!(?code, reason = %reason, "Active block channel closed");
                self.channel = None;
                self.view.connection = ConnectionState::Closed;
            }
            ChannelEvent::Lost(reason) => {
                tracing::warn!(reason = %reason, "Active block channel lost");
                self.channel = None;
                self.view.connection = ConnectionState::Lost(reason);
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: PanelCommand,
        view_tx: &watch::Sender<PanelView>,
        cancel: &CancellationToken,
    ) {
        match cmd {
            PanelCommand::Stop { reply } => {
                let result = match self.followed.or(self.view.block.as_ref().map(|b| b.block_id)) {
                    Some(id) => match self.ctx.service.stop_block(id).await {
                        Ok(()) => {
                            self.hide().await;
                            Ok(())
                        }
                        Err(e) => {
                            tracing::warn!(block_id = id, error = %e, "Stop request failed");
                            Err(SessionError::from(e))
                        }
                    },
                    None => Err(SessionError::NotReady("no active block".into())),
                };
                publish(view_tx, self.view.clone());
                let _ = reply.send(result);
            }
            PanelCommand::Hide => self.hide().await,
            PanelCommand::Retry => {
                let target = self.followed.or(self.view.block.as_ref().map(|b| b.block_id));
                match target {
                    Some(id) if self.channel.is_none() => {
                        tracing::info!(block_id = id, "Retrying active block channel");
                        self.follow(id, view_tx, cancel).await;
                    }
                    Some(_) => {}
                    None => tracing::debug!("Retry with nothing to follow"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use llwatch_core::models::BlockDetail;
    use llwatch_core::status::BlockStatus;
    use llwatch_events::SelectionRegistry;

    use super::*;
    use crate::config::ClientConfig;
    use crate::fake::{block, FakeService};

    fn context(service: Arc<FakeService>) -> SurfaceContext {
        // Nothing listens on port 9, so channels fail to open.
        SurfaceContext::with_service(
            service,
            ClientConfig::new("http://127.0.0.1:9"),
            Arc::new(SelectionRegistry::in_memory()),
        )
        .unwrap()
    }

    fn service_with_block(id: BlockId) -> Arc<FakeService> {
        let service = Arc::new(FakeService::default());
        service.details.lock().unwrap().insert(
            id,
            BlockDetail {
                block: block(id, 200, 1000, BlockStatus::Running),
                exponents: vec![],
            },
        );
        service
    }

    #[tokio::test]
    async fn hidden_without_selection() {
        let ctx = context(Arc::new(FakeService::default()));
        let panel = ActiveBlockPanel::spawn(&ctx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(panel.view().is_hidden());
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn follows_selection_set_elsewhere() {
        let service = service_with_block(3);
        let ctx = context(service.clone());
        let panel = ActiveBlockPanel::spawn(&ctx);

        ctx.registry.set(3);
        let view = panel
            .wait_for(|v| matches!(v.connection, ConnectionState::Lost(_)))
            .await
            .unwrap();

        let block = view.block.unwrap();
        assert_eq!(block.block_id, 3);
        assert_eq!(block.tested, Some(200));
        assert_eq!(view.seed, LoadState::Loaded);
        assert!(service.calls().contains(&"block_detail 3".to_string()));
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn stop_posts_then_hides_and_clears_selection() {
        let service = service_with_block(5);
        let ctx = context(service.clone());
        ctx.registry.set(5);
        let panel = ActiveBlockPanel::spawn(&ctx);
        panel.wait_for(|v| v.seed == LoadState::Loaded).await.unwrap();

        panel.stop().await.unwrap();

        assert!(panel.view().is_hidden());
        assert_eq!(ctx.registry.get(), None);
        assert!(service.calls().contains(&"stop_block 5".to_string()));
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn stop_failure_keeps_panel() {
        let service = service_with_block(5);
        *service.reject_next.lock().unwrap() = Some(500);
        let ctx = context(service);
        ctx.registry.set(5);
        let panel = ActiveBlockPanel::spawn(&ctx);
        panel.wait_for(|v| v.seed == LoadState::Loaded).await.unwrap();

        assert!(matches!(panel.stop().await, Err(SessionError::Fetch(_))));
        assert!(!panel.view().is_hidden());
        assert_eq!(ctx.registry.get(), Some(5));
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn seed_failure_is_reported_not_fatal() {
        let ctx = context(Arc::new(FakeService::default()));
        ctx.registry.set(77);
        let panel = ActiveBlockPanel::spawn(&ctx);
        let view = panel
            .wait_for(|v| matches!(v.seed, LoadState::Failed(_)))
            .await
            .unwrap();
        assert_eq!(view.block.map(|b| b.block_id), Some(77));
        panel.shutdown().await;
    }
}
