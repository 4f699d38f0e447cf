//! Grid of recent blocks, refreshed on a fixed period.

use std::collections::HashMap;
use std::sync::Arc;

use llwatch_core::models::{BlockStartAck, TrackedBlock};
use llwatch_core::reconcile::BlockView;
use llwatch_core::types::BlockId;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};

use super::{SessionError, SurfaceContext};
use crate::api::FetchError;
use crate::refresh::{LoadState, PeriodicRefresh, RefreshEvent};
use crate::scope::{publish, spawn_surface, SurfaceClosed, SurfaceHandle, SurfaceTask};

/// One block in the grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridTile {
    pub block: TrackedBlock,
    /// Merged progress; never moves backwards within a run.
    pub progress: BlockView,
}

impl GridTile {
    pub fn coverage_pct(&self) -> u8 {
        self.progress.coverage_pct()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GridView {
    pub tiles: Vec<GridTile>,
    pub load: LoadState,
    /// Currently selected block, for highlighting.
    pub active: Option<BlockId>,
    /// Refresh ticks skipped because a fetch was still running.
    pub skipped_refreshes: u64,
}

pub enum GridCommand {
    /// Start a block, then make it the active one.
    Start {
        block_id: BlockId,
        reply: oneshot::Sender<Result<BlockStartAck, SessionError>>,
    },
    /// Fetch now instead of waiting for the next tick.
    Refresh,
}

pub struct BlockGrid {
    handle: SurfaceHandle<GridView, GridCommand>,
}

impl BlockGrid {
    pub fn spawn(ctx: &SurfaceContext) -> Self {
        let state = GridState {
            ctx: ctx.clone(),
            view: GridView::default(),
            progress: HashMap::new(),
        };
        let handle = spawn_surface("block_grid", &ctx.root, GridView::default(), |task| state.run(task));
        Self { handle }
    }

    pub fn view(&self) -> GridView {
        self.handle.view()
    }

    pub fn watch(&self) -> watch::Receiver<GridView> {
        self.handle.watch()
    }

    pub async fn wait_for(&self, predicate: impl FnMut(&GridView) -> bool) -> Result<GridView, SurfaceClosed> {
        self.handle.wait_for(predicate).await
    }

    pub async fn start(&self, block_id: BlockId) -> Result<BlockStartAck, SessionError> {
        self.handle
            .request(|reply| GridCommand::Start { block_id, reply })
            .await?
    }

    pub async fn refresh(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(GridCommand::Refresh).await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

struct GridState {
    ctx: SurfaceContext,
    view: GridView,
    /// Per-block merged progress, kept across refreshes.
    progress: HashMap<BlockId, BlockView>,
}

impl GridState {
    async fn run(mut self, task: SurfaceTask<GridView, GridCommand>) {
        let SurfaceTask {
            view: view_tx,
            mut commands,
            cancel,
        } = task;
        let mut refresh: PeriodicRefresh<Vec<TrackedBlock>> = PeriodicRefresh::new(self.ctx.config.block_refresh);
        let mut selection = self.ctx.registry.subscribe();
        self.view.active = self.ctx.registry.get();

        tracing::info!(
            period_ms = self.ctx.config.block_refresh.as_millis() as u64,
            "Block grid started",
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(GridCommand::Start { block_id, reply }) => {
                        let _ = reply.send(self.start(block_id).await);
                    }
                    Some(GridCommand::Refresh) => {
                        self.trigger(&mut refresh);
                    }
                    None => break,
                },

                change = selection.recv() => match change {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.view.active = self.ctx.registry.get();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                event = refresh.next() => {
                    match event {
                        RefreshEvent::Tick => self.trigger(&mut refresh),
                        RefreshEvent::Completed(Some(result)) => self.apply(result),
                        RefreshEvent::Completed(None) => {}
                    }
                    self.view.skipped_refreshes = refresh.skipped();
                }
            }
            publish(&view_tx, self.view.clone());
        }

        refresh.abort();
        tracing::debug!("Block grid stopped");
    }

    fn trigger(&self, refresh: &mut PeriodicRefresh<Vec<TrackedBlock>>) {
        let service = Arc::clone(&self.ctx.service);
        let limit = self.ctx.config.block_list_limit;
        refresh.trigger(async move { service.list_blocks(limit).await });
    }

    fn apply(&mut self, result: Result<Vec<TrackedBlock>, FetchError>) {
        let blocks = match result {
            Ok(blocks) => blocks,
            Err(e) => {
                // Keep the last good tiles on screen.
                tracing::warn!(error = %e, "Block list refresh failed");
                self.view.load = LoadState::from_error(&e);
                return;
            }
        };

        self.progress.retain(|id, _| blocks.iter().any(|b| b.id == *id));
        self.view.tiles = blocks
            .into_iter()
            .map(|block| {
                let progress = self
                    .progress
                    .entry(block.id)
                    .or_insert_with(|| BlockView::new(block.id));
                let report = progress.apply_snapshot(&block);
                if report.new_run {
                    tracing::info!(block_id = block.id, run = progress.run, "Block restarted");
                }
                GridTile {
                    progress: progress.clone(),
                    block,
                }
            })
            .collect();
        self.view.load = LoadState::Loaded;
    }

    async fn start(&self, block_id: BlockId) -> Result<BlockStartAck, SessionError> {
        let ack = self
            .ctx
            .service
            .start_block(block_id, self.ctx.config.block_concurrency)
            .await
            .map_err(|e| {
                tracing::warn!(block_id, error = %e, "Block start failed");
                SessionError::from(e)
            })?;
        // Selecting the block hands it to whichever panel follows the selection.
        self.ctx.registry.set(block_id);
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use llwatch_core::status::BlockStatus;
    use llwatch_events::SelectionRegistry;

    use super::*;
    use crate::config::ClientConfig;
    use crate::fake::{block, FakeService};

    fn grid(service: Arc<FakeService>) -> (SurfaceContext, BlockGrid) {
        let ctx = SurfaceContext::with_service(
            service,
            ClientConfig::new("http://127.0.0.1:9"),
            Arc::new(SelectionRegistry::in_memory()),
        )
        .unwrap();
        let grid = BlockGrid::spawn(&ctx);
        (ctx, grid)
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_period() {
        let service = Arc::new(FakeService::default());
        *service.blocks.lock().unwrap() = vec![block(0, 10, 100, BlockStatus::Running)];
        let (_ctx, grid) = grid(service.clone());

        let view = grid.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();
        assert_eq!(view.tiles.len(), 1);
        assert_eq!(view.tiles[0].coverage_pct(), 10);

        *service.blocks.lock().unwrap() = vec![block(0, 50, 100, BlockStatus::Running)];
        tokio::time::sleep(Duration::from_millis(1600)).await;
        let view = grid.wait_for(|v| v.tiles[0].coverage_pct() == 50).await.unwrap();
        assert_eq!(view.tiles[0].progress.tested, Some(50));

        let fetches = service.calls().iter().filter(|c| *c == "list_blocks 6").count();
        assert_eq!(fetches, 2);
        grid.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_tiles_until_next_tick() {
        let service = Arc::new(FakeService::default());
        *service.blocks.lock().unwrap() = vec![block(3, 10, 100, BlockStatus::Running)];
        let (_ctx, grid) = grid(service.clone());
        grid.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();

        *service.fail_next_list.lock().unwrap() = Some(503);
        grid.refresh().await.unwrap();
        let view = grid
            .wait_for(|v| matches!(v.load, LoadState::Failed(_)))
            .await
            .unwrap();
        assert_eq!(view.tiles.len(), 1);
        assert_eq!(view.tiles[0].coverage_pct(), 10);

        *service.blocks.lock().unwrap() = vec![block(3, 40, 100, BlockStatus::Running)];
        tokio::time::sleep(Duration::from_millis(1600)).await;
        let view = grid.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();
        assert_eq!(view.tiles[0].progress.tested, Some(40));
        grid.shutdown().await;
    }

    #[tokio::test]
    async fn start_selects_block() {
        let service = Arc::new(FakeService::default());
        let (ctx, grid) = grid(service.clone());
        let mut selection = ctx.registry.subscribe();

        grid.start(4).await.unwrap();

        assert_eq!(ctx.registry.get(), Some(4));
        assert_eq!(selection.recv().await.unwrap().active, Some(4));
        assert!(service.calls().contains(&"start_block 4".to_string()));
        grid.wait_for(|v| v.active == Some(4)).await.unwrap();
        grid.shutdown().await;
    }

    #[tokio::test]
    async fn failed_start_does_not_select() {
        let service = Arc::new(FakeService::default());
        *service.reject_next.lock().unwrap() = Some(409);
        let (ctx, grid) = grid(service);

        assert!(matches!(grid.start(4).await, Err(SessionError::Fetch(_))));
        assert_eq!(ctx.registry.get(), None);
        grid.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_block_resets_progress() {
        let service = Arc::new(FakeService::default());
        *service.blocks.lock().unwrap() = vec![block(1, 900, 1000, BlockStatus::Stopped)];
        let (_ctx, grid) = grid(service.clone());
        grid.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();

        *service.blocks.lock().unwrap() = vec![block(1, 0, 1000, BlockStatus::Running)];
        grid.refresh().await.unwrap();
        let view = grid.wait_for(|v| v.tiles[0].progress.run == 1).await.unwrap();
        assert_eq!(view.tiles[0].coverage_pct(), 0);
        grid.shutdown().await;
    }
}
