//! Lifetime plumbing shared by all surfaces.
//!
//! Each surface runs as one tokio task that owns its state. The outside
//! world talks to it through a [`SurfaceHandle`]: commands go in over an
//! `mpsc` channel and view snapshots come out over a `watch` channel.
//! Dropping the handle cancels the task's token, which makes the task close
//! any channel it holds and exit.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Queued commands per surface.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// How long [`SurfaceHandle::shutdown`] waits for the task to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The surface task has exited and no longer accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Surface {0} is no longer running")]
pub struct SurfaceClosed(pub &'static str);

/// The task side of a surface: where it publishes views and reads commands.
pub struct SurfaceTask<V, C> {
    pub view: watch::Sender<V>,
    pub commands: mpsc::Receiver<C>,
    pub cancel: CancellationToken,
}

/// The owner side of a running surface.
pub struct SurfaceHandle<V, C> {
    name: &'static str,
    view: watch::Receiver<V>,
    commands: mpsc::Sender<C>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Spawn a surface loop under `parent`.
///
/// `run` receives the task side and must return when its token is
/// cancelled.
pub fn spawn_surface<V, C, F, Fut>(
    name: &'static str,
    parent: &CancellationToken,
    initial: V,
    run: F,
) -> SurfaceHandle<V, C>
where
    V: Send + Sync + 'static,
    C: Send + 'static,
    F: FnOnce(SurfaceTask<V, C>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (view_tx, view_rx) = watch::channel(initial);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let cancel = parent.child_token();

    let task = tokio::spawn(run(SurfaceTask {
        view: view_tx,
        commands: cmd_rx,
        cancel: cancel.clone(),
    }));
    tracing::debug!(surface = name, "Surface started");

    SurfaceHandle {
        name,
        view: view_rx,
        commands: cmd_tx,
        cancel,
        task: Some(task),
    }
}

impl<V: Clone, C> SurfaceHandle<V, C> {
    /// Copy of the latest published view.
    pub fn view(&self) -> V {
        self.view.borrow().clone()
    }

    /// A receiver for following view changes.
    pub fn watch(&self) -> watch::Receiver<V> {
        self.view.clone()
    }

    /// Wait until the published view satisfies `predicate`, returning it.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&V) -> bool) -> Result<V, SurfaceClosed> {
        let mut rx = self.view.clone();
        let view = rx
            .wait_for(|v| predicate(v))
            .await
            .map_err(|_| SurfaceClosed(self.name))?;
        Ok(view.clone())
    }

    /// Queue a command without waiting for it to be handled.
    pub async fn send(&self, command: C) -> Result<(), SurfaceClosed> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SurfaceClosed(self.name))
    }

    /// Send a command carrying a reply slot and wait for the answer.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> C,
    ) -> Result<T, SurfaceClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SurfaceClosed(self.name))
    }

    /// Cancel the surface and wait for its task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => tracing::debug!(surface = self.name, "Surface stopped"),
                Ok(Err(e)) => tracing::error!(surface = self.name, error = %e, "Surface task failed"),
                Err(_) => tracing::warn!(surface = self.name, "Surface did not stop in time"),
            }
        }
    }
}

impl<V, C> Drop for SurfaceHandle<V, C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publish a new view only if it differs from the current one.
pub fn publish<V: PartialEq>(tx: &watch::Sender<V>, view: V) {
    tx.send_if_modified(|current| {
        if *current == view {
            false
        } else {
            *current = view;
            true
        }
    });
}
