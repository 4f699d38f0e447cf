//! Fixed-period refresh with at most one request in flight.
//!
//! A surface owns a [`PeriodicRefresh`] and drives it from its `select!`
//! loop through [`next`](PeriodicRefresh::next): on every tick it calls
//! [`trigger`](PeriodicRefresh::trigger), and finished fetches come back as
//! [`RefreshEvent::Completed`]. A trigger that arrives while the previous
//! fetch is still running is skipped and counted.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::api::FetchError;

/// Loading state of a snapshot-backed view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Loading,
    Loaded,
    Failed(String),
}

impl LoadState {
    pub fn from_error(error: &FetchError) -> Self {
        Self::Failed(error.to_string())
    }
}

/// What [`PeriodicRefresh::next`] observed.
#[derive(Debug)]
pub enum RefreshEvent<T> {
    /// A period boundary; the owner decides whether to trigger.
    Tick,
    /// The in-flight fetch finished. `None` if its task panicked or was aborted.
    Completed(Option<Result<T, FetchError>>),
}

/// Periodic fetch scheduler owned by one surface loop.
pub struct PeriodicRefresh<T> {
    ticker: Interval,
    in_flight: Option<JoinHandle<Result<T, FetchError>>>,
    skipped: u64,
}

impl<T: Send + 'static> PeriodicRefresh<T> {
    /// The first tick completes immediately.
    pub fn new(period: Duration) -> Self {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            in_flight: None,
            skipped: 0,
        }
    }

    /// Start `fetch` unless one is already running.
    ///
    /// Returns `false` when the trigger was skipped.
    pub fn trigger<F>(&mut self, fetch: F) -> bool
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if self.in_flight.is_some() {
            self.skipped += 1;
            tracing::trace!(skipped = self.skipped, "Refresh skipped, previous fetch in flight");
            return false;
        }
        self.in_flight = Some(tokio::spawn(fetch));
        true
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of triggers skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Wait for whichever comes first: a finished fetch or the next tick.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to other branches.
    pub async fn next(&mut self) -> RefreshEvent<T> {
        tokio::select! {
            biased;
            joined = join_in_flight(&mut self.in_flight) => RefreshEvent::Completed(joined),
            _ = self.ticker.tick() => RefreshEvent::Tick,
        }
    }

    /// Drop the in-flight fetch, if any. Its result is never delivered.
    pub fn abort(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

/// Pending forever when nothing runs.
async fn join_in_flight<T>(
    slot: &mut Option<JoinHandle<Result<T, FetchError>>>,
) -> Option<Result<T, FetchError>> {
    let Some(handle) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *slot = None;
    match joined {
        Ok(result) => Some(result),
        Err(e) => {
            tracing::error!(error = %e, "Refresh task did not complete");
            None
        }
    }
}

impl<T> Drop for PeriodicRefresh<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}
