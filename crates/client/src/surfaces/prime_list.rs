//! Found-primes list with per-prime digits generation.

use std::collections::HashMap;
use std::sync::Arc;

use llwatch_core::digits::validate_digits_exponent;
use llwatch_core::listing::{dedupe_latest, sort_primes, SortOrder};
use llwatch_core::models::{PrimeRow, SubmitDigits};
use llwatch_core::types::{Exponent, JobId};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{SessionError, SurfaceContext};
use crate::api::FetchError;
use crate::poller::{DigitsPolled, DigitsPolls, DigitsState};
use crate::refresh::{LoadState, PeriodicRefresh, RefreshEvent};
use crate::scope::{publish, spawn_surface, SurfaceClosed, SurfaceHandle, SurfaceTask};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimeEntry {
    pub row: PrimeRow,
    pub digits: DigitsState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrimeListView {
    /// One entry per exponent, in `order`.
    pub primes: Vec<PrimeEntry>,
    pub order: SortOrder,
    /// Total primes recorded by the service, if the count request succeeded.
    pub count: Option<u64>,
    pub load: LoadState,
    pub skipped_refreshes: u64,
}

pub enum PrimeListCommand {
    ToggleSort,
    GenerateDigits {
        p: Exponent,
        reply: oneshot::Sender<Result<JobId, SessionError>>,
    },
    Refresh,
}

/// One refresh: the recent rows plus the running total.
type Snapshot = (Vec<PrimeRow>, Option<u64>);

pub struct PrimeList {
    handle: SurfaceHandle<PrimeListView, PrimeListCommand>,
}

impl PrimeList {
    pub fn spawn(ctx: &SurfaceContext) -> Self {
        let state = PrimeListState {
            ctx: ctx.clone(),
            view: PrimeListView::default(),
            rows: Vec::new(),
            digits: HashMap::new(),
            polls: DigitsPolls::new(),
        };
        let handle = spawn_surface("prime_list", &ctx.root, PrimeListView::default(), |task| {
            state.run(task)
        });
        Self { handle }
    }

    pub fn view(&self) -> PrimeListView {
        self.handle.view()
    }

    pub fn watch(&self) -> watch::Receiver<PrimeListView> {
        self.handle.watch()
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&PrimeListView) -> bool,
    ) -> Result<PrimeListView, SurfaceClosed> {
        self.handle.wait_for(predicate).await
    }

    pub async fn toggle_sort(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(PrimeListCommand::ToggleSort).await
    }

    pub async fn generate_digits(&self, p: Exponent) -> Result<JobId, SessionError> {
        self.handle
            .request(|reply| PrimeListCommand::GenerateDigits { p, reply })
            .await?
    }

    pub async fn refresh(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(PrimeListCommand::Refresh).await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

struct PrimeListState {
    ctx: SurfaceContext,
    view: PrimeListView,
    /// De-duplicated rows from the last good refresh.
    rows: Vec<PrimeRow>,
    digits: HashMap<Exponent, DigitsState>,
    polls: DigitsPolls,
}

impl PrimeListState {
    async fn run(mut self, task: SurfaceTask<PrimeListView, PrimeListCommand>) {
        let SurfaceTask {
            view: view_tx,
            mut commands,
            cancel,
        } = task;
        let mut refresh: PeriodicRefresh<Snapshot> = PeriodicRefresh::new(self.ctx.config.prime_refresh);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(PrimeListCommand::ToggleSort) => {
                        self.view.order = self.view.order.toggled();
                        self.rebuild();
                    }
                    Some(PrimeListCommand::GenerateDigits { p, reply }) => {
                        let result = self.generate_digits(p, &cancel).await;
                        if let Err(e) = &result {
                            tracing::warn!(p, error = %e, "Digits request failed");
                        }
                        self.rebuild();
                        publish(&view_tx, self.view.clone());
                        let _ = reply.send(result);
                    }
                    Some(PrimeListCommand::Refresh) => self.trigger(&mut refresh),
                    None => break,
                },

                polled = self.polls.next() => self.on_digits(polled),

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
        self.polls.cancel_all();
        tracing::debug!("Prime list stopped");
    }

    fn trigger(&self, refresh: &mut PeriodicRefresh<Snapshot>) {
        let service = Arc::clone(&self.ctx.service);
        let limit = self.ctx.config.prime_list_limit;
        refresh.trigger(async move {
            let rows = service.recent_primes(limit).await?;
            let count = match service.prime_count().await {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::debug!(error = %e, "Prime count unavailable");
                    None
                }
            };
            Ok((rows, count))
        });
    }

    fn apply(&mut self, result: Result<Snapshot, FetchError>) {
        match result {
            Ok((rows, count)) => {
                self.rows = dedupe_latest(rows);
                if count.is_some() {
                    self.view.count = count;
                }
                self.view.load = LoadState::Loaded;
                self.rebuild();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Prime list refresh failed");
                self.view.load = LoadState::from_error(&e);
            }
        }
    }

    fn rebuild(&mut self) {
        let mut rows = self.rows.clone();
        sort_primes(&mut rows, self.view.order);
        self.view.primes = rows
            .into_iter()
            .map(|row| PrimeEntry {
                digits: self.digits.get(&row.p).cloned().unwrap_or_default(),
                row,
            })
            .collect();
    }

    async fn generate_digits(&mut self, p: Exponent, cancel: &CancellationToken) -> Result<JobId, SessionError> {
        validate_digits_exponent(p)?;
        if let Some(DigitsState::Preparing { job_id } | DigitsState::Ready { job_id, .. }) = self.digits.get(&p) {
            return Ok(job_id.clone());
        }

        let created = match self
            .ctx
            .service
            .submit_digits(&SubmitDigits { p, filename: None })
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.digits.insert(
                    p,
                    DigitsState::Failed {
                        job_id: None,
                        message: e.to_string(),
                    },
                );
                return Err(e.into());
            }
        };
        tracing::info!(p, job_id = %created.id, estimated_digits = created.estimated_digits, "Preparing digits");

        self.digits.insert(
            p,
            DigitsState::Preparing {
                job_id: created.id.clone(),
            },
        );
        self.polls.start(
            Arc::clone(&self.ctx.service),
            p,
            created.id.clone(),
            self.ctx.config.digits_poll,
            cancel,
        );
        Ok(created.id)
    }

    fn on_digits(&mut self, polled: DigitsPolled) {
        let state = DigitsState::from_outcome(self.ctx.service.as_ref(), polled.job_id, polled.outcome);
        self.digits.insert(polled.p, state);
        self.rebuild();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use llwatch_core::status::JobStatus;
    use llwatch_events::SelectionRegistry;

    use super::*;
    use crate::config::ClientConfig;
    use crate::fake::{artifact_job, descriptor, FakeService};

    fn row(p: Exponent, finished_at: f64) -> PrimeRow {
        PrimeRow {
            p,
            block_id: 0,
            digits: 1,
            finished_at: Some(finished_at),
            engine_info: None,
            ns_elapsed: None,
        }
    }

    fn list(service: Arc<FakeService>) -> PrimeList {
        let mut config = ClientConfig::new("http://127.0.0.1:9");
        config.digits_poll = Duration::from_millis(10);
        let ctx = SurfaceContext::with_service(service, config, Arc::new(SelectionRegistry::in_memory()))
            .unwrap();
        PrimeList::spawn(&ctx)
    }

    #[tokio::test]
    async fn rows_are_deduplicated_and_sorted() {
        let service = Arc::new(FakeService::default());
        *service.primes.lock().unwrap() = vec![row(127, 100.0), row(31, 5.0), row(127, 200.0)];
        let list = list(service);

        let view = list.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();
        let ps: Vec<_> = view.primes.iter().map(|e| e.row.p).collect();
        assert_eq!(ps, [31, 127]);
        assert_eq!(view.primes[1].row.finished_at, Some(200.0));
        assert_eq!(view.count, Some(3));

        list.toggle_sort().await.unwrap();
        let view = list.wait_for(|v| v.order == SortOrder::Descending).await.unwrap();
        let ps: Vec<_> = view.primes.iter().map(|e| e.row.p).collect();
        assert_eq!(ps, [127, 31]);
        list.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_last_rows() {
        let service = Arc::new(FakeService::default());
        *service.primes.lock().unwrap() = vec![row(31, 5.0)];
        let list = list(service.clone());
        list.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();

        *service.fail_next_list.lock().unwrap() = Some(500);
        list.refresh().await.unwrap();
        let view = list
            .wait_for(|v| matches!(v.load, LoadState::Failed(_)))
            .await
            .unwrap();
        assert_eq!(view.primes.len(), 1);
        assert_eq!(view.count, Some(1));

        service.primes.lock().unwrap().push(row(61, 9.0));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let view = list.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();
        assert_eq!(view.primes.len(), 2);
        assert_eq!(view.count, Some(2));
        list.shutdown().await;
    }

    #[tokio::test]
    async fn digits_move_from_preparing_to_ready() {
        let service = Arc::new(FakeService::default());
        *service.primes.lock().unwrap() = vec![row(127, 1.0)];
        *service.digits_replies.lock().unwrap() = vec![
            Ok(artifact_job("dig-1", JobStatus::Queued, None)),
            Ok(artifact_job("dig-1", JobStatus::Done, Some(descriptor("dig-1")))),
        ]
        .into();
        let list = list(service.clone());
        list.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();

        let job_id = list.generate_digits(127).await.unwrap();
        assert_eq!(job_id, "dig-1");
        // A second request reuses the job in flight.
        assert_eq!(list.generate_digits(127).await.unwrap(), "dig-1");

        let view = list
            .wait_for(|v| matches!(v.primes[0].digits, DigitsState::Ready { .. }))
            .await
            .unwrap();
        assert_matches!(&view.primes[0].digits, DigitsState::Ready { download_url, .. } => {
            assert_eq!(download_url, "http://fake/digits/dig-1/download");
        });
        let submits = service.calls().iter().filter(|c| c.starts_with("submit_digits")).count();
        assert_eq!(submits, 1);
        list.shutdown().await;
    }

    #[tokio::test]
    async fn submit_failure_marks_entry_failed() {
        let service = Arc::new(FakeService::default());
        *service.primes.lock().unwrap() = vec![row(61, 1.0)];
        *service.reject_next.lock().unwrap() = Some(413);
        let list = list(service);
        list.wait_for(|v| v.load == LoadState::Loaded).await.unwrap();

        assert_matches!(list.generate_digits(61).await, Err(SessionError::Fetch(_)));
        let view = list
            .wait_for(|v| matches!(v.primes[0].digits, DigitsState::Failed { .. }))
            .await
            .unwrap();
        assert_matches!(view.primes[0].digits, DigitsState::Failed { job_id: None, .. });
        list.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_exponent_is_rejected_locally() {
        let service = Arc::new(FakeService::default());
        let list = list(service.clone());
        assert_matches!(list.generate_digits(100_000_000).await, Err(SessionError::Invalid(_)));
        assert!(!service.calls().iter().any(|c| c.starts_with("submit_digits")));
        list.shutdown().await;
    }
}
