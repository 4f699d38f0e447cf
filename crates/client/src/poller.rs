//! Completion poller for digits artifact jobs.
//!
//! Polls `GET /digits/{id}` right away and then at a fixed interval until
//! the job is `done` with an artifact descriptor, the job reports `error`,
//! or the caller cancels. Transport hiccups and 5xx responses are retried on
//! the next tick; a 404 or an unreadable body ends polling with a failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use llwatch_core::models::ArtifactDescriptor;
use llwatch_core::status::JobStatus;
use llwatch_core::types::{Exponent, JobId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ComputeService;

/// Why polling ended without an artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The job itself reported `error`.
    #[error("{0}")]
    JobFailed(String),

    /// The status endpoint answered in a way retrying cannot fix.
    #[error("Status request failed: {0}")]
    Fetch(String),
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready(ArtifactDescriptor),
    Failed(PollError),
}

/// Per-prime state of a digits artifact request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DigitsState {
    #[default]
    Idle,
    Preparing {
        job_id: JobId,
    },
    Ready {
        job_id: JobId,
        artifact: ArtifactDescriptor,
        download_url: String,
    },
    Failed {
        job_id: Option<JobId>,
        message: String,
    },
}

impl DigitsState {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Preparing { job_id } | Self::Ready { job_id, .. } => Some(job_id),
            Self::Failed { job_id, .. } => job_id.as_deref(),
        }
    }

    pub fn is_preparing(&self) -> bool {
        matches!(self, Self::Preparing { .. })
    }

    /// Final state after polling `job_id`.
    pub fn from_outcome(service: &dyn ComputeService, job_id: JobId, outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::Ready(artifact) => Self::Ready {
                download_url: service.download_url(&job_id),
                job_id,
                artifact,
            },
            PollOutcome::Failed(error) => Self::Failed {
                job_id: Some(job_id),
                message: error.to_string(),
            },
        }
    }
}

/// A finished poll, as reported back to the owning surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitsPolled {
    pub p: Exponent,
    pub job_id: JobId,
    pub outcome: PollOutcome,
}

/// Poll until the job settles. Returns `None` if cancelled first.
pub async fn poll_artifact(
    service: &dyn ComputeService,
    job_id: &str,
    interval: Duration,
    cancel: &CancellationToken,
) -> Option<PollOutcome> {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(job_id, attempt, "Digits poll cancelled");
                return None;
            }
            status = service.digits_status(job_id) => status,
        };

        match status {
            Ok(job) => match job.status {
                JobStatus::Done => match job.artifact {
                    Some(artifact) => {
                        tracing::info!(
                            job_id,
                            attempt,
                            filename = %artifact.filename,
                            size_bytes = artifact.size_bytes,
                            "Digits artifact ready",
                        );
                        return Some(PollOutcome::Ready(artifact));
                    }
                    None => {
                        tracing::debug!(job_id, attempt, "Digits job done but artifact not yet attached");
                    }
                },
                JobStatus::Error => {
                    let message = job.error.unwrap_or_else(|| "digits job failed".to_string());
                    tracing::warn!(job_id, error = %message, "Digits job failed");
                    return Some(PollOutcome::Failed(PollError::JobFailed(message)));
                }
                JobStatus::Queued | JobStatus::Running | JobStatus::Unknown => {
                    tracing::trace!(job_id, attempt, status = job.status.as_str(), "Digits job pending");
                }
            },
            Err(e) if e.is_transient() => {
                tracing::warn!(job_id, attempt, error = %e, "Digits poll failed, retrying");
            }
            Err(e) => {
                tracing::error!(job_id, attempt, error = %e, "Digits poll failed");
                return Some(PollOutcome::Failed(PollError::Fetch(e.to_string())));
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(job_id, attempt, "Digits poll cancelled");
                return None;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Digits polls owned by one surface, at most one per exponent.
///
/// Each poll runs as its own task under a child token and reports back
/// through [`next`](Self::next). Results for a poll that was cancelled or
/// replaced in the meantime are filtered out.
pub(crate) struct DigitsPolls {
    active: HashMap<Exponent, (JobId, CancellationToken)>,
    tx: mpsc::Sender<DigitsPolled>,
    rx: mpsc::Receiver<DigitsPolled>,
}

impl DigitsPolls {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            active: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Start polling `job_id` for `p`, replacing any earlier poll for `p`.
    pub fn start(
        &mut self,
        service: Arc<dyn ComputeService>,
        p: Exponent,
        job_id: JobId,
        interval: Duration,
        parent: &CancellationToken,
    ) {
        self.cancel(p);
        let token = parent.child_token();
        self.active.insert(p, (job_id.clone(), token.clone()));

        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Some(outcome) = poll_artifact(service.as_ref(), &job_id, interval, &token).await {
                let _ = tx.send(DigitsPolled { p, job_id, outcome }).await;
            }
        });
    }

    /// Next result from a poll that is still wanted. Never resolves while
    /// nothing is being polled.
    pub async fn next(&mut self) -> DigitsPolled {
        loop {
            let Some(polled) = self.rx.recv().await else {
                return std::future::pending().await;
            };
            match self.active.get(&polled.p) {
                Some((job_id, _)) if *job_id == polled.job_id => {
                    self.active.remove(&polled.p);
                    return polled;
                }
                _ => tracing::debug!(p = polled.p, job_id = %polled.job_id, "Discarding superseded digits poll"),
            }
        }
    }

    pub fn is_polling(&self, p: Exponent) -> bool {
        self.active.contains_key(&p)
    }

    pub fn cancel(&mut self, p: Exponent) {
        if let Some((_, token)) = self.active.remove(&p) {
            token.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, token)) in self.active.drain() {
            token.cancel();
        }
    }
}

impl Drop for DigitsPolls {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::api::FetchError;
    use crate::fake::{artifact_job, descriptor, FakeService};

    fn scripted(replies: Vec<Result<llwatch_core::models::ArtifactJob, FetchError>>) -> FakeService {
        let service = FakeService::default();
        *service.digits_replies.lock().unwrap() = replies.into();
        service
    }

    fn polls(service: &FakeService) -> usize {
        service
            .calls()
            .iter()
            .filter(|c| c.starts_with("digits_status"))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_artifact_attached() {
        let service = scripted(vec![
            Ok(artifact_job("d1", JobStatus::Queued, None)),
            Ok(artifact_job("d1", JobStatus::Running, None)),
            Ok(artifact_job("d1", JobStatus::Running, None)),
            Ok(artifact_job("d1", JobStatus::Done, None)),
            Ok(artifact_job("d1", JobStatus::Done, Some(descriptor("d1")))),
        ]);
        let started = tokio::time::Instant::now();

        let outcome = poll_artifact(
            &service,
            "d1",
            Duration::from_millis(800),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Some(PollOutcome::Ready(descriptor("d1"))));
        assert_eq!(polls(&service), 5);
        // First poll is immediate, then four intervals.
        assert_eq!(started.elapsed(), Duration::from_millis(3200));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let service = scripted(vec![
            Err(FetchError::Rejected {
                status: 502,
                body: "bad gateway".into(),
            }),
            Ok(artifact_job("d1", JobStatus::Done, Some(descriptor("d1")))),
        ]);
        let outcome = poll_artifact(
            &service,
            "d1",
            Duration::from_millis(800),
            &CancellationToken::new(),
        )
        .await;
        assert_matches!(outcome, Some(PollOutcome::Ready(_)));
        assert_eq!(polls(&service), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_and_job_error_end_polling() {
        let service = scripted(vec![Err(FetchError::NotFound {
            url: "/digits/d1".into(),
        })]);
        let outcome =
            poll_artifact(&service, "d1", Duration::from_millis(800), &CancellationToken::new()).await;
        assert_matches!(outcome, Some(PollOutcome::Failed(PollError::Fetch(_))));

        let mut failed = artifact_job("d1", JobStatus::Error, None);
        failed.error = Some("disk full".into());
        let service = scripted(vec![Ok(failed)]);
        let outcome =
            poll_artifact(&service, "d1", Duration::from_millis(800), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            Some(PollOutcome::Failed(PollError::JobFailed("disk full".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let service = FakeService::default();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2000)).await;
            stopper.cancel();
        });

        let outcome = poll_artifact(&service, "d1", Duration::from_millis(800), &cancel).await;
        assert_eq!(outcome, None);
        // Polls at 0, 800 and 1600 ms.
        assert_eq!(polls(&service), 3);
    }

    #[test]
    fn state_from_outcome_builds_download_url() {
        let service = FakeService::default();
        let state =
            DigitsState::from_outcome(&service, "d1".into(), PollOutcome::Ready(descriptor("d1")));
        assert_matches!(&state, DigitsState::Ready { download_url, .. } => {
            assert_eq!(download_url, "http://fake/digits/d1/download");
        });
        assert_eq!(state.job_id(), Some("d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_poll_result_is_discarded() {
        let service = Arc::new(FakeService::default());
        *service.digits_replies.lock().unwrap() = vec![
            Ok(artifact_job("old", JobStatus::Running, None)),
            Ok(artifact_job("new", JobStatus::Done, Some(descriptor("new")))),
        ]
        .into();
        let cancel = CancellationToken::new();
        let mut polls = DigitsPolls::new();

        polls.start(service.clone(), 127, "old".into(), Duration::from_millis(800), &cancel);
        tokio::task::yield_now().await;
        polls.start(service.clone(), 127, "new".into(), Duration::from_millis(800), &cancel);

        let polled = polls.next().await;
        assert_eq!(polled.job_id, "new");
        assert_eq!(polled.outcome, PollOutcome::Ready(descriptor("new")));
        assert!(!polls.is_polling(127));
    }
}
