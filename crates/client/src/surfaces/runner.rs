//! Single-exponent test runner session.
//!
//! A session submits one Lucas-Lehmer run, follows its job channel, and
//! fetches the authoritative status once the channel closes. If the result
//! is prime the session can request the decimal digits artifact, which is
//! tracked by a completion poller bound to the session. Starting another
//! run or resetting tears all of that down first.

use std::sync::Arc;

use llwatch_core::digits::{estimated_digits, validate_run_exponent};
use llwatch_core::live::LiveUpdateEvent;
use llwatch_core::models::{SubmitDigits, SubmitRun};
use llwatch_core::reconcile::RunView;
use llwatch_core::types::{Exponent, JobId};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{close_channel, next_channel_event, ConnectionState, SessionError, SurfaceContext};
use crate::channel::{ChannelError, ChannelEvent, ChannelSubject, LiveChannel};
use crate::poller::{DigitsPolled, DigitsPolls, DigitsState};
use crate::scope::{publish, spawn_surface, SurfaceClosed, SurfaceHandle, SurfaceTask};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunnerView {
    /// `None` until a run has been submitted.
    pub run: Option<RunView>,
    pub connection: ConnectionState,
    /// Decimal digits of `2^p - 1`, shown before any artifact exists.
    pub estimated_digits: Option<u64>,
    pub digits: DigitsState,
    /// Last error from fetching the final status, if any.
    pub notice: Option<String>,
}

pub enum RunnerCommand {
    Start {
        p: Exponent,
        progress_stride: Option<u64>,
        reply: oneshot::Sender<Result<JobId, SessionError>>,
    },
    GenerateDigits {
        reply: oneshot::Sender<Result<JobId, SessionError>>,
    },
    Reset,
}

pub struct RunSurface {
    handle: SurfaceHandle<RunnerView, RunnerCommand>,
}

impl RunSurface {
    pub fn spawn(ctx: &SurfaceContext) -> Self {
        let state = RunnerState {
            ctx: ctx.clone(),
            view: RunnerView::default(),
            channel: None,
            polls: DigitsPolls::new(),
        };
        let handle = spawn_surface("runner", &ctx.root, RunnerView::default(), |task| state.run(task));
        Self { handle }
    }

    pub fn view(&self) -> RunnerView {
        self.handle.view()
    }

    pub fn watch(&self) -> watch::Receiver<RunnerView> {
        self.handle.watch()
    }

    pub async fn wait_for(&self, predicate: impl FnMut(&RunnerView) -> bool) -> Result<RunnerView, SurfaceClosed> {
        self.handle.wait_for(predicate).await
    }

    /// Submit a run for `p`, replacing any current session.
    pub async fn start(&self, p: Exponent) -> Result<JobId, SessionError> {
        self.start_with_stride(p, None).await
    }

    pub async fn start_with_stride(&self, p: Exponent, progress_stride: Option<u64>) -> Result<JobId, SessionError> {
        self.handle
            .request(|reply| RunnerCommand::Start {
                p,
                progress_stride,
                reply,
            })
            .await?
    }

    /// Request the digits artifact for a run that finished prime.
    pub async fn generate_digits(&self) -> Result<JobId, SessionError> {
        self.handle
            .request(|reply| RunnerCommand::GenerateDigits { reply })
            .await?
    }

    pub async fn reset(&self) -> Result<(), SurfaceClosed> {
        self.handle.send(RunnerCommand::Reset).await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

struct RunnerState {
    ctx: SurfaceContext,
    view: RunnerView,
    channel: Option<LiveChannel>,
    polls: DigitsPolls,
}

impl RunnerState {
    async fn run(mut self, task: SurfaceTask<RunnerView, RunnerCommand>) {
        let SurfaceTask {
            view: view_tx,
            mut commands,
            cancel,
        } = task;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &view_tx, &cancel).await,
                    None => break,
                },

                event = next_channel_event(&mut self.channel) => self.on_channel_event(event, &cancel).await,

                polled = self.polls.next() => self.on_digits(polled),
            }
            publish(&view_tx, self.view.clone());
        }

        self.reset().await;
        tracing::debug!("Runner session stopped");
    }

    async fn reset(&mut self) {
        close_channel(&mut self.channel).await;
        self.polls.cancel_all();
        self.view = RunnerView::default();
    }

    async fn start(
        &mut self,
        p: Exponent,
        progress_stride: Option<u64>,
        view_tx: &watch::Sender<RunnerView>,
        cancel: &CancellationToken,
    ) -> Result<JobId, SessionError> {
        validate_run_exponent(p)?;
        self.reset().await;
        publish(view_tx, self.view.clone());

        let request = SubmitRun { p, progress_stride };
        let created = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::NotReady("runner shutting down".into())),
            result = self.ctx.service.submit_run(&request) => result?,
        };

        let job_id = created.id;
        self.view.run = Some(RunView::new(job_id.clone(), p));
        self.view.estimated_digits = Some(estimated_digits(p));
        self.view.connection = ConnectionState::Connecting;
        publish(view_tx, self.view.clone());

        match self.ctx.channels.open(ChannelSubject::Job(job_id.clone()), cancel).await {
            Ok(live) => {
                self.channel = Some(live);
                self.view.connection = ConnectionState::Live;
            }
            Err(ChannelError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Job channel failed to open");
                self.view.connection = ConnectionState::Lost(e.to_string());
                // Still show whatever the service knows.
                self.fetch_final_status(cancel).await;
            }
        }
        Ok(job_id)
    }

    async fn on_channel_event(&mut self, event: ChannelEvent, cancel: &CancellationToken) {
        match event {
            ChannelEvent::Update(LiveUpdateEvent::Job(progress)) => {
                if let Some(run) = self.view.run.as_mut() {
                    let report = run.apply_event(&progress);
                    if report.stale {
                        tracing::debug!(job_id = %run.job_id, "Dropped stale job frame");
                    }
                }
            }
            ChannelEvent::Update(LiveUpdateEvent::Block(_)) => {
                tracing::warn!("Block frame on a job channel, ignoring");
            }
            ChannelEvent::Closed { .. } => {
                self.channel = None;
                self.view.connection = ConnectionState::Closed;
                self.fetch_final_status(cancel).await;
            }
            ChannelEvent::Lost(reason) => {
                self.channel = None;
                self.view.connection = ConnectionState::Lost(reason);
                self.fetch_final_status(cancel).await;
            }
        }
    }

    /// Pull the job's status and merge it.
    async fn fetch_final_status(&mut self, cancel: &CancellationToken) {
        let Some(job_id) = self.view.run.as_ref().map(|r| r.job_id.clone()) else {
            return;
        };
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.ctx.service.run_status(&job_id) => result,
        };
        let job = match fetched {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Final status fetch failed");
                self.view.notice = Some(e.to_string());
                return;
            }
        };
        let Some(run) = self.view.run.as_mut() else {
            return;
        };
        match run.apply_status(&job) {
            Ok(report) => {
                self.view.notice = None;
                if report.terminal {
                    tracing::info!(
                        job_id = %job_id,
                        p = run.p,
                        status = run.status.as_str(),
                        is_prime = run.is_prime(),
                        "Run finished",
                    );
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Rejected job status");
                self.view.notice = Some(e.to_string());
            }
        }
    }

    async fn generate_digits(&mut self, cancel: &CancellationToken) -> Result<JobId, SessionError> {
        let run = self
            .view
            .run
            .as_ref()
            .ok_or_else(|| SessionError::NotReady("no run in this session".into()))?;
        if !run.is_prime() {
            return Err(SessionError::NotReady(format!("M{} is not a known prime", run.p)));
        }
        let p = run.p;
        if let DigitsState::Preparing { job_id } | DigitsState::Ready { job_id, .. } = &self.view.digits {
            return Ok(job_id.clone());
        }

        let request = SubmitDigits { p, filename: None };
        let created = self.ctx.service.submit_digits(&request).await?;
        self.view.digits = DigitsState::Preparing {
            job_id: created.id.clone(),
        };
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
        let current = self.view.run.as_ref().map(|r| r.p);
        if current != Some(polled.p) || self.view.digits.job_id() != Some(polled.job_id.as_str()) {
            return;
        }
        self.view.digits = DigitsState::from_outcome(self.ctx.service.as_ref(), polled.job_id, polled.outcome);
    }

    async fn handle_command(
        &mut self,
        cmd: RunnerCommand,
        view_tx: &watch::Sender<RunnerView>,
        cancel: &CancellationToken,
    ) {
        match cmd {
            RunnerCommand::Start {
                p,
                progress_stride,
                reply,
            } => {
                let result = self.start(p, progress_stride, view_tx, cancel).await;
                if let Err(e) = &result {
                    tracing::warn!(p, error = %e, "Run submission failed");
                }
                publish(view_tx, self.view.clone());
                let _ = reply.send(result);
            }
            RunnerCommand::GenerateDigits { reply } => {
                let result = self.generate_digits(cancel).await;
                publish(view_tx, self.view.clone());
                let _ = reply.send(result);
            }
            RunnerCommand::Reset => self.reset().await,
        }
    }
}
