//! Merge rules that turn snapshots and live frames into one view-state.
//!
//! All functions here are pure: they mutate a view in place and report what
//! happened, leaving IO, timers, and channels to the client crate.
//!
//! Rules, applied per subject:
//!
//! - Counters (`tested`, `total`, per-exponent `pct`, job `iteration`/`pct`)
//!   never decrease within one run. A lower value is stale and dropped.
//! - A block whose status moves from terminal back to active has started a
//!   new run. Counters reset to zero before the new values apply.
//! - Absent fields leave the previous value untouched.
//! - Once a block channel reports `done`, later frames from that channel are
//!   not applied. A newly opened channel calls [`BlockView::reopen`] first.
//! - Test runs never leave a terminal status.

use serde::Serialize;

use crate::error::CoreError;
use crate::live::{BlockProgress, JobProgress};
use crate::models::{coverage_pct, BlockDetail, RunJob, RunResult, TrackedBlock, TrackedExponent};
use crate::status::{BlockStatus, JobStatus};
use crate::types::{BlockId, Exponent, JobId};

/// Percentages above this are clamped.
const PCT_MAX: u32 = 100;

/// What a single merge did to a view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// At least one displayed value changed.
    pub changed: bool,
    /// At least one incoming value was lower than the displayed one and was dropped.
    pub stale: bool,
    /// The input was addressed to another subject or arrived after completion.
    pub ignored: bool,
    /// Counters were reset because a new run was detected.
    pub new_run: bool,
    /// The subject is now terminal.
    pub terminal: bool,
}

impl MergeReport {
    fn ignored() -> Self {
        Self {
            ignored: true,
            ..Self::default()
        }
    }
}

/// Raise `slot` to `incoming` unless that would lower it.
///
/// Returns `Some(true)` when the value changed, `Some(false)` when it was
/// equal, and `None` when the incoming value was stale.
fn raise<T: PartialOrd + Copy>(slot: &mut Option<T>, incoming: T) -> Option<bool> {
    match *slot {
        Some(current) if incoming < current => None,
        Some(current) if incoming == current => Some(false),
        _ => {
            *slot = Some(incoming);
            Some(true)
        }
    }
}

// ---------------------------------------------------------------------------
// Block progress
// ---------------------------------------------------------------------------

/// Progress of the exponent currently under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExponentProgress {
    pub p: Exponent,
    pub pct: u8,
}

/// Displayed progress of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockView {
    pub block_id: BlockId,
    pub status: BlockStatus,
    pub tested: Option<u64>,
    pub total: Option<u64>,
    pub current: Option<ExponentProgress>,
    /// Most recently finished exponent.
    pub last_finished: Option<Exponent>,
    /// Incremented each time a new run is detected.
    pub run: u32,
    /// Set once the channel reported `done`.
    pub finished: bool,
}

impl BlockView {
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            status: BlockStatus::Pending,
            tested: None,
            total: None,
            current: None,
            last_finished: None,
            run: 0,
            finished: false,
        }
    }

    /// Coverage in whole percent, 0 while either counter is unknown.
    pub fn coverage_pct(&self) -> u8 {
        match (self.tested, self.total) {
            (Some(tested), Some(total)) => coverage_pct(tested, total),
            _ => 0,
        }
    }

    fn reset_counters(&mut self) {
        self.run += 1;
        self.tested = Some(0);
        self.total = Some(0);
        self.current = None;
        self.last_finished = None;
        self.finished = false;
    }

    /// Accept frames again before a new channel for this block opens.
    ///
    /// `done` only ends the channel that delivered it. Counters keep their
    /// values since the service only ever raises them; a seed reporting an
    /// active status still resets them through [`apply_snapshot`](Self::apply_snapshot).
    /// Returns whether the view had finished.
    pub fn reopen(&mut self) -> bool {
        if !self.finished {
            return false;
        }
        self.finished = false;
        self.current = None;
        true
    }

    /// Merge a full snapshot of the block (seed or periodic refresh).
    ///
    /// The snapshot's status is authoritative; its counters still obey the
    /// no-decrease rule so a seed that lands after live frames cannot roll
    /// the display back.
    pub fn apply_snapshot(&mut self, block: &TrackedBlock) -> MergeReport {
        if block.id != self.block_id {
            return MergeReport::ignored();
        }
        let mut report = MergeReport::default();

        if (self.status.is_terminal() || self.finished) && block.status.is_active() {
            self.reset_counters();
            report.new_run = true;
            report.changed = true;
        }

        if self.status != block.status {
            self.status = block.status;
            report.changed = true;
        }
        self.merge_counters(Some(block.tested_count), Some(block.candidate_count), &mut report);

        report.terminal = self.status.is_terminal();
        report
    }

    /// Merge one live frame from the block channel.
    pub fn apply_event(&mut self, event: &BlockProgress) -> MergeReport {
        if self.finished {
            return MergeReport::ignored();
        }
        if event.block_id.is_some_and(|id| id != self.block_id) {
            return MergeReport::ignored();
        }
        let mut report = MergeReport::default();

        self.merge_counters(event.tested, event.total, &mut report);
        self.merge_current(event.p, event.pct, &mut report);

        if let Some(last) = event.last_p {
            if self.last_finished != Some(last) {
                self.last_finished = Some(last);
                report.changed = true;
            }
        }

        if event.is_done() {
            self.finished = true;
            self.current = None;
            self.status = match (self.tested, self.total) {
                (Some(tested), Some(total)) if tested >= total => BlockStatus::Complete,
                _ => BlockStatus::Stopped,
            };
            report.changed = true;
            report.terminal = true;
        } else if report.changed && self.status != BlockStatus::Running {
            // Frames only flow while the block is being worked on.
            self.status = BlockStatus::Running;
        }

        report
    }

    fn merge_counters(&mut self, tested: Option<u64>, total: Option<u64>, report: &mut MergeReport) {
        for (slot, incoming) in [(&mut self.total, total), (&mut self.tested, tested)] {
            let Some(incoming) = incoming else { continue };
            match raise(slot, incoming) {
                Some(changed) => report.changed |= changed,
                None => report.stale = true,
            }
        }
    }

    fn merge_current(&mut self, p: Option<Exponent>, pct: Option<u32>, report: &mut MergeReport) {
        let pct = pct.map(|v| v.min(PCT_MAX) as u8);
        match (p, self.current.as_mut()) {
            // Same exponent: percentage only moves forward.
            (Some(p), Some(current)) if current.p == p => {
                if let Some(pct) = pct {
                    apply_pct(&mut current.pct, pct, report);
                }
            }
            // A different exponent starts at whatever it reports.
            (Some(p), _) => {
                self.current = Some(ExponentProgress {
                    p,
                    pct: pct.unwrap_or(0),
                });
                report.changed = true;
            }
            (None, Some(current)) => {
                if let Some(pct) = pct {
                    apply_pct(&mut current.pct, pct, report);
                }
            }
            (None, None) => {}
        }
    }
}

fn apply_pct(slot: &mut u8, pct: u8, report: &mut MergeReport) {
    if pct < *slot {
        report.stale = true;
    } else if pct > *slot {
        *slot = pct;
        report.changed = true;
    }
}

// ---------------------------------------------------------------------------
// Block detail (drawer)
// ---------------------------------------------------------------------------

/// A block's progress together with its exponent list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDetailView {
    pub progress: BlockView,
    pub start: Option<Exponent>,
    pub end_excl: Option<Exponent>,
    pub exponents: Vec<TrackedExponent>,
}

impl BlockDetailView {
    pub fn new(block_id: BlockId) -> Self {
        Self {
            progress: BlockView::new(block_id),
            start: None,
            end_excl: None,
            exponents: Vec::new(),
        }
    }

    /// Merge a detail snapshot. The exponent list is replaced wholesale.
    pub fn apply_snapshot(&mut self, detail: &BlockDetail) -> MergeReport {
        let report = self.progress.apply_snapshot(&detail.block);
        if report.ignored {
            return report;
        }
        self.start = Some(detail.block.start);
        self.end_excl = Some(detail.block.end_excl);
        self.exponents = detail.exponents.clone();
        MergeReport {
            changed: true,
            ..report
        }
    }

    /// Merge a live frame; also marks the named exponents running or done.
    pub fn apply_event(&mut self, event: &BlockProgress) -> MergeReport {
        let report = self.progress.apply_event(event);
        if report.ignored {
            return report;
        }
        if let Some(p) = event.p {
            self.advance_exponent(p, JobStatus::Running);
        }
        if let Some(p) = event.last_p {
            self.advance_exponent(p, JobStatus::Done);
        }
        report
    }

    fn advance_exponent(&mut self, p: Exponent, to: JobStatus) {
        let Some(row) = self.exponents.iter_mut().find(|e| e.p == p) else {
            return;
        };
        let rank = |s: JobStatus| match s {
            JobStatus::Queued | JobStatus::Unknown => 0,
            JobStatus::Running => 1,
            JobStatus::Done | JobStatus::Error => 2,
        };
        if rank(to) > rank(row.status) {
            row.status = to;
        }
    }
}

// ---------------------------------------------------------------------------
// Test runs
// ---------------------------------------------------------------------------

/// Displayed state of one primality test run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub job_id: JobId,
    pub p: Exponent,
    pub status: JobStatus,
    pub pct: u8,
    pub iteration: Option<u64>,
    pub digest: Option<String>,
    pub result: Option<RunResult>,
    pub error: Option<String>,
}

impl RunView {
    pub fn new(job_id: JobId, p: Exponent) -> Self {
        Self {
            job_id,
            p,
            status: JobStatus::Queued,
            pct: 0,
            iteration: None,
            digest: None,
            result: None,
            error: None,
        }
    }

    /// Merge a job channel frame.
    ///
    /// A frame whose iteration or percentage is behind the display is
    /// dropped entirely, digest included, since the digest belongs to that
    /// older iteration.
    pub fn apply_event(&mut self, event: &JobProgress) -> MergeReport {
        if self.status.is_terminal() {
            return MergeReport::ignored();
        }
        let behind_iter = matches!((event.iteration, self.iteration), (Some(i), Some(cur)) if i < cur);
        let pct = event.pct.map(|v| v.min(PCT_MAX) as u8);
        let behind_pct = pct.is_some_and(|v| v < self.pct);
        if behind_iter || behind_pct {
            return MergeReport {
                stale: true,
                ..MergeReport::default()
            };
        }

        let mut report = MergeReport::default();
        if let Some(iteration) = event.iteration {
            report.changed |= raise(&mut self.iteration, iteration).unwrap_or(false);
        }
        if let Some(pct) = pct {
            if pct != self.pct {
                self.pct = pct;
                report.changed = true;
            }
        }
        if let Some(digest) = &event.digest {
            if self.digest.as_ref() != Some(digest) {
                self.digest = Some(digest.clone());
                report.changed = true;
            }
        }
        if report.changed && self.status == JobStatus::Queued {
            self.status = JobStatus::Running;
        }
        report
    }

    /// Merge a status snapshot of the same job.
    ///
    /// Returns an error for a snapshot of another job or one that would move
    /// a finished run back to queued/running.
    pub fn apply_status(&mut self, job: &RunJob) -> Result<MergeReport, CoreError> {
        if job.id != self.job_id {
            return Err(CoreError::Validation(format!(
                "status for job {} applied to view of job {}",
                job.id, self.job_id
            )));
        }
        if self.status.is_terminal() && job.status != self.status {
            return Err(CoreError::InvalidTransition {
                entity: "job",
                id: job.id.clone(),
                from: self.status.as_str(),
                to: job.status.as_str(),
            });
        }

        let mut report = MergeReport::default();
        if job.status != self.status && job.status != JobStatus::Unknown {
            // Queued after running would be a regression; keep the display.
            if !(self.status == JobStatus::Running && job.status == JobStatus::Queued) {
                self.status = job.status;
                report.changed = true;
            }
        }
        if job.status == JobStatus::Done && self.pct != 100 {
            self.pct = 100;
            report.changed = true;
        }
        if job.result.is_some() && self.result != job.result {
            self.result = job.result.clone();
            report.changed = true;
        }
        if job.error.is_some() && self.error != job.error {
            self.error = job.error.clone();
            report.changed = true;
        }
        report.terminal = self.status.is_terminal();
        Ok(report)
    }

    pub fn is_prime(&self) -> bool {
        self.status == JobStatus::Done && self.result.as_ref().is_some_and(|r| r.is_prime)
    }
}
