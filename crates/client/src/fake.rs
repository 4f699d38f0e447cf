//! In-process [`ComputeService`] for unit tests of surface loops.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use llwatch_core::models::{
    ArtifactDescriptor, ArtifactJob, BlockDetail, BlockStartAck, DigitsCreated, JobCreated,
    PrimeRow, RunJob, RunResult, SubmitDigits, SubmitRun, TrackedBlock,
};
use llwatch_core::status::{BlockStatus, JobStatus};
use llwatch_core::types::{BlockId, JobId};

use crate::api::{ComputeService, FetchError};

/// Scriptable service. Every call is recorded in `calls`.
#[derive(Default)]
pub(crate) struct FakeService {
    pub blocks: Mutex<Vec<TrackedBlock>>,
    pub details: Mutex<HashMap<BlockId, BlockDetail>>,
    pub primes: Mutex<Vec<PrimeRow>>,
    pub runs: Mutex<HashMap<JobId, RunJob>>,
    pub digits_replies: Mutex<VecDeque<Result<ArtifactJob, FetchError>>>,
    /// When set, submitted runs are created already done with this primality.
    pub complete_runs: Mutex<Option<bool>>,
    /// Status code returned by the next submit or start call.
    pub reject_next: Mutex<Option<u16>>,
    /// Status code returned by the next block or prime list fetch.
    pub fail_next_list: Mutex<Option<u16>>,
    pub calls: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
}

impl FakeService {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_rejection(&self) -> Result<(), FetchError> {
        match self.reject_next.lock().unwrap().take() {
            Some(status) => Err(FetchError::Rejected {
                status,
                body: "rejected by fake".into(),
            }),
            None => Ok(()),
        }
    }

    fn take_list_failure(&self) -> Result<(), FetchError> {
        match self.fail_next_list.lock().unwrap().take() {
            Some(status) => Err(FetchError::Rejected {
                status,
                body: "list unavailable".into(),
            }),
            None => Ok(()),
        }
    }

    fn new_id(&self, prefix: &str) -> JobId {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        format!("{prefix}{next}")
    }
}

#[async_trait]
impl ComputeService for FakeService {
    async fn list_blocks(&self, limit: u32) -> Result<Vec<TrackedBlock>, FetchError> {
        self.record(format!("list_blocks {limit}"));
        self.take_list_failure()?;
        Ok(self.blocks.lock().unwrap().clone())
    }

    async fn block_detail(&self, block_id: BlockId) -> Result<BlockDetail, FetchError> {
        self.record(format!("block_detail {block_id}"));
        self.details
            .lock()
            .unwrap()
            .get(&block_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: format!("/blocks/{block_id}"),
            })
    }

    async fn start_block(&self, block_id: BlockId, concurrency: u32) -> Result<BlockStartAck, FetchError> {
        self.record(format!("start_block {block_id}"));
        self.take_rejection()?;
        Ok(BlockStartAck {
            scheduled: 1,
            block_id: Some(block_id),
            concurrency: Some(concurrency),
            message: None,
        })
    }

    async fn stop_block(&self, block_id: BlockId) -> Result<(), FetchError> {
        self.record(format!("stop_block {block_id}"));
        self.take_rejection()
    }

    async fn recent_primes(&self, limit: u32) -> Result<Vec<PrimeRow>, FetchError> {
        self.record(format!("recent_primes {limit}"));
        self.take_list_failure()?;
        Ok(self.primes.lock().unwrap().clone())
    }

    async fn prime_count(&self) -> Result<u64, FetchError> {
        self.record("prime_count".into());
        Ok(self.primes.lock().unwrap().len() as u64)
    }

    async fn submit_run(&self, request: &SubmitRun) -> Result<JobCreated, FetchError> {
        self.record(format!("submit_run {}", request.p));
        self.take_rejection()?;
        let id = self.new_id("job-");
        let completed = *self.complete_runs.lock().unwrap();
        let job = match completed {
            Some(is_prime) => RunJob {
                id: id.clone(),
                p: request.p,
                status: JobStatus::Done,
                result: Some(RunResult {
                    p: Some(request.p),
                    is_prime,
                    iterations: request.p.saturating_sub(2),
                    ns_elapsed: 1_000,
                    engine_info: "fake".into(),
                    final_residue_is_zero: is_prime,
                }),
                error: None,
            },
            None => RunJob {
                id: id.clone(),
                p: request.p,
                status: JobStatus::Queued,
                result: None,
                error: None,
            },
        };
        self.runs.lock().unwrap().insert(id.clone(), job);
        Ok(JobCreated { id })
    }

    async fn run_status(&self, job_id: &str) -> Result<RunJob, FetchError> {
        self.record(format!("run_status {job_id}"));
        self.runs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: format!("/jobs/{job_id}"),
            })
    }

    async fn submit_digits(&self, request: &SubmitDigits) -> Result<DigitsCreated, FetchError> {
        self.record(format!("submit_digits {}", request.p));
        self.take_rejection()?;
        Ok(DigitsCreated {
            id: self.new_id("dig-"),
            p: request.p,
            estimated_digits: llwatch_core::digits::estimated_digits(request.p),
        })
    }

    async fn digits_status(&self, job_id: &str) -> Result<ArtifactJob, FetchError> {
        self.record(format!("digits_status {job_id}"));
        self.digits_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(artifact_job(job_id, JobStatus::Running, None)))
    }

    fn download_url(&self, job_id: &str) -> String {
        format!("http://fake/digits/{job_id}/download")
    }
}

pub(crate) fn block(id: BlockId, tested: u64, total: u64, status: BlockStatus) -> TrackedBlock {
    TrackedBlock {
        id,
        start: id as u64 * 1_000_000,
        end_excl: (id as u64 + 1) * 1_000_000,
        label: String::new(),
        candidate_count: total,
        tested_count: tested,
        verified_count: 0,
        status,
    }
}

pub(crate) fn descriptor(job_id: &str) -> ArtifactDescriptor {
    ArtifactDescriptor {
        job_id: job_id.into(),
        filename: "M127.txt".into(),
        path: "/data/M127.txt".into(),
        digits: 39,
        size_bytes: 40,
        sha256: "ab".repeat(32),
    }
}

pub(crate) fn artifact_job(
    job_id: &str,
    status: JobStatus,
    artifact: Option<ArtifactDescriptor>,
) -> ArtifactJob {
    ArtifactJob {
        id: job_id.into(),
        p: 127,
        status,
        kind: Some("digits".into()),
        created_at: None,
        started_at: None,
        finished_at: None,
        error: None,
        engine_info: None,
        artifact,
    }
}
