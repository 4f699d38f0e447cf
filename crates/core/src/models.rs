//! Wire models exchanged with the compute service.
//!
//! Every struct tolerates unknown fields (serde ignores them by default) and
//! defaults optional fields, so older or newer service builds keep parsing.

use serde::{Deserialize, Deserializer, Serialize};

use crate::status::{BlockStatus, JobStatus};
use crate::types::{BlockId, Exponent, JobId, Timestamp, UnixSeconds};

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Summary of one block as listed by `GET /blocks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedBlock {
    pub id: BlockId,
    pub start: Exponent,
    pub end_excl: Exponent,
    /// Present in list rows, absent in the detail payload.
    #[serde(default)]
    pub label: String,
    pub candidate_count: u64,
    pub tested_count: u64,
    #[serde(default)]
    pub verified_count: u64,
    #[serde(default)]
    pub status: BlockStatus,
}

impl TrackedBlock {
    /// Coverage of the block in whole percent, clamped to `[0, 100]`.
    pub fn coverage_pct(&self) -> u8 {
        coverage_pct(self.tested_count, self.candidate_count)
    }

    /// The service label, or the `"{id}-{id+1}M"` form when it is missing.
    pub fn display_label(&self) -> String {
        if self.label.is_empty() {
            format!("{}-{}M", self.id, self.id + 1)
        } else {
            self.label.clone()
        }
    }
}

/// Rounded percentage of `tested` over `total`, clamped to `[0, 100]`.
///
/// A zero total reports 0 rather than dividing by zero.
pub fn coverage_pct(tested: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let tested = tested.min(total) as u128;
    let total = total as u128;
    ((tested * 100 + total / 2) / total) as u8
}

/// Block detail returned by `GET /blocks/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDetail {
    pub block: TrackedBlock,
    #[serde(default)]
    pub exponents: Vec<TrackedExponent>,
}

/// One candidate exponent inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedExponent {
    pub p: Exponent,
    #[serde(default)]
    pub status: JobStatus,
    /// Unknown until tested. The service sends `null`, `0` or `1`.
    #[serde(default, deserialize_with = "deserialize_tri_state")]
    pub is_prime: Option<bool>,
    #[serde(default)]
    pub ns_elapsed: Option<u64>,
    #[serde(default)]
    pub engine_info: Option<String>,
}

/// Response of `POST /blocks/{id}/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStartAck {
    #[serde(default)]
    pub scheduled: u64,
    #[serde(default)]
    pub block_id: Option<BlockId>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    /// Set when the block had nothing left to test.
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Test runs
// ---------------------------------------------------------------------------

/// Body of `POST /jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRun {
    pub p: Exponent,
    /// Iterations between progress frames; `None` lets the service pick (~1%).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_stride: Option<u64>,
}

/// Response of `POST /jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreated {
    pub id: JobId,
}

/// Status record of one primality test, `GET /jobs/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub id: JobId,
    pub p: Exponent,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<RunResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunJob {
    /// True when the run finished and reported a prime.
    pub fn is_prime(&self) -> bool {
        self.status == JobStatus::Done && self.result.as_ref().is_some_and(|r| r.is_prime)
    }
}

/// Outcome of a finished Lucas-Lehmer test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub p: Option<Exponent>,
    pub is_prime: bool,
    #[serde(default)]
    pub iterations: u64,
    #[serde(default)]
    pub ns_elapsed: u64,
    #[serde(default)]
    pub engine_info: String,
    #[serde(default)]
    pub final_residue_is_zero: bool,
}

// ---------------------------------------------------------------------------
// Digits artifacts
// ---------------------------------------------------------------------------

/// Body of `POST /digits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitDigits {
    pub p: Exponent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Response of `POST /digits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitsCreated {
    pub id: JobId,
    pub p: Exponent,
    #[serde(default)]
    pub estimated_digits: u64,
}

/// Status of a digits generation job, `GET /digits/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactJob {
    pub id: JobId,
    pub p: Exponent,
    pub status: JobStatus,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub created_at: Option<UnixSeconds>,
    #[serde(default)]
    pub started_at: Option<UnixSeconds>,
    #[serde(default)]
    pub finished_at: Option<UnixSeconds>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub engine_info: Option<String>,
    #[serde(default)]
    pub artifact: Option<ArtifactDescriptor>,
}

impl ArtifactJob {
    /// `done` only counts once the artifact descriptor is attached.
    pub fn ready_artifact(&self) -> Option<&ArtifactDescriptor> {
        match self.status {
            JobStatus::Done => self.artifact.as_ref(),
            _ => None,
        }
    }
}

/// Description of a materialised decimal expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub job_id: JobId,
    pub filename: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub digits: u64,
    pub size_bytes: u64,
    pub sha256: String,
}

// ---------------------------------------------------------------------------
// Primes
// ---------------------------------------------------------------------------

/// One found prime in `GET /primes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeRow {
    pub p: Exponent,
    pub block_id: BlockId,
    #[serde(default)]
    pub digits: u64,
    #[serde(default)]
    pub finished_at: Option<UnixSeconds>,
    #[serde(default)]
    pub engine_info: Option<String>,
    #[serde(default)]
    pub ns_elapsed: Option<u64>,
}

impl PrimeRow {
    /// Completion time as a UTC timestamp, when the service reported one.
    pub fn finished_at_utc(&self) -> Option<Timestamp> {
        let secs = self.finished_at?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        let whole = secs.trunc();
        let nanos = ((secs - whole) * 1e9) as u32;
        chrono::DateTime::from_timestamp(whole as i64, nanos)
    }
}

/// Response of `GET /primes/count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeCount {
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accept `null`, booleans, or the integers `0`/`1` for a tri-state flag.
fn deserialize_tri_state<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(b)) => Ok(Some(b)),
        Some(Flag::Int(0)) => Ok(Some(false)),
        Some(Flag::Int(1)) => Ok(Some(true)),
        Some(Flag::Int(other)) => Err(serde::de::Error::custom(format!(
            "expected 0 or 1 for tri-state flag, got {other}"
        ))),
    }
}
