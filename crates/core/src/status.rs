//! Lifecycle statuses for blocks, exponents, and jobs.
//!
//! The compute service reports statuses as lowercase strings. Unrecognised
//! values deserialize to an `Unknown` variant rather than failing the whole
//! payload.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BlockStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a block of candidate exponents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    /// Seeded but never started.
    #[default]
    Pending,
    /// Workers are testing exponents.
    Running,
    /// A stop was requested and honoured before completion.
    Stopped,
    /// Every candidate has been tested.
    Complete,
    /// A value this client does not know about.
    #[serde(other)]
    Unknown,
}

impl BlockStatus {
    /// Whether the block has reached a resting state for the current run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Complete)
    }

    /// Whether the block is waiting for or executing a run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
            Self::Unknown => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle shared by exponents, test runs, and digits jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Done,
    Error,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// `done` and `error` are final; nothing follows them for the same id.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_status_parses_lowercase() {
        let s: BlockStatus = serde_json::from_str(r#""complete""#).unwrap();
        assert_eq!(s, BlockStatus::Complete);
        assert!(s.is_terminal());
    }

    #[test]
    fn unknown_status_does_not_fail() {
        let s: BlockStatus = serde_json::from_str(r#""paused""#).unwrap();
        assert_eq!(s, BlockStatus::Unknown);
        let j: JobStatus = serde_json::from_str(r#""cancelled""#).unwrap();
        assert_eq!(j, JobStatus::Unknown);
        assert!(!j.is_terminal());
        assert!(!j.is_active());
    }

    #[test]
    fn job_terminal_and_active_are_disjoint() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Error,
        ] {
            assert_ne!(s.is_terminal(), s.is_active(), "{}", s.as_str());
        }
    }
}
