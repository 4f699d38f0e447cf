//! Live update frames pushed over the progress channels.
//!
//! The service pushes bare JSON objects (no envelope) on two kinds of
//! channel: one per block and one per test run. Every field is optional;
//! a frame is a partial snapshot and absent fields mean "unchanged".
//! Keep-alive frames of the form `{"type":"ping","t":...}` are interleaved
//! and recognised separately.

use serde::{Deserialize, Serialize};

use crate::types::{BlockId, Exponent};

/// Which kind of subject a channel follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Block,
    Job,
}

/// Partial progress for a block run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProgress {
    #[serde(default)]
    pub block_id: Option<BlockId>,
    /// Exponents finished so far in the block.
    #[serde(default)]
    pub tested: Option<u64>,
    /// Candidate count of the block.
    #[serde(default)]
    pub total: Option<u64>,
    /// Exponent currently under test.
    #[serde(default)]
    pub p: Option<Exponent>,
    /// Completion of `p` in whole percent.
    #[serde(default)]
    pub pct: Option<u32>,
    /// Exponent that just finished (sent alongside coverage snapshots).
    #[serde(default)]
    pub last_p: Option<Exponent>,
    #[serde(default)]
    pub done: Option<bool>,
}

impl BlockProgress {
    pub fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }
}

/// Partial progress for a single test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub iteration: Option<u64>,
    #[serde(default)]
    pub pct: Option<u32>,
    /// Hex digest of the current residue.
    #[serde(default)]
    pub digest: Option<String>,
}

/// A parsed progress frame, keyed by target kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveUpdateEvent {
    Block(BlockProgress),
    Job(JobProgress),
}

impl LiveUpdateEvent {
    /// Only block frames carry a completion flag; job channels end by
    /// server-side close.
    pub fn is_done(&self) -> bool {
        match self {
            Self::Block(b) => b.is_done(),
            Self::Job(_) => false,
        }
    }
}

/// One text frame after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Update(LiveUpdateEvent),
    KeepAlive,
}

/// Parse a text frame received on a channel of the given kind.
///
/// Returns `Err` for non-JSON input, non-object values, and fields of the
/// wrong type. Callers log and drop those; they never end the channel.
pub fn parse_frame(kind: ChannelKind, text: &str) -> Result<Frame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if !value.is_object() {
        return Err(serde::de::Error::custom("progress frame must be a JSON object"));
    }
    if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
        return Ok(Frame::KeepAlive);
    }

    let event = match kind {
        ChannelKind::Block => LiveUpdateEvent::Block(serde_json::from_value(value)?),
        ChannelKind::Job => LiveUpdateEvent::Job(serde_json::from_value(value)?),
    };
    Ok(Frame::Update(event))
}
