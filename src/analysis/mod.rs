//! Phase two: finding highlight candidates in transcript chunks and
//! reconciling them into a clean, non-overlapping set.

pub mod anthropic;
pub mod dedup;
pub mod discovery;
pub mod normalizer;

use serde::{Deserialize, Serialize};

use crate::transcription::Timecode;

pub use anthropic::{AnthropicClient, Generated, TextGenerator, ToolRequest};
pub use dedup::{overlap_fraction, resolve, survivors, MAX_OVERLAP_FRACTION};
pub use discovery::{parse_retry_wait, ChunkOutcome, ChunkReport, DiscoveryEngine, DiscoverySettings};
pub use normalizer::{normalize, DurationPolicy, DEFAULT_FLOOR_SECONDS};

/// Inclusive bounds on a segment's length, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationWindow {
    pub min_seconds: u32,
    pub max_seconds: u32,
}

impl DurationWindow {
    pub fn new(min_seconds: u32, max_seconds: u32) -> Self {
        Self {
            min_seconds,
            max_seconds,
        }
    }

    pub fn contains(&self, seconds: u32) -> bool {
        seconds >= self.min_seconds && seconds <= self.max_seconds
    }
}

/// A time range the text-generation service proposed. Unverified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSegment {
    pub title: String,
    pub start_time: Timecode,
    pub end_time: Timecode,
    pub chunk_index: usize,
}

impl CandidateSegment {
    pub fn new(title: impl Into<String>, start_time: Timecode, end_time: Timecode, chunk_index: usize) -> Self {
        Self {
            title: title.into(),
            start_time,
            end_time,
            chunk_index,
        }
    }

    /// Zero when the range is inverted.
    pub fn duration_seconds(&self) -> u32 {
        self.end_time.seconds().saturating_sub(self.start_time.seconds())
    }
}

/// A validated highlight with its verbatim transcript text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedSegment {
    pub title: String,
    pub start_time: Timecode,
    pub end_time: Timecode,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub duration_seconds: f64,
    pub transcript_excerpt: String,
}

/// A candidate (or a raw proposal that never became one) that was thrown
/// away, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedSegment {
    pub stage: String,
    pub title: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub chunk_index: Option<usize>,
    pub reason: String,
}

impl DroppedSegment {
    pub fn candidate(stage: &str, candidate: &CandidateSegment, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            title: Some(candidate.title.clone()),
            start_time: Some(candidate.start_time.to_string()),
            end_time: Some(candidate.end_time.to_string()),
            chunk_index: Some(candidate.chunk_index),
            reason: reason.into(),
        }
    }
}
