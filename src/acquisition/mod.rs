//! Getting a transcript out of the video platform.
//!
//! The platform is unreliable and actively pushes back on scrapers, so
//! acquisition is an ordered list of [`Strategy`] implementations tried by
//! [`StrategyChain`], each one gated by a shared
//! [`BackoffController`](crate::backoff::BackoffController).

pub mod captions;
pub mod chain;
pub mod strategies;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backoff::{classify_failure, FailureKind};
use crate::transcription::TranscriptSegment;

pub use chain::{Acquisition, StrategyChain};
pub use strategies::{default_strategies, StrategyKind, YtDlpStrategy};

/// Text fragments meaning the video simply has no transcript to give.
const NO_CONTENT_SIGNATURES: &[&str] = &[
    "there are no subtitles",
    "has no subtitles",
    "no subtitles",
    "doesn't have subtitles",
    "subtitles are disabled",
    "captions are disabled",
    "transcript is disabled",
    "transcripts are disabled",
    "disabled by",
    "no captions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The source explicitly has no captions. Terminal.
    NoContent,
    Timeout,
    /// The tool ran but produced nothing we could use.
    Malformed,
    /// Bot detection or throttling.
    Hostile,
    Transient,
    /// The backoff controller would not let us try in time.
    RateLimited,
    /// The strategy is not usable with the current configuration.
    Skipped,
}

impl ErrorClass {
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorClass::NoContent)
    }
}

/// Why one strategy attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl AttemptFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Classify free-form tool output.
    pub fn from_output(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_message(&message),
            message,
        }
    }
}

/// One entry of the diagnostic trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub segments: Vec<TranscriptSegment>,
    pub error_class: Option<ErrorClass>,
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

impl StrategyResult {
    pub fn succeeded(name: &str, segments: Vec<TranscriptSegment>, elapsed_ms: u64) -> Self {
        Self {
            strategy_name: name.to_string(),
            success: true,
            segments,
            error_class: None,
            message: None,
            elapsed_ms,
        }
    }

    pub fn failed(name: &str, failure: AttemptFailure, elapsed_ms: u64) -> Self {
        Self {
            strategy_name: name.to_string(),
            success: false,
            segments: Vec::new(),
            error_class: Some(failure.class),
            message: Some(failure.message),
            elapsed_ms,
        }
    }
}

/// One way of pulling captions from the source.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// False when the strategy cannot run with the current configuration
    /// (for example no cookie file). Unavailable strategies are skipped
    /// without consuming a rate-limit slot.
    fn is_available(&self) -> bool {
        true
    }

    async fn attempt(&self, video_id: &str) -> Result<Vec<TranscriptSegment>, AttemptFailure>;
}

/// No-content signatures win over hostile ones: a video without captions is
/// not going to get captions by trying harder.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if NO_CONTENT_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return ErrorClass::NoContent;
    }
    match classify_failure(message) {
        FailureKind::Hostile => ErrorClass::Hostile,
        FailureKind::Ordinary => ErrorClass::Transient,
    }
}
