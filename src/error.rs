use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::acquisition::StrategyResult;
use crate::processor::Diagnostics;

/// Failure of the whole acquisition chain for one video.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("No transcript available: {message}")]
    NoContent {
        message: String,
        trail: Vec<StrategyResult>,
    },

    #[error("All acquisition strategies failed ({} attempts)", trail.len())]
    Exhausted { trail: Vec<StrategyResult> },

    #[error("Acquisition cancelled")]
    Cancelled { trail: Vec<StrategyResult> },
}

impl AcquisitionError {
    pub fn trail(&self) -> &[StrategyResult] {
        match self {
            AcquisitionError::NoContent { trail, .. }
            | AcquisitionError::Exhausted { trail }
            | AcquisitionError::Cancelled { trail } => trail,
        }
    }
}

/// What a caller gets back when no highlights can be produced. Every variant
/// that comes out of a run carries the diagnostics gathered so far.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source has no transcript for this video.
    #[error("No transcript available for this video: {message}")]
    NoContentAvailable {
        message: String,
        diagnostics: Box<Diagnostics>,
    },

    /// Every acquisition strategy failed transiently or was rate limited.
    #[error("Could not acquire a transcript: all strategies failed or were blocked")]
    AcquisitionExhausted { diagnostics: Box<Diagnostics> },

    /// A transcript existed but nothing satisfied the segment constraints.
    #[error("No suitable highlight segments found in the transcript")]
    NoSuitableSegments { diagnostics: Box<Diagnostics> },

    #[error("Request cancelled")]
    Cancelled { diagnostics: Box<Diagnostics> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Stable machine-readable name, used by the CLI and the job registry.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NoContentAvailable { .. } => "NoContentAvailable",
            PipelineError::AcquisitionExhausted { .. } => "AcquisitionExhausted",
            PipelineError::NoSuitableSegments { .. } => "NoSuitableSegments",
            PipelineError::Cancelled { .. } => "Cancelled",
            PipelineError::InvalidRequest(_) => "InvalidRequest",
            PipelineError::Config(_) => "Config",
        }
    }

    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            PipelineError::NoContentAvailable { diagnostics, .. }
            | PipelineError::AcquisitionExhausted { diagnostics }
            | PipelineError::NoSuitableSegments { diagnostics }
            | PipelineError::Cancelled { diagnostics } => Some(diagnostics),
            PipelineError::InvalidRequest(_) | PipelineError::Config(_) => None,
        }
    }
}

/// Errors from the text-generation service.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// From the `retry-after` header, when the service sent one.
        retry_after: Option<Duration>,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Worth retrying the same request after a wait.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout(_) | LlmError::Network(_) => true,
            LlmError::ServerError { status, .. } => *status >= 500,
            LlmError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing API key: set {0} in the environment or a .env file")]
    MissingApiKey(&'static str),
}
