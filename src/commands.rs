//! Request entry points shared by the CLI and the debug binary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::analysis::AnthropicClient;
use crate::config::Config;
use crate::error::{ConfigError, PipelineError};
use crate::processor::{self, HighlightOutcome, HighlightRequest, Pipeline, TranscriptSource};
use crate::transcription::TranscriptSegment;
use crate::ytdlp::{self, TokioCommandRunner};

pub const API_KEY_NAME: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolStatus {
    pub program: String,
    pub installed: bool,
    pub version: Option<String>,
}

pub fn check_ytdlp(config: &Config) -> ToolStatus {
    let program = config.acquisition.ytdlp_path.clone();
    let installed = ytdlp::check_ytdlp_installed(&program);
    let version = if installed {
        ytdlp::get_ytdlp_version(&program).ok()
    } else {
        None
    };
    ToolStatus {
        program,
        installed,
        version,
    }
}

/// A request for a video URL or bare id.
pub fn video_request(input: &str, language_hint: Option<String>) -> Result<HighlightRequest, PipelineError> {
    let video_id = ytdlp::extract_video_id(input)
        .ok_or_else(|| PipelineError::InvalidRequest(format!("'{}' is not a video URL or id", input)))?;
    Ok(HighlightRequest {
        label: video_id.clone(),
        source: TranscriptSource::Video { video_id },
        language_hint,
    })
}

/// A request for a saved transcript: a JSON array of `{start, end, text}`.
pub fn segments_request(
    label: &str,
    json: &str,
    duration_hint: Option<f64>,
    language_hint: Option<String>,
) -> Result<HighlightRequest, PipelineError> {
    let segments: Vec<TranscriptSegment> = serde_json::from_str(json)
        .map_err(|e| PipelineError::InvalidRequest(format!("Failed to parse transcript JSON: {}", e)))?;
    Ok(HighlightRequest {
        label: label.to_string(),
        source: TranscriptSource::Segments {
            segments,
            duration_hint,
        },
        language_hint,
    })
}

pub fn text_request(
    label: &str,
    text: String,
    duration_hint: Option<f64>,
    language_hint: Option<String>,
) -> HighlightRequest {
    HighlightRequest {
        label: label.to_string(),
        source: TranscriptSource::Text { text, duration_hint },
        language_hint,
    }
}

/// Wire the production pipeline: Anthropic for discovery, yt-dlp for
/// acquisition.
pub fn build_pipeline(config: &Config) -> Result<Pipeline, PipelineError> {
    config.validate()?;
    let api_key = resolve_api_key().ok_or(ConfigError::MissingApiKey(API_KEY_NAME))?;
    let client = AnthropicClient::new(api_key, &config.discovery)
        .map_err(|e| ConfigError::Invalid(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Pipeline::from_config(config, Arc::new(client), Arc::new(TokioCommandRunner)))
}

/// Run one request to completion.
pub async fn generate_highlights(
    request: &HighlightRequest,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<HighlightOutcome, PipelineError> {
    let pipeline = build_pipeline(config)?;
    pipeline.run(request, cancel, &|_: processor::PipelineState| {}).await
}

/// Run one request in the background; poll with [`get_progress`].
pub fn start_highlights(request: HighlightRequest, config: &Config) -> Result<String, PipelineError> {
    let pipeline = build_pipeline(config)?;
    Ok(processor::start_job(Arc::new(pipeline), request))
}

pub fn get_progress(job_id: &str) -> Result<processor::Progress, String> {
    processor::get_progress(job_id).ok_or_else(|| "Job not found".to_string())
}

/// A result can be collected once; the job is forgotten afterwards.
pub fn get_result(job_id: &str) -> Result<processor::JobResult, String> {
    processor::get_result(job_id).ok_or_else(|| "Result not found".to_string())
}

pub fn cancel_highlights(job_id: &str) -> Result<(), String> {
    if processor::cancel_job(job_id) {
        Ok(())
    } else {
        Err("Job not found".to_string())
    }
}

/// The API key from the environment, or from a `.env` file in the working
/// directory or one of its parents. Surrounding quotes are stripped.
pub fn resolve_api_key() -> Option<String> {
    if let Some(key) = std::env::var(API_KEY_NAME).ok().and_then(|k| clean_key(&k)) {
        return Some(key);
    }
    let iter = dotenvy::dotenv_iter().ok()?;
    iter.filter_map(Result::ok)
        .find(|(name, _)| name == API_KEY_NAME)
        .and_then(|(_, value)| clean_key(&value))
}

fn clean_key(raw: &str) -> Option<String> {
    let key = raw.trim().trim_matches('"').trim_matches('\'').to_string();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
