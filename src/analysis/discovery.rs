//! Chunk-by-chunk highlight discovery against a text-generation service.
//!
//! Each chunk gets one forced-tool request. Whatever comes back is treated as
//! untrusted input: entries are checked one by one and anything that does not
//! fit the schema or the duration window is dropped, never repaired.
//!
//! Rate limits are handled per chunk: the wait suggested by the service (or a
//! default) plus a safety margin, up to a retry ceiling. Giving up on one
//! chunk never fails the run.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::anthropic::{hinted_wait, Generated, TextGenerator, ToolRequest};
use super::{CandidateSegment, DroppedSegment, DurationWindow};
use crate::backoff::{BackoffController, Slot};
use crate::config::Config;
use crate::error::LlmError;
use crate::transcription::{format_time, Chunk, Timecode};

pub const TOOL_NAME: &str = "report_highlights";

/// Longest controller-imposed wait a chunk will sit through before giving up.
const MAX_SLOT_WAIT: Duration = Duration::from_secs(90);

static RETRY_WAIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:try again|retry)\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*(milliseconds?|ms|minutes?|mins?|m|seconds?|secs?|s)?\b",
    )
    .expect("static retry pattern")
});

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static fence pattern")
});

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverySettings {
    /// What the service is allowed to propose, after the duration policy.
    pub window: DurationWindow,
    pub max_candidates: usize,
    pub retry_ceiling: u32,
    pub safety_margin: Duration,
    pub default_wait: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl DiscoverySettings {
    pub fn from_config(config: &Config) -> Self {
        let window = DurationWindow::new(
            config.segments.min_duration_secs,
            config.segments.max_duration_secs,
        );
        let d = &config.discovery;
        Self {
            window: config.segments.policy.discovery_window(window),
            max_candidates: d.max_candidates,
            retry_ceiling: d.retry_ceiling,
            safety_margin: Duration::from_millis(d.safety_margin_ms),
            default_wait: Duration::from_millis(d.default_wait_ms),
            timeout: Duration::from_secs(d.timeout_secs),
            concurrency: d.concurrency.max(1),
        }
    }
}

/// How a chunk's text relates to video time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeLayout {
    /// Lines carry absolute `[MM:SS]` markers.
    Timestamped,
    /// Plain text; times are interpolated from character offsets.
    Interpolated { total_chars: usize, duration: f64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub index: usize,
    pub attempts: u32,
    pub proposed: usize,
    pub kept: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub candidates: Vec<CandidateSegment>,
    pub dropped: Vec<DroppedSegment>,
    pub report: ChunkReport,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    title: String,
    #[serde(rename = "startTime")]
    start_time: String,
    #[serde(rename = "endTime")]
    end_time: String,
}

pub struct DiscoveryEngine {
    generator: Arc<dyn TextGenerator>,
    controller: Arc<BackoffController>,
    settings: DiscoverySettings,
}

impl DiscoveryEngine {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        controller: Arc<BackoffController>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            generator,
            controller,
            settings,
        }
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// Run every chunk. Results come back in chunk order whatever the
    /// concurrency; nothing new is dispatched after cancellation.
    ///
    /// `run_id` scopes the controller keys, so chunk 0 of one run never
    /// inherits the cooldown of chunk 0 of another.
    pub async fn discover_all<'c>(
        &self,
        chunks: &'c [Chunk],
        layout: TimeLayout,
        language_hint: Option<&str>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Vec<ChunkOutcome> {
        let approx = |chunk: &Chunk| match layout {
            TimeLayout::Timestamped => None,
            TimeLayout::Interpolated { total_chars, duration } => {
                Some(chunk.approx_time_range(total_chars, duration))
            }
        };

        if self.settings.concurrency <= 1 {
            let mut outcomes = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                if cancel.is_cancelled() {
                    break;
                }
                outcomes.push(self.discover(chunk, approx(chunk), language_hint, run_id, cancel).await);
            }
            return outcomes;
        }

        let collected: std::pin::Pin<Box<dyn std::future::Future<Output = Vec<ChunkOutcome>> + Send + '_>> =
            Box::pin(
                stream::iter(chunks.iter())
                    .take_while(|_: &&'c Chunk| futures::future::ready(!cancel.is_cancelled()))
                    .map(|chunk: &'c Chunk| self.discover(chunk, approx(chunk), language_hint, run_id, cancel))
                    .buffer_unordered(self.settings.concurrency)
                    .collect(),
            );
        let mut outcomes: Vec<ChunkOutcome> = collected.await;
        outcomes.sort_by_key(|o| o.report.index);
        outcomes
    }

    /// One chunk, with its own retry budget.
    pub async fn discover(
        &self,
        chunk: &Chunk,
        approx_range: Option<(f64, f64)>,
        language_hint: Option<&str>,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> ChunkOutcome {
        let key = format!("{}:chunk-{}", run_id, chunk.index);
        let request = build_request(chunk, approx_range, language_hint, &self.settings);
        let mut outcome = ChunkOutcome {
            report: ChunkReport {
                index: chunk.index,
                ..ChunkReport::default()
            },
            ..ChunkOutcome::default()
        };
        let mut retries = 0u32;

        loop {
            match self.controller.acquire_slot(&key, MAX_SLOT_WAIT, cancel).await {
                Slot::Granted => {}
                Slot::Cancelled => {
                    outcome.report.error = Some("cancelled".to_string());
                    return outcome;
                }
                Slot::Denied(decision) => {
                    let reason = decision.reason.map(|r| r.to_string()).unwrap_or_default();
                    tracing::warn!(chunk = chunk.index, %reason, "Giving up on chunk: rate limiter denied");
                    outcome.report.error = Some(format!("rate limiter: {}", reason));
                    return outcome;
                }
            }

            outcome.report.attempts += 1;
            tracing::info!(
                chunk = chunk.index,
                total = chunk.total_chunks,
                attempt = outcome.report.attempts,
                "Discovering highlights"
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.report.error = Some("cancelled".to_string());
                    return outcome;
                }
                r = tokio::time::timeout(self.settings.timeout, self.generator.generate(&request)) => {
                    r.unwrap_or(Err(LlmError::Timeout(self.settings.timeout)))
                }
            };

            let error = match result {
                Ok(generated) => {
                    self.controller.record_success(&key);
                    self.accept(generated, chunk.index, &mut outcome);
                    return outcome;
                }
                Err(e) => e,
            };

            self.controller.record_failure(&key, &error.to_string());
            if !error.is_retryable() || retries >= self.settings.retry_ceiling {
                tracing::warn!(
                    chunk = chunk.index,
                    attempts = outcome.report.attempts,
                    error = %error,
                    "Giving up on chunk"
                );
                outcome.report.error = Some(error.to_string());
                return outcome;
            }
            retries += 1;

            // Other retryable errors wait on the controller's cooldown instead.
            if let LlmError::RateLimited { message, retry_after } = &error {
                let wait = parse_retry_wait(message)
                    .or(*retry_after)
                    .unwrap_or(self.settings.default_wait)
                    + self.settings.safety_margin;
                tracing::warn!(
                    chunk = chunk.index,
                    wait_ms = wait.as_millis() as u64,
                    retry = retries,
                    "Rate limited, waiting before retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outcome.report.error = Some("cancelled".to_string());
                        return outcome;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            } else {
                tracing::warn!(chunk = chunk.index, error = %error, retry = retries, "Discovery failed, retrying");
            }
        }
    }

    fn accept(&self, generated: Generated, chunk_index: usize, outcome: &mut ChunkOutcome) {
        let entries = match extract_entries(generated) {
            Ok(entries) => entries,
            Err(reason) => {
                tracing::warn!(chunk = chunk_index, %reason, "Unusable discovery response");
                outcome.report.error = Some(reason);
                return;
            }
        };
        outcome.report.proposed = entries.len();

        for entry in entries {
            match validate_entry(entry, chunk_index, self.settings.window) {
                Ok(candidate) if outcome.candidates.len() < self.settings.max_candidates => {
                    outcome.candidates.push(candidate);
                }
                Ok(candidate) => outcome.dropped.push(DroppedSegment::candidate(
                    "discovery",
                    &candidate,
                    format!("over the limit of {} per chunk", self.settings.max_candidates),
                )),
                Err(dropped) => {
                    tracing::debug!(chunk = chunk_index, reason = %dropped.reason, "Dropping proposal");
                    outcome.dropped.push(dropped);
                }
            }
        }
        outcome.report.kept = outcome.candidates.len();
        tracing::info!(
            chunk = chunk_index,
            proposed = outcome.report.proposed,
            kept = outcome.report.kept,
            "Chunk discovery done"
        );
    }
}

/// The suggested wait inside a rate-limit message, e.g. "try again in 6.5s"
/// or "retry after 30 seconds". A bare number means seconds. Absurd hints
/// yield `None` so the default wait applies.
pub fn parse_retry_wait(message: &str) -> Option<Duration> {
    let caps = RETRY_WAIT.captures(message)?;
    let value: f64 = caps[1].parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    let seconds = match unit.as_deref() {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => value / 1000.0,
        Some(u) if u.starts_with('m') => value * 60.0,
        _ => value,
    };
    hinted_wait(seconds)
}

/// Pull the list of proposals out of whatever shape the service answered in.
fn extract_entries(generated: Generated) -> Result<Vec<serde_json::Value>, String> {
    let value = match generated {
        Generated::Structured(value) => value,
        Generated::Text(text) => parse_json_text(&text)?,
    };
    match value {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("segments") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            Some(_) => Err("'segments' is not an array".to_string()),
            None => Err("response has no 'segments' field".to_string()),
        },
        _ => Err("response is neither an object nor an array".to_string()),
    }
}

fn parse_json_text(text: &str) -> Result<serde_json::Value, String> {
    let body = FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim();
    if let Ok(value) = serde_json::from_str(body) {
        return Ok(value);
    }
    // Prose around the JSON: take the outermost bracketed span.
    let open = body.find(['[', '{']);
    let close = body.rfind([']', '}']);
    match (open, close) {
        (Some(a), Some(b)) if b > a => serde_json::from_str(&body[a..=b])
            .map_err(|e| format!("response text is not valid JSON: {}", e)),
        _ => Err("response text contains no JSON".to_string()),
    }
}

fn validate_entry(
    entry: serde_json::Value,
    chunk_index: usize,
    window: DurationWindow,
) -> Result<CandidateSegment, DroppedSegment> {
    let reject = |title: Option<String>, start: Option<String>, end: Option<String>, reason: String| DroppedSegment {
        stage: "discovery".to_string(),
        title,
        start_time: start,
        end_time: end,
        chunk_index: Some(chunk_index),
        reason,
    };

    let raw: RawProposal = serde_json::from_value(entry)
        .map_err(|e| reject(None, None, None, format!("schema: {}", e)))?;
    let title = raw.title.trim().to_string();
    let keep = || (Some(title.clone()), Some(raw.start_time.clone()), Some(raw.end_time.clone()));

    if title.is_empty() {
        let (t, s, e) = keep();
        return Err(reject(t, s, e, "empty title".to_string()));
    }
    let parsed = raw
        .start_time
        .parse::<Timecode>()
        .and_then(|s| raw.end_time.parse::<Timecode>().map(|e| (s, e)));
    let (start, end) = match parsed {
        Ok(pair) => pair,
        Err(e) => {
            let (t, s, en) = keep();
            return Err(reject(t, s, en, e.to_string()));
        }
    };
    if end <= start {
        let (t, s, e) = keep();
        return Err(reject(t, s, e, "end is not after start".to_string()));
    }
    let candidate = CandidateSegment::new(title, start, end, chunk_index);
    let duration = candidate.duration_seconds();
    if !window.contains(duration) {
        return Err(DroppedSegment::candidate(
            "discovery",
            &candidate,
            format!(
                "duration {}s outside {}-{}s",
                duration, window.min_seconds, window.max_seconds
            ),
        ));
    }
    Ok(candidate)
}

const SYSTEM_PROMPT: &str = "You are an editor who finds the most engaging, self-contained moments in long-form \
video transcripts so they can be cut into short clips. A good highlight starts at the beginning of a thought, \
ends when the thought is complete, and makes sense without the surrounding context. \
Only use times that appear in or can be derived from the transcript you are given. \
Report your picks with the report_highlights tool.";

fn input_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "segments": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "description": "Short, catchy title for the clip"},
                        "startTime": {"type": "string", "pattern": "^\\d{1,3}:[0-5]\\d$", "description": "MM:SS from the start of the video"},
                        "endTime": {"type": "string", "pattern": "^\\d{1,3}:[0-5]\\d$", "description": "MM:SS from the start of the video"}
                    },
                    "required": ["title", "startTime", "endTime"]
                }
            }
        },
        "required": ["segments"]
    })
}

pub fn build_request(
    chunk: &Chunk,
    approx_range: Option<(f64, f64)>,
    language_hint: Option<&str>,
    settings: &DiscoverySettings,
) -> ToolRequest {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "This is part {} of {} of the transcript.\n",
        chunk.index + 1,
        chunk.total_chunks
    ));
    match approx_range {
        Some((start, end)) => prompt.push_str(&format!(
            "It has no timestamps. It covers roughly {} to {} of the video; estimate times within that range \
             from the position of the text.\n",
            format_time(start),
            format_time(end)
        )),
        None => prompt.push_str(
            "Each line starts with its absolute [MM:SS] position in the video. Use those positions.\n",
        ),
    }
    if let Some(lang) = language_hint {
        prompt.push_str(&format!(
            "The transcript language is '{}'. Write titles in that language.\n",
            lang
        ));
    }
    prompt.push_str(&format!(
        "\nFind up to {} highlights. Each must last between {} and {} seconds (endTime - startTime). \
         Times are MM:SS from the start of the whole video; minutes may exceed 59. \
         Highlights must not overlap. If nothing qualifies, return an empty list.\n\n\
         <transcript>\n{}\n</transcript>",
        settings.max_candidates,
        settings.window.min_seconds,
        settings.window.max_seconds,
        chunk.text.trim_end()
    ));

    ToolRequest {
        system: SYSTEM_PROMPT.to_string(),
        prompt,
        tool_name: TOOL_NAME.to_string(),
        tool_description: "Report the highlight segments found in this part of the transcript.".to_string(),
        input_schema: input_schema(),
    }
}
