//! The pipeline coordinator: acquisition, chunking, discovery, resolution,
//! extraction and the final gates, plus the in-process job registry.

use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::acquisition::{default_strategies, StrategyChain, StrategyResult};
use crate::analysis::discovery::TimeLayout;
use crate::analysis::{
    dedup, normalize, AcceptedSegment, CandidateSegment, ChunkReport, DiscoveryEngine, DiscoverySettings,
    DroppedSegment, DurationPolicy, DurationWindow, TextGenerator,
};
use crate::backoff::{BackoffConfig, BackoffController};
use crate::config::{Config, SegmentConfig};
use crate::error::{AcquisitionError, PipelineError};
use crate::transcription::{
    self, extract, format_time, is_time_ordered, synthesize_segments, timestamped_text, RawTranscript,
    TranscriptSegment,
};
use crate::ytdlp::CommandRunner;

static SOURCE_CONTROLLER: OnceCell<Arc<BackoffController>> = OnceCell::new();
static DISCOVERY_CONTROLLER: OnceCell<Arc<BackoffController>> = OnceCell::new();

/// The process-wide controller for the video platform. The first caller's
/// config wins.
pub fn source_controller(config: &BackoffConfig) -> Arc<BackoffController> {
    Arc::clone(SOURCE_CONTROLLER.get_or_init(|| Arc::new(BackoffController::new("source", config.clone()))))
}

/// The process-wide controller for the text-generation service.
pub fn discovery_controller(config: &BackoffConfig) -> Arc<BackoffController> {
    Arc::clone(DISCOVERY_CONTROLLER.get_or_init(|| Arc::new(BackoffController::new("discovery", config.clone()))))
}

/// Truncate a string to at most `max_chars` characters (UTF-8 safe).
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Where the transcript comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptSource {
    /// Fetch captions for this video id through the acquisition chain.
    Video { video_id: String },
    /// Caller-supplied timed segments.
    Segments {
        segments: Vec<TranscriptSegment>,
        duration_hint: Option<f64>,
    },
    /// Caller-supplied plain text. Needs a duration to place anything in time.
    Text { text: String, duration_hint: Option<f64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightRequest {
    /// Shown in logs and the report.
    pub label: String,
    pub source: TranscriptSource,
    pub language_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    AcquireTranscript,
    PlanChunks,
    Discover,
    Deduplicate,
    Normalize,
    Extract,
    Validate,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::AcquireTranscript => "acquiring_transcript",
            PipelineState::PlanChunks => "planning_chunks",
            PipelineState::Discover => "discovering",
            PipelineState::Deduplicate => "deduplicating",
            PipelineState::Normalize => "normalizing",
            PipelineState::Extract => "extracting",
            PipelineState::Validate => "validating",
            PipelineState::Done => "done",
            PipelineState::Failed => "error",
        }
    }

    /// Rough percentage shown to job pollers when the state is entered.
    pub fn progress(&self) -> f64 {
        match self {
            PipelineState::AcquireTranscript => 0.0,
            PipelineState::PlanChunks => 20.0,
            PipelineState::Discover => 25.0,
            PipelineState::Deduplicate => 85.0,
            PipelineState::Normalize => 88.0,
            PipelineState::Extract => 90.0,
            PipelineState::Validate => 95.0,
            PipelineState::Done | PipelineState::Failed => 100.0,
        }
    }
}

/// Everything recorded along the way, success or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub strategies: Vec<StrategyResult>,
    pub chunks: Vec<ChunkReport>,
    pub dropped: Vec<DroppedSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightOutcome {
    pub label: String,
    /// Acquisition strategy that produced the transcript, if one ran.
    pub strategy: Option<String>,
    pub transcript_chars: usize,
    pub transcript_words: usize,
    pub duration_seconds: f64,
    pub chunk_count: usize,
    pub segments: Vec<AcceptedSegment>,
    pub diagnostics: Diagnostics,
    pub elapsed_ms: u64,
}

pub struct Pipeline {
    chain: Option<StrategyChain>,
    discovery: DiscoveryEngine,
    window: DurationWindow,
    policy: DurationPolicy,
    min_excerpt_chars: usize,
    max_chunk_chars: usize,
    debug_dir: Option<PathBuf>,
}

struct Transcript {
    segments: Vec<TranscriptSegment>,
    raw: RawTranscript,
    timestamped: bool,
    strategy: Option<String>,
}

impl Pipeline {
    pub fn new(
        chain: Option<StrategyChain>,
        discovery: DiscoveryEngine,
        segments: &SegmentConfig,
        max_chunk_chars: usize,
    ) -> Self {
        Self {
            chain,
            discovery,
            window: DurationWindow::new(segments.min_duration_secs, segments.max_duration_secs),
            policy: segments.policy,
            min_excerpt_chars: segments.min_excerpt_chars,
            max_chunk_chars,
            debug_dir: None,
        }
    }

    /// Production wiring: yt-dlp strategies and the process-wide controllers.
    pub fn from_config(config: &Config, generator: Arc<dyn TextGenerator>, runner: Arc<dyn CommandRunner>) -> Self {
        let acq = &config.acquisition;
        let chain = StrategyChain::new(
            default_strategies(acq, runner),
            source_controller(&config.backoff.source),
            acq.min_transcript_chars,
            std::time::Duration::from_secs(acq.max_strategy_wait_secs),
        );
        let discovery = DiscoveryEngine::new(
            generator,
            discovery_controller(&config.backoff.discovery),
            DiscoverySettings::from_config(config),
        );
        Self::new(Some(chain), discovery, &config.segments, config.discovery.max_chunk_chars)
            .with_debug_dir(config.debug_dir.clone())
    }

    pub fn with_debug_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_dir = dir;
        self
    }

    pub async fn run(
        &self,
        request: &HighlightRequest,
        cancel: &CancellationToken,
        on_state: &(dyn Fn(PipelineState) + Send + Sync),
    ) -> Result<HighlightOutcome, PipelineError> {
        let started = Instant::now();
        let mut diagnostics = Diagnostics::default();
        let result = self.run_inner(request, cancel, on_state, &mut diagnostics, started).await;
        match &result {
            Ok(outcome) => {
                on_state(PipelineState::Done);
                tracing::info!(
                    label = %request.label,
                    segments = outcome.segments.len(),
                    elapsed_ms = outcome.elapsed_ms,
                    "Highlights ready"
                );
            }
            Err(e) => {
                on_state(PipelineState::Failed);
                tracing::warn!(label = %request.label, kind = e.kind(), error = %e, "Pipeline failed");
            }
        }
        result
    }

    async fn run_inner(
        &self,
        request: &HighlightRequest,
        cancel: &CancellationToken,
        on_state: &(dyn Fn(PipelineState) + Send + Sync),
        diagnostics: &mut Diagnostics,
        started: Instant,
    ) -> Result<HighlightOutcome, PipelineError> {
        let enter = |state: PipelineState| {
            tracing::info!(label = %request.label, state = state.as_str(), "Pipeline state");
            on_state(state);
        };

        enter(PipelineState::AcquireTranscript);
        let transcript = self.acquire(&request.source, cancel, diagnostics).await?;
        self.save_debug_file(&request.label, "1_transcript", &transcript.segments);
        let duration = transcript
            .raw
            .duration_hint
            .unwrap_or_else(|| transcript.segments.last().map_or(0.0, |s| s.end));

        enter(PipelineState::PlanChunks);
        let (text, layout) = if transcript.timestamped {
            (timestamped_text(&transcript.segments), TimeLayout::Timestamped)
        } else {
            let text = transcript.raw.text.clone();
            let total_chars = text.chars().count();
            (text, TimeLayout::Interpolated { total_chars, duration })
        };
        let chunks = transcription::plan(&text, self.max_chunk_chars);
        tracing::info!(chunks = chunks.len(), chars = text.chars().count(), "Planned chunks");

        enter(PipelineState::Discover);
        let run_id = Uuid::new_v4().to_string();
        let outcomes = self
            .discovery
            .discover_all(&chunks, layout, request.language_hint.as_deref(), &run_id, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                diagnostics: Box::new(std::mem::take(diagnostics)),
            });
        }
        let mut candidates: Vec<CandidateSegment> = Vec::new();
        for outcome in outcomes {
            candidates.extend(outcome.candidates);
            diagnostics.dropped.extend(outcome.dropped);
            diagnostics.chunks.push(outcome.report);
        }
        self.save_debug_file(&request.label, "2_candidates", &candidates);
        if candidates.is_empty() {
            return Err(no_suitable(diagnostics));
        }

        enter(PipelineState::Deduplicate);
        let mut resolved = dedup::resolve(candidates.clone());
        record_removed(&candidates, &resolved, "dedup", "duplicate or overlaps an earlier segment", diagnostics);
        self.save_debug_file(&request.label, "3_resolved", &resolved);

        if let DurationPolicy::Floor { min_seconds } = self.policy {
            enter(PipelineState::Normalize);
            let transcript_end = duration.max(0.0).ceil() as u32;
            resolved = normalize(resolved, min_seconds, self.window.max_seconds, transcript_end);
        }

        enter(PipelineState::Extract);
        let mut accepted = Vec::with_capacity(resolved.len());
        for candidate in &resolved {
            let excerpt = extract(&transcript.segments, candidate.start_time, candidate.end_time);
            if excerpt.is_empty() {
                diagnostics
                    .dropped
                    .push(DroppedSegment::candidate("extract", candidate, "no transcript text in range"));
                continue;
            }
            let start_seconds = candidate.start_time.as_secs_f64();
            let end_seconds = candidate.end_time.as_secs_f64();
            accepted.push((
                candidate,
                AcceptedSegment {
                    title: candidate.title.clone(),
                    start_time: candidate.start_time,
                    end_time: candidate.end_time,
                    start_seconds,
                    end_seconds,
                    duration_seconds: end_seconds - start_seconds,
                    transcript_excerpt: excerpt,
                },
            ));
        }

        enter(PipelineState::Validate);
        let window = self.policy.validation_window(self.window);
        let mut segments = Vec::with_capacity(accepted.len());
        for (candidate, segment) in accepted {
            let excerpt_chars = segment.transcript_excerpt.chars().count();
            if !window.contains(candidate.duration_seconds()) {
                diagnostics.dropped.push(DroppedSegment::candidate(
                    "validate",
                    candidate,
                    format!(
                        "duration {}s outside {}-{}s",
                        candidate.duration_seconds(),
                        window.min_seconds,
                        window.max_seconds
                    ),
                ));
            } else if excerpt_chars < self.min_excerpt_chars {
                diagnostics.dropped.push(DroppedSegment::candidate(
                    "validate",
                    candidate,
                    format!("excerpt has {} chars, need {}", excerpt_chars, self.min_excerpt_chars),
                ));
            } else {
                segments.push(segment);
            }
        }
        if segments.is_empty() {
            return Err(no_suitable(diagnostics));
        }

        let outcome = HighlightOutcome {
            label: request.label.clone(),
            strategy: transcript.strategy,
            transcript_chars: transcript.raw.char_count(),
            transcript_words: transcript.raw.word_count(),
            duration_seconds: duration,
            chunk_count: chunks.len(),
            segments,
            diagnostics: std::mem::take(diagnostics),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.save_debug_file(&request.label, "4_outcome", &outcome);
        Ok(outcome)
    }

    async fn acquire(
        &self,
        source: &TranscriptSource,
        cancel: &CancellationToken,
        diagnostics: &mut Diagnostics,
    ) -> Result<Transcript, PipelineError> {
        match source {
            TranscriptSource::Video { video_id } => {
                let chain = self.chain.as_ref().ok_or_else(|| {
                    PipelineError::InvalidRequest("no acquisition strategies configured".to_string())
                })?;
                match chain.acquire(video_id, cancel).await {
                    Ok(acquisition) => {
                        diagnostics.strategies = acquisition.trail;
                        let raw = RawTranscript::from_segments(&acquisition.segments, None);
                        Ok(Transcript {
                            segments: acquisition.segments,
                            raw,
                            timestamped: true,
                            strategy: Some(acquisition.strategy),
                        })
                    }
                    Err(err) => {
                        diagnostics.strategies = err.trail().to_vec();
                        let diagnostics = Box::new(std::mem::take(diagnostics));
                        Err(match err {
                            AcquisitionError::NoContent { message, .. } => {
                                PipelineError::NoContentAvailable { message, diagnostics }
                            }
                            AcquisitionError::Exhausted { .. } => PipelineError::AcquisitionExhausted { diagnostics },
                            AcquisitionError::Cancelled { .. } => PipelineError::Cancelled { diagnostics },
                        })
                    }
                }
            }
            TranscriptSource::Segments { segments, duration_hint } => {
                let mut segments: Vec<TranscriptSegment> = segments
                    .iter()
                    .filter(|s| s.end > s.start && !s.text.trim().is_empty())
                    .cloned()
                    .collect();
                if !is_time_ordered(&segments) {
                    tracing::warn!("Supplied segments are out of order, sorting by start");
                    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
                }
                if segments.is_empty() {
                    return Err(PipelineError::NoContentAvailable {
                        message: "supplied transcript is empty".to_string(),
                        diagnostics: Box::new(std::mem::take(diagnostics)),
                    });
                }
                let raw = RawTranscript::from_segments(&segments, *duration_hint);
                Ok(Transcript {
                    segments,
                    raw,
                    timestamped: true,
                    strategy: None,
                })
            }
            TranscriptSource::Text { text, duration_hint } => {
                let duration = duration_hint.filter(|d| *d > 0.0).ok_or_else(|| {
                    PipelineError::InvalidRequest("a plain-text transcript needs a duration hint".to_string())
                })?;
                if text.trim().is_empty() {
                    return Err(PipelineError::NoContentAvailable {
                        message: "supplied transcript is empty".to_string(),
                        diagnostics: Box::new(std::mem::take(diagnostics)),
                    });
                }
                Ok(Transcript {
                    segments: synthesize_segments(text, duration),
                    raw: RawTranscript::new(text.clone(), Some(duration)),
                    timestamped: false,
                    strategy: None,
                })
            }
        }
    }

    /// Write a debug JSON file into the debug directory, when one is set.
    fn save_debug_file(&self, label: &str, step: &str, data: &impl Serialize) {
        let Some(dir) = &self.debug_dir else { return };
        save_debug_file(dir, label, step, data);
    }
}

fn no_suitable(diagnostics: &mut Diagnostics) -> PipelineError {
    PipelineError::NoSuitableSegments {
        diagnostics: Box::new(std::mem::take(diagnostics)),
    }
}

/// Note every candidate that did not make it from `before` into `after`.
fn record_removed(
    before: &[CandidateSegment],
    after: &[CandidateSegment],
    stage: &str,
    reason: &str,
    diagnostics: &mut Diagnostics,
) {
    for (candidate, kept) in before.iter().zip(dedup::survivors(before, after)) {
        if !kept {
            diagnostics
                .dropped
                .push(DroppedSegment::candidate(stage, candidate, reason));
        }
    }
}

fn save_debug_file(dir: &Path, label: &str, step: &str, data: &impl Serialize) {
    let stem: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let debug_path = dir.join(format!("{}_{}.json", stem, step));
    match serde_json::to_string_pretty(data) {
        Ok(json) => {
            if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&debug_path, &json)) {
                tracing::warn!(path = %debug_path.display(), error = %e, "Failed to write debug file");
            } else {
                tracing::debug!(path = %debug_path.display(), "Debug file written");
            }
        }
        Err(e) => tracing::warn!(step, error = %e, "Failed to serialize debug data"),
    }
}

/// Plain-text report of one run, good or bad.
pub fn render_report(label: &str, result: &Result<HighlightOutcome, PipelineError>) -> String {
    let mut report = String::new();

    writeln!(report, "=== AutoClip Report ===").ok();
    writeln!(report, "Source: {}", label).ok();

    let diagnostics = match result {
        Ok(outcome) => {
            writeln!(report, "Status: OK ({} highlights)", outcome.segments.len()).ok();
            if let Some(strategy) = &outcome.strategy {
                writeln!(report, "Transcript via: {}", strategy).ok();
            }
            writeln!(
                report,
                "Transcript: {} chars, {} words, {}",
                outcome.transcript_chars,
                outcome.transcript_words,
                format_time(outcome.duration_seconds)
            )
            .ok();
            writeln!(report, "Chunks: {}", outcome.chunk_count).ok();
            writeln!(report, "Elapsed: {:.1}s", outcome.elapsed_ms as f64 / 1000.0).ok();
            Some(&outcome.diagnostics)
        }
        Err(e) => {
            writeln!(report, "Status: FAILED ({})", e.kind()).ok();
            writeln!(report, "Error: {}", e).ok();
            e.diagnostics()
        }
    };
    writeln!(report).ok();

    if let Some(diagnostics) = diagnostics {
        if !diagnostics.strategies.is_empty() {
            writeln!(report, "--- Acquisition ---").ok();
            for (i, attempt) in diagnostics.strategies.iter().enumerate() {
                let status = if attempt.success {
                    format!("OK ({} segments)", attempt.segments.len())
                } else {
                    format!(
                        "{:?}: {}",
                        attempt.error_class.unwrap_or(crate::acquisition::ErrorClass::Transient),
                        truncate_str(attempt.message.as_deref().unwrap_or(""), 160)
                    )
                };
                writeln!(report, "#{} {} [{}ms] {}", i + 1, attempt.strategy_name, attempt.elapsed_ms, status).ok();
            }
            writeln!(report).ok();
        }

        if !diagnostics.chunks.is_empty() {
            writeln!(report, "--- Discovery ---").ok();
            for chunk in &diagnostics.chunks {
                write!(
                    report,
                    "Chunk {}: {} attempt(s), {} proposed, {} kept",
                    chunk.index + 1,
                    chunk.attempts,
                    chunk.proposed,
                    chunk.kept
                )
                .ok();
                if let Some(error) = &chunk.error {
                    write!(report, " (error: {})", truncate_str(error, 160)).ok();
                }
                writeln!(report).ok();
            }
            writeln!(report).ok();
        }

        if !diagnostics.dropped.is_empty() {
            writeln!(report, "--- Dropped ---").ok();
            for dropped in &diagnostics.dropped {
                writeln!(
                    report,
                    "[{}] \"{}\" {}-{}: {}",
                    dropped.stage,
                    dropped.title.as_deref().unwrap_or("?"),
                    dropped.start_time.as_deref().unwrap_or("?"),
                    dropped.end_time.as_deref().unwrap_or("?"),
                    dropped.reason
                )
                .ok();
            }
            writeln!(report).ok();
        }
    }

    if let Ok(outcome) = result {
        writeln!(report, "--- Highlights ---").ok();
        for (i, segment) in outcome.segments.iter().enumerate() {
            writeln!(
                report,
                "#{} {} - {} ({:.0}s) \"{}\"",
                i + 1,
                segment.start_time,
                segment.end_time,
                segment.duration_seconds,
                segment.title
            )
            .ok();
            writeln!(report, "    {}", truncate_str(&segment.transcript_excerpt, 200)).ok();
        }
    }

    report
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Completed { outcome: HighlightOutcome },
    Failed {
        kind: String,
        message: String,
        diagnostics: Option<Diagnostics>,
    },
}

impl From<Result<HighlightOutcome, PipelineError>> for JobResult {
    fn from(result: Result<HighlightOutcome, PipelineError>) -> Self {
        match result {
            Ok(outcome) => JobResult::Completed { outcome },
            Err(e) => JobResult::Failed {
                kind: e.kind().to_string(),
                message: e.to_string(),
                diagnostics: e.diagnostics().cloned(),
            },
        }
    }
}

/// Finished jobs nobody collected are dropped after this long.
const FINISHED_JOB_TTL: std::time::Duration = std::time::Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Job {
    progress: Progress,
    result: Option<JobResult>,
    finished_at: Option<std::time::Instant>,
    cancel: CancellationToken,
}

static JOBS: Lazy<Arc<Mutex<HashMap<String, Job>>>> = Lazy::new(|| Arc::new(Mutex::new(HashMap::new())));

fn jobs() -> std::sync::MutexGuard<'static, HashMap<String, Job>> {
    JOBS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn update_progress(job_id: &str, state: PipelineState) {
    if let Some(job) = jobs().get_mut(job_id) {
        job.progress.stage = state.as_str().to_string();
        job.progress.progress = state.progress();
    }
}

fn prune_finished(jobs: &mut HashMap<String, Job>, now: std::time::Instant) {
    jobs.retain(|_, job| {
        job.finished_at
            .map_or(true, |at| now.saturating_duration_since(at) < FINISHED_JOB_TTL)
    });
}

/// Spawn a run on the current tokio runtime and return its job id.
pub fn start_job(pipeline: Arc<Pipeline>, request: HighlightRequest) -> String {
    let job_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();

    let mut registry = jobs();
    prune_finished(&mut registry, std::time::Instant::now());
    registry.insert(
        job_id.clone(),
        Job {
            progress: Progress {
                stage: PipelineState::AcquireTranscript.as_str().to_string(),
                progress: 0.0,
            },
            result: None,
            finished_at: None,
            cancel: cancel.clone(),
        },
    );
    drop(registry);

    let id = job_id.clone();
    tokio::spawn(async move {
        let progress_id = id.clone();
        let on_state = move |state: PipelineState| update_progress(&progress_id, state);
        let result = pipeline.run(&request, &cancel, &on_state).await;
        if let Some(job) = jobs().get_mut(&id) {
            job.result = Some(JobResult::from(result));
            job.finished_at = Some(std::time::Instant::now());
        }
    });

    job_id
}

pub fn get_progress(job_id: &str) -> Option<Progress> {
    jobs().get(job_id).map(|job| job.progress.clone())
}

/// Hand over a finished job's result and forget the job. `None` while it is
/// still running.
pub fn get_result(job_id: &str) -> Option<JobResult> {
    let mut jobs = jobs();
    if jobs.get(job_id)?.result.is_none() {
        return None;
    }
    jobs.remove(job_id).and_then(|job| job.result)
}

/// Returns false for an unknown job.
pub fn cancel_job(job_id: &str) -> bool {
    match jobs().get(job_id) {
        Some(job) => {
            job.cancel.cancel();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Generated, ToolRequest};
    use crate::error::LlmError;
    use crate::transcription::Timecode;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(serde_json::Value);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _request: &ToolRequest) -> Result<Generated, LlmError> {
            Ok(Generated::Structured(self.0.clone()))
        }
    }

    /// One caption line every 5 seconds for ten minutes.
    fn transcript() -> Vec<TranscriptSegment> {
        (0..120)
            .map(|i| {
                let start = i as f64 * 5.0;
                TranscriptSegment::new(start, start + 5.0, format!("sentence number {} of the talk goes here.", i))
            })
            .collect()
    }

    fn pipeline(reply: serde_json::Value, segments: &SegmentConfig) -> Pipeline {
        let controller = Arc::new(BackoffController::new("llm", BackoffConfig::unthrottled()));
        let mut config = Config::default();
        config.segments = segments.clone();
        let discovery = DiscoveryEngine::new(Arc::new(Fixed(reply)), controller, DiscoverySettings::from_config(&config));
        Pipeline::new(None, discovery, segments, 12_000)
    }

    fn request() -> HighlightRequest {
        HighlightRequest {
            label: "talk".into(),
            source: TranscriptSource::Segments {
                segments: transcript(),
                duration_hint: None,
            },
            language_hint: None,
        }
    }

    fn noop(_: PipelineState) {}

    #[tokio::test]
    async fn produces_verbatim_window_bounded_segments() {
        let reply = json!({"segments": [
            {"title": "First", "startTime": "01:00", "endTime": "02:10"},
            {"title": "Overlapping", "startTime": "01:20", "endTime": "02:30"},
            {"title": "Second", "startTime": "05:00", "endTime": "06:15"}
        ]});
        let outcome = pipeline(reply, &SegmentConfig::default())
            .run(&request(), &CancellationToken::new(), &noop)
            .await
            .unwrap();

        let titles: Vec<&str> = outcome.segments.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
        let first = &outcome.segments[0];
        assert_eq!(first.start_time, Timecode::from_seconds(60));
        assert_eq!(first.duration_seconds, 70.0);
        assert!(first.transcript_excerpt.starts_with("sentence number 12 of"));
        assert!(first.transcript_excerpt.ends_with("sentence number 25 of the talk goes here."));
        assert_eq!(outcome.diagnostics.dropped.len(), 1);
        assert_eq!(outcome.diagnostics.dropped[0].stage, "dedup");
    }

    #[tokio::test]
    async fn empty_proposals_are_no_suitable_segments() {
        let err = pipeline(json!({"segments": []}), &SegmentConfig::default())
            .run(&request(), &CancellationToken::new(), &noop)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoSuitableSegments { .. }));
        assert_eq!(err.diagnostics().unwrap().chunks.len(), 1);
    }

    #[tokio::test]
    async fn short_excerpts_fail_validation() {
        let segments = SegmentConfig {
            min_excerpt_chars: 10_000,
            ..SegmentConfig::default()
        };
        let reply = json!({"segments": [{"title": "x", "startTime": "01:00", "endTime": "02:10"}]});
        let err = pipeline(reply, &segments)
            .run(&request(), &CancellationToken::new(), &noop)
            .await
            .unwrap_err();
        let diagnostics = err.diagnostics().unwrap();
        assert_eq!(diagnostics.dropped[0].stage, "validate");
    }

    #[tokio::test]
    async fn floor_policy_extends_short_proposals() {
        let segments = SegmentConfig {
            policy: DurationPolicy::Floor { min_seconds: 30 },
            ..SegmentConfig::default()
        };
        let reply = json!({"segments": [{"title": "quick", "startTime": "03:00", "endTime": "03:10"}]});
        let outcome = pipeline(reply, &segments)
            .run(&request(), &CancellationToken::new(), &noop)
            .await
            .unwrap();
        assert_eq!(outcome.segments[0].duration_seconds, 30.0);
        assert_eq!(outcome.segments[0].start_time, Timecode::from_seconds(170));
    }

    #[tokio::test]
    async fn plain_text_needs_a_duration() {
        let request = HighlightRequest {
            label: "txt".into(),
            source: TranscriptSource::Text {
                text: "hello".into(),
                duration_hint: None,
            },
            language_hint: None,
        };
        let err = pipeline(json!([]), &SegmentConfig::default())
            .run(&request, &CancellationToken::new(), &noop)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline(json!([]), &SegmentConfig::default())
            .run(&request(), &cancel, &noop)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn states_are_reported_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_state = move |s: PipelineState| sink.lock().unwrap().push(s);
        let reply = json!({"segments": [{"title": "First", "startTime": "01:00", "endTime": "02:10"}]});
        pipeline(reply, &SegmentConfig::default())
            .run(&request(), &CancellationToken::new(), &on_state)
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PipelineState::AcquireTranscript,
                PipelineState::PlanChunks,
                PipelineState::Discover,
                PipelineState::Deduplicate,
                PipelineState::Extract,
                PipelineState::Validate,
                PipelineState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn report_lists_highlights_and_drops() {
        let reply = json!({"segments": [
            {"title": "First", "startTime": "01:00", "endTime": "02:10"},
            {"title": "Too short", "startTime": "04:00", "endTime": "04:20"}
        ]});
        let result = pipeline(reply, &SegmentConfig::default())
            .run(&request(), &CancellationToken::new(), &noop)
            .await;
        let report = render_report("talk", &result);
        assert!(report.contains("Status: OK (1 highlights)"));
        assert!(report.contains("#1 01:00 - 02:10 (70s) \"First\""));
        assert!(report.contains("\"Too short\" 04:00-04:20"));
    }

    #[tokio::test]
    async fn job_registry_tracks_a_run() {
        let reply = json!({"segments": [{"title": "First", "startTime": "01:00", "endTime": "02:10"}]});
        let job_id = start_job(Arc::new(pipeline(reply, &SegmentConfig::default())), request());
        assert!(get_progress(&job_id).is_some());

        let result = loop {
            if let Some(result) = get_result(&job_id) {
                break result;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert!(matches!(result, JobResult::Completed { .. }));
        assert!(!cancel_job("missing"));
    }

    #[tokio::test]
    async fn collected_jobs_leave_the_registry() {
        let reply = json!({"segments": []});
        let job_id = start_job(Arc::new(pipeline(reply, &SegmentConfig::default())), request());

        let result = loop {
            if let Some(result) = get_result(&job_id) {
                break result;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert!(matches!(result, JobResult::Failed { .. }));
        assert!(get_result(&job_id).is_none());
        assert!(get_progress(&job_id).is_none());
        assert!(!cancel_job(&job_id));
        assert!(!jobs().contains_key(&job_id));
    }

    #[test]
    fn stale_finished_jobs_are_pruned() {
        let now = std::time::Instant::now();
        let job = |finished_at: Option<std::time::Instant>| Job {
            progress: Progress {
                stage: "done".into(),
                progress: 1.0,
            },
            result: finished_at.map(|_| JobResult::Failed {
                kind: "Cancelled".into(),
                message: "cancelled".into(),
                diagnostics: None,
            }),
            finished_at,
            cancel: CancellationToken::new(),
        };
        let mut registry = HashMap::new();
        registry.insert("running".to_string(), job(None));
        registry.insert("finished".to_string(), job(Some(now)));

        prune_finished(&mut registry, now + FINISHED_JOB_TTL / 2);
        assert_eq!(registry.len(), 2);

        prune_finished(&mut registry, now + FINISHED_JOB_TTL);
        let left: Vec<&str> = registry.keys().map(String::as_str).collect();
        assert_eq!(left, vec!["running"]);
    }
}
