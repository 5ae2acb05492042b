//! Integration tests for transcript acquisition: the strategy chain, the
//! shared backoff controller, and how acquisition failures surface from the
//! pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use autoclip_lib::acquisition::{AttemptFailure, ErrorClass, Strategy, StrategyChain};
use autoclip_lib::analysis::{DiscoveryEngine, DiscoverySettings, Generated, TextGenerator, ToolRequest};
use autoclip_lib::backoff::{BackoffConfig, BackoffController};
use autoclip_lib::config::SegmentConfig;
use autoclip_lib::transcription::TranscriptSegment;
use autoclip_lib::{Config, HighlightRequest, LlmError, Pipeline, PipelineError, PipelineState, TranscriptSource};

/// Test helper: a strategy that always answers the same way and counts calls.
struct FixedStrategy {
    name: &'static str,
    result: Result<Vec<TranscriptSegment>, AttemptFailure>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Strategy for FixedStrategy {
    fn name(&self) -> &str {
        self.name
    }

    async fn attempt(&self, _video_id: &str) -> Result<Vec<TranscriptSegment>, AttemptFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

fn strategy(
    name: &'static str,
    result: Result<Vec<TranscriptSegment>, AttemptFailure>,
) -> (Box<dyn Strategy>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Box::new(FixedStrategy {
            name,
            result,
            calls: Arc::clone(&calls),
        }),
        calls,
    )
}

struct NoHighlights;

#[async_trait]
impl TextGenerator for NoHighlights {
    async fn generate(&self, _request: &ToolRequest) -> Result<Generated, LlmError> {
        Ok(Generated::Structured(serde_json::json!({"segments": []})))
    }
}

fn transcript() -> Vec<TranscriptSegment> {
    (0..60)
        .map(|i| {
            let start = i as f64 * 4.0;
            TranscriptSegment::new(start, start + 4.0, format!("caption line {} with a few words", i))
        })
        .collect()
}

fn pipeline_with(strategies: Vec<Box<dyn Strategy>>) -> Pipeline {
    let source = Arc::new(BackoffController::new("source", BackoffConfig::unthrottled()));
    let chain = StrategyChain::new(strategies, source, 50, Duration::from_secs(5));
    let llm = Arc::new(BackoffController::new("llm", BackoffConfig::unthrottled()));
    let discovery = DiscoveryEngine::new(
        Arc::new(NoHighlights),
        llm,
        DiscoverySettings::from_config(&Config::default()),
    );
    Pipeline::new(Some(chain), discovery, &SegmentConfig::default(), 12_000)
}

fn video(id: &str) -> HighlightRequest {
    HighlightRequest {
        label: id.to_string(),
        source: TranscriptSource::Video {
            video_id: id.to_string(),
        },
        language_hint: None,
    }
}

fn ignore(_: PipelineState) {}

// Captions disabled on the very first strategy ends the run without trying the rest
#[tokio::test]
async fn captions_disabled_is_no_content_available() {
    let (first, _) = strategy(
        "alternate_client",
        Err(AttemptFailure::from_output("ERROR: [youtube] abc: Subtitles are disabled for this video")),
    );
    let (second, second_calls) = strategy("legacy", Ok(transcript()));

    let err = pipeline_with(vec![first, second])
        .run(&video("abc"), &CancellationToken::new(), &ignore)
        .await
        .unwrap_err();

    match &err {
        PipelineError::NoContentAvailable { diagnostics, .. } => {
            assert_eq!(diagnostics.strategies.len(), 1);
            assert_eq!(diagnostics.strategies[0].error_class, Some(ErrorClass::NoContent));
        }
        other => panic!("expected NoContentAvailable, got {other:?}"),
    }
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

// Every strategy failing transiently surfaces as exhaustion with the full trail
#[tokio::test]
async fn all_strategies_failing_is_exhausted() {
    let (a, _) = strategy("a", Err(AttemptFailure::new(ErrorClass::Timeout, "timed out")));
    let (b, _) = strategy("b", Err(AttemptFailure::from_output("HTTP Error 429: Too Many Requests")));
    let (c, _) = strategy("c", Ok(Vec::new()));

    let err = pipeline_with(vec![a, b, c])
        .run(&video("abc"), &CancellationToken::new(), &ignore)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "AcquisitionExhausted");
    let trail = &err.diagnostics().unwrap().strategies;
    let classes: Vec<_> = trail.iter().map(|r| r.error_class).collect();
    assert_eq!(
        classes,
        vec![
            Some(ErrorClass::Timeout),
            Some(ErrorClass::Hostile),
            Some(ErrorClass::Malformed)
        ]
    );
}

// An acquired transcript flows into discovery; nothing proposed means no segments
#[tokio::test]
async fn acquired_transcript_without_highlights() {
    let (a, _) = strategy("a", Err(AttemptFailure::new(ErrorClass::Transient, "boom")));
    let (b, _) = strategy("b", Ok(transcript()));

    let err = pipeline_with(vec![a, b])
        .run(&video("abc"), &CancellationToken::new(), &ignore)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NoSuitableSegments { .. }));
    let diagnostics = err.diagnostics().unwrap();
    assert_eq!(diagnostics.strategies.len(), 2);
    assert!(diagnostics.strategies[1].success);
    assert_eq!(diagnostics.chunks.len(), 1);
}

// A resource blocked by earlier failures is rate limited for every strategy
// without any of them running
#[tokio::test]
async fn blocked_resource_skips_every_attempt() {
    let config = BackoffConfig {
        max_attempts: 1,
        decay_window_ms: 60_000,
        ..BackoffConfig::unthrottled()
    };
    let controller = Arc::new(BackoffController::new("source", config));
    controller.record_failure("abc", "connection reset by peer");

    let (a, a_calls) = strategy("a", Ok(transcript()));
    let (b, b_calls) = strategy("b", Ok(transcript()));
    let chain = StrategyChain::new(vec![a, b], controller, 50, Duration::from_secs(5));

    let err = chain.acquire("abc", &CancellationToken::new()).await.unwrap_err();
    let trail = err.trail();
    assert_eq!(trail.len(), 2);
    assert!(trail.iter().all(|r| r.error_class == Some(ErrorClass::RateLimited)));
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
}

// Two workers sharing one controller never get the same free slot
#[tokio::test]
async fn shared_controller_grants_one_slot_at_a_time() {
    let config = BackoffConfig {
        min_interval_ms: 60_000,
        ..BackoffConfig::unthrottled()
    };
    let controller = Arc::new(BackoffController::new("source", config));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.try_acquire(&format!("vid-{i}")).allowed })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}
