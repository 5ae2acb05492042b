use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AttemptFailure, ErrorClass, Strategy, StrategyResult};
use crate::backoff::{BackoffController, FailureKind, Slot};
use crate::error::AcquisitionError;
use crate::transcription::{is_time_ordered, total_text_chars, TranscriptSegment};

/// A transcript that passed validation, with the trail that led to it.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub segments: Vec<TranscriptSegment>,
    pub strategy: String,
    pub trail: Vec<StrategyResult>,
}

/// Ordered fallback over acquisition strategies. The first validated
/// transcript wins; a no-content answer stops the chain.
pub struct StrategyChain {
    strategies: Vec<Box<dyn Strategy>>,
    controller: Arc<BackoffController>,
    min_transcript_chars: usize,
    max_wait: Duration,
}

impl StrategyChain {
    pub fn new(
        strategies: Vec<Box<dyn Strategy>>,
        controller: Arc<BackoffController>,
        min_transcript_chars: usize,
        max_wait: Duration,
    ) -> Self {
        Self {
            strategies,
            controller,
            min_transcript_chars,
            max_wait,
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn acquire(&self, video_id: &str, cancel: &CancellationToken) -> Result<Acquisition, AcquisitionError> {
        let mut trail: Vec<StrategyResult> = Vec::new();

        for strategy in &self.strategies {
            let name = strategy.name();
            if cancel.is_cancelled() {
                return Err(AcquisitionError::Cancelled { trail });
            }

            if !strategy.is_available() {
                tracing::debug!(strategy = name, "Strategy not available, skipping");
                trail.push(StrategyResult::failed(
                    name,
                    AttemptFailure::new(ErrorClass::Skipped, "not configured"),
                    0,
                ));
                continue;
            }

            match self.controller.acquire_slot(video_id, self.max_wait, cancel).await {
                Slot::Granted => {}
                Slot::Cancelled => return Err(AcquisitionError::Cancelled { trail }),
                Slot::Denied(decision) => {
                    let reason = decision
                        .reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "denied".to_string());
                    tracing::warn!(
                        strategy = name,
                        video_id,
                        wait_ms = decision.wait.as_millis() as u64,
                        %reason,
                        "Rate limited, moving to next strategy"
                    );
                    trail.push(StrategyResult::failed(
                        name,
                        AttemptFailure::new(
                            ErrorClass::RateLimited,
                            format!("{} (wait {}s)", reason, decision.wait.as_secs()),
                        ),
                        0,
                    ));
                    continue;
                }
            }

            tracing::info!(strategy = name, video_id, "Trying acquisition strategy");
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AcquisitionError::Cancelled { trail });
                }
                outcome = strategy.attempt(video_id) => outcome,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let failure = match outcome {
                Ok(segments) => match self.check_transcript(&segments) {
                    Ok(()) => {
                        self.controller.record_success(video_id);
                        tracing::info!(
                            strategy = name,
                            segments = segments.len(),
                            elapsed_ms,
                            "Transcript acquired"
                        );
                        trail.push(StrategyResult::succeeded(name, segments.clone(), elapsed_ms));
                        return Ok(Acquisition {
                            segments,
                            strategy: name.to_string(),
                            trail,
                        });
                    }
                    Err(failure) => failure,
                },
                Err(failure) => failure,
            };

            if failure.class.is_terminal() {
                tracing::warn!(strategy = name, message = %failure.message, "Source has no transcript");
                let message = failure.message.clone();
                trail.push(StrategyResult::failed(name, failure, elapsed_ms));
                return Err(AcquisitionError::NoContent { message, trail });
            }

            let mut failure = failure;
            if self.controller.record_failure(video_id, &failure.message) == FailureKind::Hostile {
                failure.class = ErrorClass::Hostile;
            }
            tracing::warn!(
                strategy = name,
                class = ?failure.class,
                message = %failure.message,
                elapsed_ms,
                "Acquisition strategy failed"
            );
            trail.push(StrategyResult::failed(name, failure, elapsed_ms));
        }

        Err(AcquisitionError::Exhausted { trail })
    }

    fn check_transcript(&self, segments: &[TranscriptSegment]) -> Result<(), AttemptFailure> {
        if segments.is_empty() {
            return Err(AttemptFailure::new(ErrorClass::Malformed, "empty transcript"));
        }
        if !is_time_ordered(segments) {
            return Err(AttemptFailure::new(
                ErrorClass::Malformed,
                "segments out of order or with non-positive duration",
            ));
        }
        let chars = total_text_chars(segments);
        if chars < self.min_transcript_chars {
            return Err(AttemptFailure::new(
                ErrorClass::Malformed,
                format!(
                    "transcript too short ({} chars, need {})",
                    chars, self.min_transcript_chars
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        result: Result<Vec<TranscriptSegment>, AttemptFailure>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Strategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt(&self, _video_id: &str) -> Result<Vec<TranscriptSegment>, AttemptFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn good() -> Vec<TranscriptSegment> {
        vec![
            TranscriptSegment::new(0.0, 5.0, "a reasonably long opening line"),
            TranscriptSegment::new(5.0, 9.0, "followed by another one"),
        ]
    }

    fn scripted(
        name: &'static str,
        result: Result<Vec<TranscriptSegment>, AttemptFailure>,
    ) -> (Box<dyn Strategy>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                name,
                result,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn chain(strategies: Vec<Box<dyn Strategy>>) -> StrategyChain {
        let controller = Arc::new(BackoffController::new("test", BackoffConfig::unthrottled()));
        StrategyChain::new(strategies, controller, 10, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn falls_through_to_first_valid_transcript() {
        let (a, _) = scripted("a", Err(AttemptFailure::new(ErrorClass::Transient, "boom")));
        let (b, _) = scripted("b", Ok(vec![TranscriptSegment::new(3.0, 1.0, "backwards in time")]));
        let (c, _) = scripted("c", Ok(good()));
        let (d, d_calls) = scripted("d", Ok(good()));

        let result = chain(vec![a, b, c, d])
            .acquire("vid", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.strategy, "c");
        assert_eq!(result.trail.len(), 3);
        assert_eq!(result.trail[1].error_class, Some(ErrorClass::Malformed));
        assert!(result.trail[2].success);
        assert_eq!(d_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_content_stops_the_chain() {
        let (a, _) = scripted(
            "a",
            Err(AttemptFailure::new(ErrorClass::NoContent, "Subtitles are disabled")),
        );
        let (b, b_calls) = scripted("b", Ok(good()));

        let err = chain(vec![a, b])
            .acquire("vid", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::NoContent { .. }));
        assert_eq!(err.trail().len(), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hostile_text_upgrades_the_failure_class() {
        let (a, _) = scripted(
            "a",
            Err(AttemptFailure::new(ErrorClass::Transient, "HTTP Error 429: Too Many Requests")),
        );
        let err = chain(vec![a])
            .acquire("vid", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Exhausted { .. }));
        assert_eq!(err.trail()[0].error_class, Some(ErrorClass::Hostile));
    }

    #[tokio::test]
    async fn too_short_transcript_is_rejected() {
        let (a, _) = scripted("a", Ok(vec![TranscriptSegment::new(0.0, 1.0, "hi")]));
        let err = chain(vec![a])
            .acquire("vid", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.trail()[0].message.as_deref().unwrap().contains("too short"));
    }

    #[tokio::test]
    async fn blocked_resource_is_recorded_as_rate_limited() {
        let config = BackoffConfig {
            min_interval_ms: 60_000,
            ..BackoffConfig::unthrottled()
        };
        let controller = Arc::new(BackoffController::new("test", config));
        let (a, _) = scripted("a", Err(AttemptFailure::new(ErrorClass::Transient, "boom")));
        let (b, b_calls) = scripted("b", Ok(good()));
        let chain = StrategyChain::new(vec![a, b], controller, 10, Duration::from_secs(1));

        let err = chain.acquire("vid", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.trail()[1].error_class, Some(ErrorClass::RateLimited));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (a, a_calls) = scripted("a", Ok(good()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = chain(vec![a]).acquire("vid", &cancel).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Cancelled { .. }));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }
}
