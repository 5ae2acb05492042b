//! Rate-limit and backoff bookkeeping for calls to unreliable services.
//!
//! One [`BackoffController`] guards one external service (the video platform,
//! the text-generation API). It keeps a global scope for the whole service and
//! a per-resource record for each key (a video id, a chunk). Every read and
//! update goes through a single mutex, so concurrent workers calling
//! [`BackoffController::try_acquire`] can never both take the same free slot.
//!
//! Rules are evaluated in this order:
//! 1. global minimum interval between any two actions (widened after hostile failures)
//! 2. burst cap over a rolling window
//! 3. per-resource exponential backoff, with a hard block after `max_attempts`
//! 4. adaptive global delay when the recent success rate is poor

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on how far hostile failures can stretch the global interval.
const MAX_HOSTILE_FACTOR: u32 = 8;

/// Error text fragments that mean the service is pushing back on us on
/// purpose, as opposed to an ordinary fault.
const HOSTILE_SIGNATURES: &[&str] = &[
    "not a bot",
    "sign in to confirm",
    "http error 429",
    "429",
    "too many requests",
    "rate limit",
    "rate_limit",
    "throttl",
    "captcha",
    "http error 403",
    "forbidden",
    "unusual traffic",
];

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, so paused-time tests advance it by sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Minimum gap between any two actions across all resources.
    pub min_interval_ms: u64,
    /// At most this many actions per `burst_window_ms`. Zero disables the cap.
    pub burst_max: usize,
    pub burst_window_ms: u64,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Failures before a resource is blocked for the whole decay window.
    pub max_attempts: u32,
    pub decay_window_ms: u64,
    /// Outcomes older than this do not count towards the success rate.
    pub success_window_ms: u64,
    /// Fewer outcomes than this and the success rate is not trusted yet.
    pub min_samples: usize,
    pub success_threshold: f64,
    pub adaptive_max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2_000,
            burst_max: 5,
            burst_window_ms: 60_000,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            max_attempts: 5,
            decay_window_ms: 15 * 60_000,
            success_window_ms: 10 * 60_000,
            min_samples: 4,
            success_threshold: 0.5,
            adaptive_max_delay_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Tuned for the text-generation API: the global interval doubles as the
    /// steady-state delay between chunk requests.
    pub fn for_discovery() -> Self {
        Self {
            min_interval_ms: 1_500,
            burst_max: 20,
            burst_window_ms: 60_000,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 4,
            decay_window_ms: 5 * 60_000,
            success_window_ms: 5 * 60_000,
            min_samples: 4,
            success_threshold: 0.5,
            adaptive_max_delay_ms: 15_000,
        }
    }

    /// No waiting at all. Handy for tests and for trusted local services.
    pub fn unthrottled() -> Self {
        Self {
            min_interval_ms: 0,
            burst_max: 0,
            burst_window_ms: 0,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            max_attempts: u32::MAX,
            decay_window_ms: 60_000,
            success_window_ms: 60_000,
            min_samples: usize::MAX,
            success_threshold: 0.0,
            adaptive_max_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    GlobalInterval,
    BurstCap,
    ResourceBlocked,
    ResourceCooldown,
    AdaptiveDelay,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::GlobalInterval => "global minimum interval",
            DenyReason::BurstCap => "burst cap reached",
            DenyReason::ResourceBlocked => "resource blocked after too many failures",
            DenyReason::ResourceCooldown => "resource cooling down",
            DenyReason::AdaptiveDelay => "adaptive delay (low success rate)",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub wait: Duration,
    pub reason: Option<DenyReason>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
            reason: None,
        }
    }

    fn deny(reason: DenyReason, wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Ordinary,
    Hostile,
}

/// Hostile if the error text carries a blocking/throttling signature.
pub fn classify_failure(error: &str) -> FailureKind {
    let lower = error.to_lowercase();
    if HOSTILE_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        FailureKind::Hostile
    } else {
        FailureKind::Ordinary
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub resource_key: String,
    pub attempts: u32,
    pub last_attempt_at: Instant,
    pub cooldown_until: Option<Instant>,
}

/// Outcome of waiting for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Granted,
    /// The controller asked for a longer wait than the caller accepts.
    Denied(Decision),
    Cancelled,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, AttemptRecord>,
    last_action: Option<Instant>,
    recent_actions: VecDeque<Instant>,
    outcomes: VecDeque<(Instant, bool)>,
    hostile_factor: u32,
    last_hostile_at: Option<Instant>,
}

pub struct BackoffController {
    scope: String,
    config: BackoffConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl fmt::Debug for BackoffController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffController")
            .field("scope", &self.scope)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackoffController {
    pub fn new(scope: impl Into<String>, config: BackoffConfig) -> Self {
        Self::with_clock(scope, config, Arc::new(TokioClock))
    }

    pub fn with_clock(scope: impl Into<String>, config: BackoffConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            scope: scope.into(),
            config,
            clock,
            state: Mutex::new(State {
                hostile_factor: 1,
                ..State::default()
            }),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check_allowed(&self, resource_key: &str) -> Decision {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        self.evaluate(&state, resource_key, now)
    }

    /// Check and, when allowed, record the attempt under the same lock.
    pub fn try_acquire(&self, resource_key: &str) -> Decision {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        let decision = self.evaluate(&state, resource_key, now);
        if decision.allowed {
            Self::note_attempt(&mut state, resource_key, now);
        }
        decision
    }

    pub fn record_attempt(&self, resource_key: &str) {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        Self::note_attempt(&mut state, resource_key, now);
    }

    pub fn record_success(&self, resource_key: &str) {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        state.records.remove(resource_key);
        state.outcomes.push_back((now, true));
        state.hostile_factor = 1;
        state.last_hostile_at = None;
    }

    /// Count a failure against `resource_key` and return how it was classified.
    pub fn record_failure(&self, resource_key: &str, error: &str) -> FailureKind {
        let kind = classify_failure(error);
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);

        let record = state
            .records
            .entry(resource_key.to_string())
            .or_insert_with(|| AttemptRecord {
                resource_key: resource_key.to_string(),
                attempts: 0,
                last_attempt_at: now,
                cooldown_until: None,
            });
        record.attempts = record.attempts.saturating_add(1);
        record.last_attempt_at = now;

        let mut cooldown = self.cooldown_for(record.attempts);
        if kind == FailureKind::Hostile {
            cooldown = (cooldown * 2).min(Duration::from_millis(self.config.max_delay_ms));
        }
        record.cooldown_until = Some(now + cooldown);
        let attempts = record.attempts;

        state.outcomes.push_back((now, false));
        if kind == FailureKind::Hostile {
            state.hostile_factor = (state.hostile_factor * 2).min(MAX_HOSTILE_FACTOR);
            state.last_hostile_at = Some(now);
        }

        tracing::debug!(
            scope = %self.scope,
            resource = resource_key,
            attempts,
            cooldown_ms = cooldown.as_millis() as u64,
            hostile = kind == FailureKind::Hostile,
            "Recorded failure"
        );
        kind
    }

    /// Failures currently counted against `resource_key` (zero once decayed).
    pub fn attempts(&self, resource_key: &str) -> u32 {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        state.records.get(resource_key).map_or(0, |r| r.attempts)
    }

    pub fn attempt_record(&self, resource_key: &str) -> Option<AttemptRecord> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        state.records.get(resource_key).cloned()
    }

    pub fn hostile_factor(&self) -> u32 {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        state.hostile_factor
    }

    /// Extra global delay currently injected because of a poor success rate.
    pub fn adaptive_delay(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        self.adaptive_delay_locked(&state)
    }

    /// Wait for a slot on `resource_key`, sleeping whenever the controller asks
    /// for no more than `max_wait`. Longer waits are handed back to the caller.
    pub async fn acquire_slot(
        &self,
        resource_key: &str,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Slot {
        loop {
            if cancel.is_cancelled() {
                return Slot::Cancelled;
            }
            let decision = self.try_acquire(resource_key);
            if decision.allowed {
                return Slot::Granted;
            }
            if decision.wait > max_wait {
                return Slot::Denied(decision);
            }
            tracing::debug!(
                scope = %self.scope,
                resource = resource_key,
                wait_ms = decision.wait.as_millis() as u64,
                reason = ?decision.reason,
                "Waiting for rate-limit slot"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Slot::Cancelled,
                _ = tokio::time::sleep(decision.wait) => {}
            }
        }
    }

    fn note_attempt(state: &mut State, resource_key: &str, now: Instant) {
        state.last_action = Some(now);
        state.recent_actions.push_back(now);
        state
            .records
            .entry(resource_key.to_string())
            .and_modify(|r| r.last_attempt_at = now)
            .or_insert_with(|| AttemptRecord {
                resource_key: resource_key.to_string(),
                attempts: 0,
                last_attempt_at: now,
                cooldown_until: None,
            });
    }

    fn cooldown_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn effective_interval(&self, state: &State) -> Duration {
        Duration::from_millis(self.config.min_interval_ms) * state.hostile_factor.max(1)
    }

    fn adaptive_delay_locked(&self, state: &State) -> Duration {
        let samples = state.outcomes.len();
        if samples == 0 || samples < self.config.min_samples || self.config.success_threshold <= 0.0 {
            return Duration::ZERO;
        }
        let successes = state.outcomes.iter().filter(|(_, ok)| *ok).count();
        let rate = successes as f64 / samples as f64;
        if rate >= self.config.success_threshold {
            return Duration::ZERO;
        }
        let shortfall = (self.config.success_threshold - rate) / self.config.success_threshold;
        let delay_ms = (shortfall * self.config.adaptive_max_delay_ms as f64)
            .min(self.config.adaptive_max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    fn prune(&self, state: &mut State, now: Instant) {
        let decay = Duration::from_millis(self.config.decay_window_ms);
        state
            .records
            .retain(|_, r| now.saturating_duration_since(r.last_attempt_at) < decay);

        let burst_window = Duration::from_millis(self.config.burst_window_ms);
        while let Some(&front) = state.recent_actions.front() {
            if now.saturating_duration_since(front) >= burst_window {
                state.recent_actions.pop_front();
            } else {
                break;
            }
        }

        let success_window = Duration::from_millis(self.config.success_window_ms);
        while let Some(&(at, _)) = state.outcomes.front() {
            if now.saturating_duration_since(at) >= success_window {
                state.outcomes.pop_front();
            } else {
                break;
            }
        }

        if let Some(at) = state.last_hostile_at {
            if now.saturating_duration_since(at) >= decay {
                state.hostile_factor = 1;
                state.last_hostile_at = None;
            }
        }
    }

    fn evaluate(&self, state: &State, resource_key: &str, now: Instant) -> Decision {
        let interval = self.effective_interval(state);
        let since_last = state.last_action.map(|at| now.saturating_duration_since(at));

        if let Some(elapsed) = since_last {
            if elapsed < interval {
                return Decision::deny(DenyReason::GlobalInterval, interval - elapsed);
            }
        }

        if self.config.burst_max > 0 && state.recent_actions.len() >= self.config.burst_max {
            if let Some(&oldest) = state.recent_actions.front() {
                let free_at = oldest + Duration::from_millis(self.config.burst_window_ms);
                return Decision::deny(DenyReason::BurstCap, free_at.saturating_duration_since(now));
            }
        }

        if let Some(record) = state.records.get(resource_key) {
            if record.attempts >= self.config.max_attempts {
                let free_at = record.last_attempt_at + Duration::from_millis(self.config.decay_window_ms);
                return Decision::deny(DenyReason::ResourceBlocked, free_at.saturating_duration_since(now));
            }
            if let Some(until) = record.cooldown_until {
                if until > now {
                    return Decision::deny(DenyReason::ResourceCooldown, until - now);
                }
            }
        }

        let adaptive = self.adaptive_delay_locked(state);
        if let (Some(elapsed), false) = (since_last, adaptive.is_zero()) {
            let required = interval + adaptive;
            if elapsed < required {
                return Decision::deny(DenyReason::AdaptiveDelay, required - elapsed);
            }
        }

        Decision::allow()
    }
}
