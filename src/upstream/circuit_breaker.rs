use crate::config::CircuitBreakerConfig;
use crate::error::GatewayError;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Circuit breaker state.
///
/// `ForcedOpen` and `Disabled` are administrative overrides: while one is
/// set, no automatic transition happens until [`CircuitBreaker::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    ForcedOpen,
    Disabled,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::ForcedOpen => "forced_open",
            CircuitState::Disabled => "disabled",
        }
    }

    /// Numeric encoding for the state gauge.
    pub fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
            CircuitState::ForcedOpen => 3.0,
            CircuitState::Disabled => 4.0,
        }
    }

    fn is_forced(self) -> bool {
        matches!(self, CircuitState::ForcedOpen | CircuitState::Disabled)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finished call as seen by the window.
#[derive(Debug, Clone, Copy)]
pub struct CallOutcome {
    pub success: bool,
    pub recorded_at: Instant,
    pub duration: Duration,
}

/// Point-in-time view of the window counters.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerMetrics {
    pub buffered_calls: u32,
    pub failed_calls: u32,
    /// Percent of failed calls in the window; `0.0` when the window is empty.
    pub failure_rate: f64,
    /// Calls rejected without reaching the backend since the breaker was created.
    pub not_permitted_calls: u64,
    pub mean_call_duration: Duration,
    /// Time since the newest outcome in the window was recorded.
    pub last_call_age: Option<Duration>,
}

/// Count-based window over the last `capacity` outcomes.
struct SlidingWindow {
    capacity: usize,
    outcomes: VecDeque<CallOutcome>,
    failed: u32,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity),
            failed: 0,
        }
    }

    fn record(&mut self, outcome: CallOutcome) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if !evicted.success {
                    self.failed -= 1;
                }
            }
        }
        if !outcome.success {
            self.failed += 1;
        }
        self.outcomes.push_back(outcome);
    }

    fn len(&self) -> u32 {
        self.outcomes.len() as u32
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        f64::from(self.failed) * 100.0 / self.outcomes.len() as f64
    }

    fn mean_duration(&self) -> Duration {
        if self.outcomes.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.outcomes.iter().map(|o| o.duration).sum();
        total / self.outcomes.len() as u32
    }

    fn last_recorded_at(&self) -> Option<Instant> {
        self.outcomes.back().map(|o| o.recorded_at)
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failed = 0;
    }
}

struct Inner {
    state: CircuitState,
    /// Bumped on every transition; permits from an older epoch record nothing.
    epoch: u64,
    window: SlidingWindow,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Per-service circuit breaker.
///
/// All counters and the state live behind one mutex that is only held for
/// the bookkeeping itself, never across a backend call. The OPEN → HALF_OPEN
/// transition is resolved lazily whenever the state is read.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    not_permitted: AtomicU64,
}

/// Answer to "may this call go to the backend?".
pub enum CallPermission<'a> {
    Granted(CallPermit<'a>),
    Rejected(CircuitState),
}

/// Permission to make one backend call.
///
/// Consumed by [`CallPermit::record_success`] or [`CallPermit::record_failure`].
/// Dropping it unrecorded gives a HALF_OPEN trial slot back.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    state: CircuitState,
    epoch: u64,
    trial: bool,
    recorded: bool,
}

impl<'a> CallPermit<'a> {
    /// State the breaker was in when the permit was granted.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self, duration: Duration) {
        self.recorded = true;
        self.breaker
            .record_at(true, duration, Some(self.epoch), Instant::now());
    }

    pub fn record_failure(mut self, duration: Duration, cause: &GatewayError) {
        debug_assert!(cause.is_backend_failure());
        self.recorded = true;
        tracing::debug!(
            "circuit_breaker: {}: failure recorded, cause={}",
            self.breaker.name,
            cause
        );
        self.breaker
            .record_at(false, duration, Some(self.epoch), Instant::now());
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.recorded || !self.trial {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.epoch == self.epoch && inner.state == CircuitState::HalfOpen {
            inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, mut config: CircuitBreakerConfig) -> Self {
        config.sliding_window_size = config.sliding_window_size.max(1);
        config.minimum_calls = config.minimum_calls.clamp(1, config.sliding_window_size);
        config.permitted_calls_in_half_open = config.permitted_calls_in_half_open.max(1);

        let name = name.into();
        metrics::gauge!("gateway_circuit_breaker_state", "service" => name.clone())
            .set(CircuitState::Closed.gauge_value());

        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                epoch: 0,
                window: SlidingWindow::new(config.sliding_window_size as usize),
                opened_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
            name,
            config,
            not_permitted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective configuration (after clamping).
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after resolving a due OPEN → HALF_OPEN transition.
    pub fn current_state(&self) -> CircuitState {
        self.current_state_at(Instant::now())
    }

    pub(crate) fn current_state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.lock();
        self.resolve_wait(&mut inner, now);
        inner.state
    }

    /// Ask for permission to call the backend.
    pub fn try_acquire(&self) -> CallPermission<'_> {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> CallPermission<'_> {
        let mut inner = self.lock();
        self.resolve_wait(&mut inner, now);

        let state = inner.state;
        let trial = match state {
            CircuitState::Closed | CircuitState::Disabled => false,
            CircuitState::HalfOpen
                if inner.half_open_admitted < self.config.permitted_calls_in_half_open =>
            {
                inner.half_open_admitted += 1;
                true
            }
            _ => {
                drop(inner);
                self.not_permitted.fetch_add(1, Ordering::Relaxed);
                return CallPermission::Rejected(state);
            }
        };

        CallPermission::Granted(CallPermit {
            breaker: self,
            state,
            epoch: inner.epoch,
            trial,
            recorded: false,
        })
    }

    /// Record a successful call against whatever state the breaker is in now.
    pub fn record_success(&self, duration: Duration) {
        self.record_at(true, duration, None, Instant::now());
    }

    /// Record a failed call against whatever state the breaker is in now.
    pub fn record_failure(&self, duration: Duration, cause: &GatewayError) {
        tracing::debug!(
            "circuit_breaker: {}: failure recorded, cause={}",
            self.name,
            cause
        );
        self.record_at(false, duration, None, Instant::now());
    }

    pub(crate) fn record_at(
        &self,
        success: bool,
        duration: Duration,
        epoch: Option<u64>,
        now: Instant,
    ) {
        let mut inner = self.lock();
        if epoch.is_some_and(|e| e != inner.epoch) {
            return;
        }
        self.resolve_wait(&mut inner, now);

        let outcome = CallOutcome {
            success,
            recorded_at: now,
            duration,
        };

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.window.record(outcome);
                let buffered = inner.window.len();
                let rate = inner.window.failure_rate();
                if buffered >= self.config.minimum_calls
                    && rate >= self.config.failure_rate_threshold
                {
                    tracing::warn!(
                        "circuit_breaker: {}: opened, failure_rate={:.1}%, buffered={}, failed={}",
                        self.name,
                        rate,
                        buffered,
                        inner.window.failed
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.window.record(outcome);
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.permitted_calls_in_half_open {
                        tracing::info!(
                            "circuit_breaker: {}: closed (recovered after {} trial calls)",
                            self.name,
                            inner.half_open_successes
                        );
                        self.transition(&mut inner, CircuitState::Closed, now);
                    }
                } else {
                    tracing::warn!(
                        "circuit_breaker: {}: re-opened (trial call failed in half-open)",
                        self.name
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::Open | CircuitState::ForcedOpen | CircuitState::Disabled => {}
        }
    }

    /// Window counters. Never changes state.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        BreakerMetrics {
            buffered_calls: inner.window.len(),
            failed_calls: inner.window.failed,
            failure_rate: inner.window.failure_rate(),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
            mean_call_duration: inner.window.mean_duration(),
            last_call_age: inner
                .window
                .last_recorded_at()
                .map(|at| at.elapsed()),
        }
    }

    /// Trip to OPEN now and start the wait timer. Ignored under an override.
    pub fn transition_to_open(&self) {
        let mut inner = self.lock();
        if inner.state.is_forced() {
            return;
        }
        tracing::warn!("circuit_breaker: {}: opened manually", self.name);
        self.transition(&mut inner, CircuitState::Open, Instant::now());
    }

    /// Reject every call until [`CircuitBreaker::reset`]. Idempotent.
    pub fn transition_to_forced_open(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::ForcedOpen {
            return;
        }
        tracing::warn!("circuit_breaker: {}: forced open", self.name);
        self.transition(&mut inner, CircuitState::ForcedOpen, Instant::now());
    }

    /// Forward every call and record nothing until [`CircuitBreaker::reset`]. Idempotent.
    pub fn transition_to_disabled(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::Disabled {
            return;
        }
        tracing::warn!("circuit_breaker: {}: disabled", self.name);
        self.transition(&mut inner, CircuitState::Disabled, Instant::now());
    }

    /// Clear any override and return to CLOSED with an empty window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        tracing::info!("circuit_breaker: {}: reset", self.name);
        inner.window.clear();
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
    }

    fn resolve_wait(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .map(|at| now.saturating_duration_since(at) >= self.config.wait_duration_in_open)
            .unwrap_or(true);
        if due {
            tracing::info!("circuit_breaker: {}: half-open, probing backend", self.name);
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.epoch += 1;
        inner.half_open_admitted = 0;
        inner.half_open_successes = 0;
        match to {
            CircuitState::Open => inner.opened_at = Some(now),
            CircuitState::HalfOpen | CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
            }
            CircuitState::ForcedOpen | CircuitState::Disabled => inner.opened_at = None,
        }

        metrics::counter!(
            "gateway_circuit_breaker_transitions_total",
            "service" => self.name.clone(),
            "from" => from.as_str(),
            "to" => to.as_str(),
        )
        .increment(1);
        metrics::gauge!("gateway_circuit_breaker_state", "service" => self.name.clone())
            .set(to.gauge_value());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.lock().state)
            .finish()
    }
}
