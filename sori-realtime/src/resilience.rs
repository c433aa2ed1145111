//! Admission gates guarding session starts.
//!
//! Four independent gates evaluated in order: circuit breaker,
//! user-intent latch, session debounce, connection cooldown. All are
//! pure functions of state plus an injected `Instant`, so they unit-test
//! without any transport.

use std::time::{Duration, Instant};

use crate::config::ResilienceConfig;
use crate::error::VoiceError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Closed/Open/HalfOpen breaker over connection bring-up failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    max_failures: u32,
    reset_timeout: Duration,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            max_failures,
            reset_timeout,
            last_failure: None,
            probe_in_flight: false,
        }
    }

    /// Current state, refreshed against `now`.
    pub fn state(&mut self, now: Instant) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(last) = self.last_failure {
                if now.duration_since(last) >= self.reset_timeout {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = false;
                }
            }
        }
        self.state
    }

    /// Whether a session start may proceed. In `HalfOpen` exactly one
    /// probe is admitted until it reports success or failure.
    pub fn check_admit(&mut self, now: Instant) -> Result<(), VoiceError> {
        match self.state(now) {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    Err(VoiceError::CircuitOpen { retry_in_secs: 1 })
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let elapsed =
                    self.last_failure.map(|t| now.duration_since(t)).unwrap_or_default();
                let remaining = self.reset_timeout.saturating_sub(elapsed);
                Err(VoiceError::CircuitOpen { retry_in_secs: remaining.as_secs().max(1) })
            }
        }
    }

    /// Record a bring-up failure. Opens the breaker once the failure
    /// budget is spent, or immediately when a half-open probe fails.
    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure = Some(now);
        if self.state == BreakerState::HalfOpen || self.failure_count >= self.max_failures {
            if self.state != BreakerState::Open {
                tracing::warn!(failures = self.failure_count, "circuit breaker opened");
            }
            self.state = BreakerState::Open;
            self.probe_in_flight = false;
        }
    }

    /// Record a successful bring-up: closes the breaker and clears the
    /// failure budget.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
        self.probe_in_flight = false;
    }

    /// Reset to the pristine closed state.
    pub fn reset(&mut self) {
        self.record_success();
    }
}

/// Suppresses a start for a scenario that was just started.
#[derive(Debug)]
pub struct SessionDebounce {
    last_start: Option<Instant>,
    last_scenario: Option<String>,
    min_interval: Duration,
}

impl SessionDebounce {
    pub fn new(min_interval: Duration) -> Self {
        Self { last_start: None, last_scenario: None, min_interval }
    }

    /// Whether starting `scenario` now duplicates a recent start. The
    /// boundary is exclusive: at exactly `min_interval` the start is not
    /// suppressed.
    pub fn is_duplicate(&self, scenario: &str, now: Instant) -> bool {
        match (&self.last_scenario, self.last_start) {
            (Some(last), Some(at)) => {
                last == scenario && now.duration_since(at) < self.min_interval
            }
            _ => false,
        }
    }

    /// Record an admitted start.
    pub fn record_start(&mut self, scenario: &str, now: Instant) {
        self.last_scenario = Some(scenario.to_string());
        self.last_start = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_start = None;
        self.last_scenario = None;
    }
}

/// Sticky signal that the most recent session end was user-initiated.
#[derive(Debug, Default)]
pub struct UserIntentLatch {
    user_ended_session: bool,
    ended_at: Option<Instant>,
    allow_auto_restart: bool,
    session_management_disabled: bool,
}

impl UserIntentLatch {
    /// Set atomically by a user-initiated stop.
    pub fn set_user_ended(&mut self, now: Instant) {
        self.user_ended_session = true;
        self.ended_at = Some(now);
        self.allow_auto_restart = false;
    }

    /// Whether a non-user-initiated start inside the respect window must
    /// be rejected.
    pub fn blocks_auto_start(&self, now: Instant, window: Duration) -> bool {
        if self.session_management_disabled {
            return true;
        }
        if !self.user_ended_session || self.allow_auto_restart {
            return false;
        }
        match self.ended_at {
            Some(at) => now.duration_since(at) < window,
            None => false,
        }
    }

    /// Cleared as the first action of a user-initiated start.
    pub fn reset(&mut self) {
        self.user_ended_session = false;
        self.ended_at = None;
        self.allow_auto_restart = false;
    }

    /// Disable all automatic session management (kill switch).
    pub fn set_session_management_disabled(&mut self, disabled: bool) {
        self.session_management_disabled = disabled;
    }

    pub fn user_ended_session(&self) -> bool {
        self.user_ended_session
    }
}

/// Enforces a minimum gap between successive peer-connection attempts.
/// A hot start is delayed, never rejected.
#[derive(Debug)]
pub struct ConnectionCooldown {
    last_attempt: Option<Instant>,
    interval: Duration,
}

impl ConnectionCooldown {
    pub fn new(interval: Duration) -> Self {
        Self { last_attempt: None, interval }
    }

    /// Remaining delay before the next attempt may begin.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_attempt {
            Some(at) => self.interval.saturating_sub(now.duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Record the beginning of a connection attempt.
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_attempt = None;
    }
}

/// Outcome of gate evaluation for a session start.
#[derive(Debug)]
pub enum Admission {
    /// Start may proceed after sleeping `cooldown`.
    Proceed { cooldown: Duration },
    /// A session for this scenario was just requested; resolve as a
    /// no-op success.
    DebouncedDuplicate,
    /// Start refused.
    Rejected(VoiceError),
}

/// The composed resilience layer.
pub struct ResilienceGates {
    breaker: CircuitBreaker,
    latch: UserIntentLatch,
    debounce: SessionDebounce,
    cooldown: ConnectionCooldown,
    user_intent_window: Duration,
}

impl ResilienceGates {
    pub fn new(config: &ResilienceConfig, cooldown_interval: Duration) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                config.breaker_max_failures,
                config.breaker_reset_timeout,
            ),
            latch: UserIntentLatch::default(),
            debounce: SessionDebounce::new(config.debounce_min_interval),
            cooldown: ConnectionCooldown::new(cooldown_interval),
            user_intent_window: config.user_intent_window,
        }
    }

    /// Evaluate the gates in order: breaker, user-intent latch, debounce,
    /// cooldown. A user-initiated start resets the latch as its first
    /// action.
    pub fn admit(&mut self, scenario: &str, is_user_initiated: bool, now: Instant) -> Admission {
        if let Err(err) = self.breaker.check_admit(now) {
            return Admission::Rejected(err);
        }

        if is_user_initiated {
            self.latch.reset();
        } else if self.latch.blocks_auto_start(now, self.user_intent_window) {
            return Admission::Rejected(VoiceError::SessionStart(
                "Session was recently ended by user. Please wait a moment before starting a new \
                 conversation."
                    .to_string(),
            ));
        }

        if self.debounce.is_duplicate(scenario, now) {
            return Admission::DebouncedDuplicate;
        }

        Admission::Proceed { cooldown: self.cooldown.remaining(now) }
    }

    /// Record that an admitted start is actually attempting a connection.
    pub fn record_attempt(&mut self, scenario: &str, now: Instant) {
        self.debounce.record_start(scenario, now);
        self.cooldown.record_attempt(now);
    }

    /// Bring-up failed: feed the breaker.
    pub fn record_failure(&mut self, now: Instant) {
        self.breaker.record_failure(now);
    }

    /// Session reached `Active`: close the breaker.
    pub fn record_success(&mut self) {
        self.breaker.record_success();
    }

    /// Mark the latest stop as user-initiated.
    pub fn set_user_ended(&mut self, now: Instant) {
        self.latch.set_user_ended(now);
    }

    /// Whether the latch currently reports a user-ended session.
    pub fn user_ended_session(&self) -> bool {
        self.latch.user_ended_session()
    }

    /// Clear latches, breaker, and debounce. Invoked from `initialize`
    /// and `destroy`.
    pub fn reset_to_clean_state(&mut self) {
        self.breaker.reset();
        self.latch.reset();
        self.debounce.reset();
        self.cooldown.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESET: Duration = Duration::from_secs(30);

    fn gates() -> ResilienceGates {
        ResilienceGates::new(&ResilienceConfig::default(), Duration::from_millis(2000))
    }

    #[test]
    fn breaker_opens_after_three_failures() {
        let mut breaker = CircuitBreaker::new(3, RESET);
        let t0 = Instant::now();

        breaker.record_failure(t0);
        breaker.record_failure(t0);
        assert!(breaker.check_admit(t0).is_ok());

        breaker.record_failure(t0);
        let err = breaker.check_admit(t0).unwrap_err();
        assert!(matches!(err, VoiceError::CircuitOpen { .. }));
    }

    #[test]
    fn breaker_rejection_reports_remaining_seconds() {
        let mut breaker = CircuitBreaker::new(3, RESET);
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }

        match breaker.check_admit(t0 + Duration::from_secs(10)) {
            Err(VoiceError::CircuitOpen { retry_in_secs }) => assert_eq!(retry_in_secs, 20),
            other => panic!("expected circuit_open, got {other:?}"),
        }
    }

    #[test]
    fn breaker_half_open_permits_single_probe() {
        let mut breaker = CircuitBreaker::new(3, RESET);
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }

        let after_reset = t0 + RESET;
        assert!(breaker.check_admit(after_reset).is_ok(), "probe admitted");
        assert!(breaker.check_admit(after_reset).is_err(), "second probe refused");

        breaker.record_success();
        assert_eq!(breaker.state(after_reset), BreakerState::Closed);
    }

    #[test]
    fn breaker_reopens_when_probe_fails() {
        let mut breaker = CircuitBreaker::new(3, RESET);
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(t0);
        }

        let probe_at = t0 + RESET;
        assert!(breaker.check_admit(probe_at).is_ok());
        breaker.record_failure(probe_at);
        assert!(breaker.check_admit(probe_at + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn debounce_boundary_is_exclusive() {
        let mut debounce = SessionDebounce::new(Duration::from_millis(2000));
        let t0 = Instant::now();
        debounce.record_start("s2", t0);

        assert!(debounce.is_duplicate("s2", t0 + Duration::from_millis(1999)));
        assert!(!debounce.is_duplicate("s2", t0 + Duration::from_millis(2000)));
        assert!(!debounce.is_duplicate("s3", t0 + Duration::from_millis(100)));
    }

    #[test]
    fn latch_blocks_auto_start_within_window() {
        let mut latch = UserIntentLatch::default();
        let t0 = Instant::now();
        latch.set_user_ended(t0);

        let window = Duration::from_secs(5);
        assert!(latch.blocks_auto_start(t0 + Duration::from_secs(4), window));
        assert!(!latch.blocks_auto_start(t0 + Duration::from_secs(5), window));

        latch.reset();
        assert!(!latch.blocks_auto_start(t0 + Duration::from_millis(1), window));
    }

    #[test]
    fn cooldown_is_a_delay_not_a_rejection() {
        let mut cooldown = ConnectionCooldown::new(Duration::from_millis(2000));
        let t0 = Instant::now();
        assert_eq!(cooldown.remaining(t0), Duration::ZERO);

        cooldown.record_attempt(t0);
        assert_eq!(
            cooldown.remaining(t0 + Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
        assert_eq!(cooldown.remaining(t0 + Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn gates_evaluate_in_order() {
        let mut gates = gates();
        let t0 = Instant::now();

        // Latch set, but a user-initiated start resets it and proceeds.
        gates.set_user_ended(t0);
        match gates.admit("s1", true, t0 + Duration::from_millis(1)) {
            Admission::Proceed { .. } => {}
            other => panic!("expected proceed, got {other:?}"),
        }

        // Auto start after a fresh user end is rejected with the user
        // message.
        gates.set_user_ended(t0);
        match gates.admit("s1", false, t0 + Duration::from_secs(1)) {
            Admission::Rejected(err) => {
                assert!(err.to_string().contains("recently ended by user"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_scenario_start_is_debounced() {
        let mut gates = gates();
        let t0 = Instant::now();

        gates.record_attempt("s2", t0);
        match gates.admit("s2", true, t0 + Duration::from_millis(500)) {
            Admission::DebouncedDuplicate => {}
            other => panic!("expected debounce, got {other:?}"),
        }
    }

    #[test]
    fn open_breaker_takes_precedence_over_everything() {
        let mut gates = gates();
        let t0 = Instant::now();
        for _ in 0..3 {
            gates.record_failure(t0);
        }

        match gates.admit("s1", true, t0 + Duration::from_secs(1)) {
            Admission::Rejected(VoiceError::CircuitOpen { .. }) => {}
            other => panic!("expected circuit_open, got {other:?}"),
        }
    }

    #[test]
    fn reset_to_clean_state_clears_all_gates() {
        let mut gates = gates();
        let t0 = Instant::now();
        for _ in 0..3 {
            gates.record_failure(t0);
        }
        gates.set_user_ended(t0);
        gates.record_attempt("s1", t0);

        gates.reset_to_clean_state();
        match gates.admit("s1", false, t0 + Duration::from_millis(1)) {
            Admission::Proceed { cooldown } => assert_eq!(cooldown, Duration::ZERO),
            other => panic!("expected clean proceed, got {other:?}"),
        }
    }
}
