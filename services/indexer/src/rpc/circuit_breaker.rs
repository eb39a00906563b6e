//! Circuit breaker for endpoint health tracking.
//!
//! The circuit can be in one of three states:
//! - Closed: normal operation, requests flow through
//! - Open: too many consecutive failures, reject requests immediately
//! - HalfOpen: cooldown elapsed, a single probe is admitted
//!
//! Unlike the textbook breaker, the cooldown doubles every time a half-open
//! probe fails, up to a cap. One successful probe closes the circuit and
//! resets the cooldown.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening the circuit.
    pub failure_threshold: u32,

    /// Initial cooldown before the first half-open probe.
    pub cooldown: Duration,

    /// Upper bound on the doubled cooldown.
    pub cooldown_cap: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// Cooldown applied to the current/next open period.
    current_cooldown: Duration,
    last_transition: Instant,
    /// A probe has been admitted and has not reported back yet.
    probe_in_flight: bool,
}

/// Per-endpoint circuit breaker.
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: String, config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            endpoint,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                current_cooldown,
                last_transition: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a request may proceed. In half-open only one probe is
    /// admitted at a time.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.last_transition.elapsed() >= state.current_cooldown {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    state.last_transition = Instant::now();
                    info!(
                        "circuit breaker for {} transitioning to HALF_OPEN",
                        self.endpoint
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        state.consecutive_failures = 0;

        if state.state != CircuitState::Closed {
            state.state = CircuitState::Closed;
            state.current_cooldown = self.config.cooldown;
            state.last_transition = Instant::now();
            info!(
                "circuit breaker for {} transitioning to CLOSED (recovered)",
                self.endpoint
            );
        }
    }

    /// Record a transient failure.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.last_transition = Instant::now();
                    warn!(
                        "circuit breaker for {} transitioning to OPEN ({} failures)",
                        self.endpoint, state.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                // The probe failed; re-open with a doubled cooldown.
                state.state = CircuitState::Open;
                state.current_cooldown =
                    (state.current_cooldown * 2).min(self.config.cooldown_cap);
                state.last_transition = Instant::now();
                warn!(
                    "circuit breaker for {} re-opening, cooldown now {:?}",
                    self.endpoint, state.current_cooldown
                );
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn current_cooldown(&self) -> Duration {
        self.state.lock().current_cooldown
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
