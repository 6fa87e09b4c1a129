use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed
    Closed,
    /// Circuit is open, requests are blocked (failing fast)
    Open,
    /// Circuit is half-open, allowing a single probe to check recovery
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// How long to wait before attempting recovery (half-open state)
    pub recovery_timeout: Duration,
    /// Number of consecutive successes in half-open state to close circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

/// Circuit breaker guarding the upstream vision provider.
///
/// States:
/// - Closed: normal operation, requests pass through
/// - Open: provider is down, fail fast without making requests
/// - HalfOpen: one trial request at a time probes for recovery
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<CircuitBreakerInner>>,
    config: CircuitBreakerConfig,
}

struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    last_failure_time: Option<Instant>,
    /// Set while a half-open probe is in flight; other callers fail fast
    probe_in_flight: bool,
    total_failures: usize,
    total_successes: usize,
    trips: usize,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_time: None,
                probe_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                trips: 0,
            })),
            config,
        }
    }

    /// Check if a request should be allowed.
    ///
    /// Returns true if the request can proceed, false if it must fail fast.
    /// At most one caller gets a `true` while half-open.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = inner.last_failure_time {
                    if last_failure.elapsed() >= self.config.recovery_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.consecutive_successes = 0;
                        inner.probe_in_flight = true;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_successes = 0;
                }
            }
            CircuitState::Open => {
                // Shouldn't happen, but treat as a successful probe
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 1;
            }
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure_time = Some(Instant::now());
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.trips += 1;
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed, reopen the circuit
                inner.state = CircuitState::Open;
                inner.consecutive_failures = 1;
                inner.trips += 1;
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Seconds until the next recovery probe is permitted, used as the
    /// retry_after hint for open-circuit refusals.
    pub fn retry_after_hint(&self) -> Option<u64> {
        let inner = self.inner.read();
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner.last_failure_time?.elapsed();
        Some(
            self.config
                .recovery_timeout
                .saturating_sub(elapsed)
                .as_secs()
                .max(1),
        )
    }

    /// Get statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            trips: inner.trips,
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure_time = None;
        inner.probe_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_failures: usize,
    pub total_successes: usize,
    pub trips: usize,
}
