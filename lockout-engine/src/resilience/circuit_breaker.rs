//! Circuit breaker guarding the lockout store
//!
//! One breaker is shared by every login attempt in the process. It does not
//! wrap calls itself; the policy engine asks [`CircuitBreaker::can_execute`]
//! before touching the store and reports the outcome afterwards.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐
//! │ Closed  │ ◄──────────────────┐
//! │ (Normal)│                    │
//! └────┬────┘                    │
//!      │ failure_threshold       │ probe succeeds
//!      │ failures                │
//!      ▼                         │
//! ┌─────────┐    timeout    ┌────┴──────┐
//! │  Open   │───────────────► HalfOpen  │
//! │(Failing)│                │ (Probing) │
//! └─────────┘◄───────────────└───────────┘
//!                probe fails
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, every call is permitted
    Closed,
    /// Store assumed down, calls refused until the timeout elapses
    Open,
    /// Testing whether the store recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [lockout.circuit_breaker]
/// enabled = true
/// failure_threshold = 5
/// timeout_secs = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Whether the engine consults the breaker at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds after the last failure before a probe is allowed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_timeout_secs() -> u64 {
    30
}

/// Point-in-time view of the breaker, for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Failures recorded since the last success
    pub failure_count: u32,
    /// When the most recent failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Shared circuit breaker
///
/// Cloning is cheap and every clone observes the same state. Reads take a
/// shared lock; outcome reports and the Open → HalfOpen transition take the
/// exclusive lock.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    inner: Arc<RwLock<BreakerInner>>,
    failure_threshold: u32,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker driven by the system clock
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker driven by the given clock
    pub fn with_clock(
        name: impl Into<String>,
        config: &CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let timeout_secs = i64::try_from(config.timeout_secs).unwrap_or(i64::MAX);
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
            })),
            failure_threshold: config.failure_threshold.max(1),
            timeout: Duration::try_seconds(timeout_secs).unwrap_or(Duration::MAX),
            clock,
        }
    }

    /// Get the breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Failures recorded since the last success
    pub fn failure_count(&self) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failure_count
    }

    /// Current state, failure count and last failure time
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Whether the store may be called right now
    ///
    /// In the Open state this returns `true` once the timeout has elapsed since
    /// the last failure and moves the breaker to HalfOpen in the same write.
    pub fn can_execute(&self) -> bool {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    if !self.timeout_elapsed(inner.last_failure_at) {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.timeout_elapsed(inner.last_failure_at) {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(
                        circuit_breaker = %self.name,
                        state = "Open -> HalfOpen",
                        "Circuit breaker allowing probe"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report a successful store call
    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            tracing::info!(
                circuit_breaker = %self.name,
                state = "HalfOpen -> Closed",
                "Circuit breaker closed after successful probe"
            );
        }
    }

    /// Report a failed store call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);

        if inner.failure_count >= self.failure_threshold && inner.state != CircuitState::Open {
            let previous = inner.state;
            inner.state = CircuitState::Open;
            tracing::warn!(
                circuit_breaker = %self.name,
                state = %format!("{} -> Open", previous),
                failure_count = inner.failure_count,
                failure_threshold = self.failure_threshold,
                "Circuit breaker opened"
            );
        }
    }

    fn timeout_elapsed(&self, last_failure_at: Option<DateTime<Utc>>) -> bool {
        match last_failure_at {
            Some(at) => self.clock.now() - at >= self.timeout,
            None => true,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &snapshot.state)
            .field("failure_count", &snapshot.failure_count)
            .field("failure_threshold", &self.failure_threshold)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32, timeout_secs: u64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            timeout_secs,
        };
        let cb = CircuitBreaker::with_clock("lockout-store", &config, Arc::new(clock.clone()));
        (cb, clock)
    }

    #[test]
    fn test_initial_state_is_closed() {
        let (cb, _) = breaker(3, 30);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let (cb, _) = breaker(3, 30);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.failure_count(), 2);
    }

    #[test]
    fn test_opens_at_threshold() {
        let (cb, _) = breaker(3, 30);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_open_refuses_until_timeout() {
        let (cb, clock) = breaker(2, 30);
        cb.record_failure();
        cb.record_failure();

        clock.advance(Duration::seconds(29));
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_to_half_open_after_timeout() {
        let (cb, clock) = breaker(2, 30);
        cb.record_failure();
        cb.record_failure();

        clock.advance(Duration::seconds(30));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_to_closed_on_success() {
        let (cb, clock) = breaker(2, 30);
        cb.record_failure();
        cb.record_failure();
        clock.advance(Duration::seconds(31));
        assert!(cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_to_open_on_failure() {
        let (cb, clock) = breaker(2, 30);
        cb.record_failure();
        cb.record_failure();
        clock.advance(Duration::seconds(31));
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_resets_failure_count_in_closed() {
        let (cb, _) = breaker(3, 30);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_snapshot_reports_last_failure() {
        let (cb, clock) = breaker(3, 30);
        cb.record_failure();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.last_failure_at, Some(clock.now()));
    }

    #[test]
    fn test_clones_share_state() {
        let (cb, _) = breaker(1, 30);
        let other = cb.clone();
        cb.record_failure();
        assert_eq!(other.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_counted() {
        let (cb, _) = breaker(1000, 30);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    cb.record_failure();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cb.failure_count(), 500);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.timeout_secs, 30);
    }
}
