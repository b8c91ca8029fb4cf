//! Circuit Breaker & Backpressure: two independent rolling-window
//! mechanisms that throttle worker respawns when a level is producing
//! too many crashes or task failures.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{BackpressureConfig, CircuitBreakerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Counts worker crashes in a rolling window; opens after `failure_threshold`
/// crashes, cools down for `cooldown_seconds`, then allows a single
/// half-open probe. Probe success closes the breaker; probe failure reopens
/// it for another full cooldown.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a new spawn is currently permitted.
    pub fn allow_spawn(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or(0);
                if elapsed >= self.config.cooldown_seconds {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit breaker entering half-open probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Records a worker crash. Returns `true` if this crash just opened the
    /// breaker.
    pub fn record_crash(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("circuit breaker probe failed, reopening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                true
            }
            _ => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        "circuit breaker opening after crash threshold"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful spawn/probe. Closes the breaker and resets the
    /// failure counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            info!("circuit breaker closing");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, BreakerState::Open)
    }
}

/// Tracks the rolling failure rate of completed tasks for a level and halts
/// new spawns once it crosses `failure_rate_threshold`.
pub struct Backpressure {
    config: BackpressureConfig,
    outcomes: Mutex<VecDeque<bool>>,
}

impl Backpressure {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_outcome(&self, succeeded: bool) {
        let mut outcomes = self.outcomes.lock().unwrap();
        outcomes.push_back(succeeded);
        while outcomes.len() > self.config.window_size {
            outcomes.pop_front();
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return 0.0;
        }
        let failed = outcomes.iter().filter(|ok| !**ok).count();
        failed as f64 / outcomes.len() as f64
    }

    pub fn allow_spawn(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.failure_rate() < self.config.failure_rate_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            cooldown_seconds: 0,
        }
    }

    #[test]
    fn closed_allows_spawns() {
        let breaker = CircuitBreaker::new(breaker_config());
        assert!(breaker.allow_spawn());
    }

    #[test]
    fn opens_after_threshold_crashes() {
        let breaker = CircuitBreaker::new(breaker_config());
        assert!(!breaker.record_crash());
        assert!(!breaker.record_crash());
        assert!(breaker.record_crash());
        assert!(breaker.is_open());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(breaker_config());
        breaker.record_crash();
        breaker.record_crash();
        breaker.record_crash();
        assert!(breaker.is_open());
        // cooldown_seconds is 0 so the next allow_spawn transitions to half-open.
        assert!(breaker.allow_spawn());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.allow_spawn());
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new(breaker_config());
        breaker.record_crash();
        breaker.record_crash();
        breaker.record_crash();
        assert!(breaker.allow_spawn());
        breaker.record_crash();
        assert!(breaker.is_open());
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            cooldown_seconds: 9999,
        });
        breaker.record_crash();
        assert!(breaker.allow_spawn());
    }

    fn backpressure_config() -> BackpressureConfig {
        BackpressureConfig {
            enabled: true,
            failure_rate_threshold: 0.5,
            window_size: 4,
        }
    }

    #[test]
    fn failure_rate_is_rolling_over_window() {
        let bp = Backpressure::new(backpressure_config());
        bp.record_outcome(false);
        bp.record_outcome(false);
        bp.record_outcome(true);
        bp.record_outcome(true);
        assert_eq!(bp.failure_rate(), 0.5);
        bp.record_outcome(true);
        // window_size 4: oldest `false` drops off, leaving 1 failure / 4.
        assert_eq!(bp.failure_rate(), 0.25);
    }

    #[test]
    fn halts_spawns_above_threshold() {
        let bp = Backpressure::new(backpressure_config());
        bp.record_outcome(false);
        bp.record_outcome(false);
        bp.record_outcome(false);
        assert!(!bp.allow_spawn());
    }

    #[test]
    fn disabled_backpressure_always_allows() {
        let bp = Backpressure::new(BackpressureConfig {
            enabled: false,
            failure_rate_threshold: 0.0,
            window_size: 4,
        });
        bp.record_outcome(false);
        assert!(bp.allow_spawn());
    }
}
