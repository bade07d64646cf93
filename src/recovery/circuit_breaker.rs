//! Circuit breaker keyed by operation type
//!
//! A classic three-state breaker protecting each operation class. Many call
//! sites sharing an operation type share fate detection through one breaker
//! instance, created lazily and cached for the process lifetime.

use crate::error::{ResilienceError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Operation class deemed unhealthy, requests rejected
    Open,
    /// Trial period, requests pass as probes
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures before the breaker opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes
    pub success_threshold: u32,
    /// Time an open breaker waits before allowing a trial call
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for critical operation types (opens earlier, recovers
    /// cautiously)
    pub fn critical_service() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    /// Configuration for background operation types (tolerates more
    /// failures before opening)
    pub fn background_service() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(120),
        }
    }

    fn recovery_timeout_ms(&self) -> i64 {
        self.recovery_timeout.as_millis() as i64
    }
}

/// Circuit breaker statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Current failure count (decays on sustained success while closed)
    pub failure_count: u32,
    /// Consecutive successes while half-open
    pub success_count: u32,
    /// Total permission checks
    pub total_requests: u64,
    /// Requests rejected while open
    pub rejected_requests: u64,
    /// Times the breaker transitioned to open
    pub open_count: u64,
    /// Last recorded failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Last recorded success
    pub last_success_time: Option<DateTime<Utc>>,
    /// Milliseconds until an open breaker allows a trial call
    pub time_until_trial_ms: Option<i64>,
}

/// Internal mutable state, guarded by the breaker's own lock
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_requests: u64,
    rejected_requests: u64,
    open_count: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

/// Three-state circuit breaker for one operation type
pub struct CircuitBreaker {
    operation_type: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a breaker for an operation type
    pub fn new(operation_type: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            operation_type: operation_type.into(),
            config,
            state: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_requests: 0,
                rejected_requests: 0,
                open_count: 0,
                last_failure_time: None,
                last_success_time: None,
            })),
        }
    }

    /// Operation-type key this breaker guards
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    /// Check whether a request may proceed. The OPEN -> HALF_OPEN
    /// transition happens here, lazily, once the recovery timeout elapsed.
    /// Returns the distinguishable circuit-open error on rejection.
    pub async fn check_permission(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.total_requests += 1;

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                debug!(
                    operation_type = %self.operation_type,
                    "half-open breaker allowing trial call"
                );
                Ok(())
            }
            CircuitState::Open => {
                let elapsed_ms = state
                    .last_failure_time
                    .map(|t| (Utc::now() - t).num_milliseconds())
                    .unwrap_or(0);
                let recovery_ms = self.config.recovery_timeout_ms();

                if elapsed_ms >= recovery_ms {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!(
                        operation_type = %self.operation_type,
                        "breaker transitioning to half-open"
                    );
                    Ok(())
                } else {
                    state.rejected_requests += 1;
                    let retry_after_ms = recovery_ms - elapsed_ms;
                    debug!(
                        operation_type = %self.operation_type,
                        retry_after_ms,
                        "breaker open, rejecting request"
                    );
                    Err(ResilienceError::CircuitOpen {
                        operation_type: self.operation_type.clone(),
                        state: CircuitState::Open,
                        retry_after: Some(chrono::Duration::milliseconds(retry_after_ms)),
                    })
                }
            }
        }
    }

    /// Record a successful operation outcome
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        state.last_success_time = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                // Sustained success decays the failure count toward zero
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    info!(
                        operation_type = %self.operation_type,
                        "breaker closed after successful recovery"
                    );
                }
            }
            CircuitState::Open => {
                warn!(
                    operation_type = %self.operation_type,
                    "success recorded while breaker open"
                );
            }
        }
    }

    /// Record a failed operation outcome
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.last_failure_time = Some(now);

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.open_count += 1;
                    error!(
                        operation_type = %self.operation_type,
                        failures = state.failure_count,
                        "breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // A single trial failure reopens immediately, no grace
                state.state = CircuitState::Open;
                state.open_count += 1;
                state.success_count = 0;
                warn!(
                    operation_type = %self.operation_type,
                    "trial call failed, breaker reopened"
                );
            }
            CircuitState::Open => {
                debug!(
                    operation_type = %self.operation_type,
                    "failure recorded while breaker open"
                );
            }
        }
    }

    /// Current state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;

        let time_until_trial_ms = if state.state == CircuitState::Open {
            state.last_failure_time.and_then(|t| {
                let elapsed_ms = (Utc::now() - t).num_milliseconds();
                let recovery_ms = self.config.recovery_timeout_ms();
                (elapsed_ms < recovery_ms).then(|| recovery_ms - elapsed_ms)
            })
        } else {
            None
        };

        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_requests: state.total_requests,
            rejected_requests: state.rejected_requests,
            open_count: state.open_count,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            time_until_trial_ms,
        }
    }

    /// Reset the breaker to closed with cleared counters
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        info!(operation_type = %self.operation_type, "breaker reset to closed");
    }
}

/// Registry of circuit breakers, one per operation-type key
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry with a default configuration for new breakers
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    /// Get or lazily create the breaker for an operation type. Idempotent
    /// per key: concurrent callers observe the same instance.
    pub async fn breaker(&self, operation_type: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(operation_type) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(operation_type.to_string())
            .or_insert_with(|| {
                debug!(operation_type, "created circuit breaker");
                Arc::new(CircuitBreaker::new(
                    operation_type,
                    self.default_config.clone(),
                ))
            })
            .clone()
    }

    /// Statistics for every breaker in the registry
    pub async fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers = self.breakers.read().await;
        let mut stats = HashMap::new();
        for (key, breaker) in breakers.iter() {
            stats.insert(key.clone(), breaker.stats().await);
        }
        stats
    }

    /// Reset every breaker in the registry
    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
