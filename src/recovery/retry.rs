//! Retry engine with classification-aware backoff
//!
//! Drives repeated execution of a caller-supplied operation behind the
//! operation type's circuit breaker, consulting the classifier for retry
//! eligibility and backoff scaling. The inter-attempt delay is the only
//! suspension point and it is cancellable: a caller deadline or
//! cancellation token aborts the loop with a cancellation-flavored error.

use crate::classifier::{
    policy_for, Classification, ClassificationContext, ErrorClassifier,
};
use crate::error::{ResilienceError, Result};
use crate::recovery::CircuitBreakerRegistry;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry history entries kept in memory
const MAX_HISTORY: usize = 256;

/// Messages that mark an error terminal regardless of kind
const TERMINAL_PATTERNS: &[&str] = &["invalid credentials", "forbidden", "not found", "bad request"];

/// Backoff shapes for inter-attempt delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Delay multiplied by `backoff_multiplier^(attempt - 1)`
    #[default]
    Exponential,
    /// Delay multiplied by the attempt number
    Linear,
    /// Constant delay
    Fixed,
    /// No delay between attempts
    Immediate,
}

/// Custom retry eligibility predicate. When supplied it replaces the
/// engine's kind/terminal-pattern policy (the attempt budget still binds).
pub type RetryCondition =
    Arc<dyn Fn(&ResilienceError, &Classification, u32) -> bool + Send + Sync>;

/// Opaque key-value bag a long-running operation may populate across
/// attempts. Owned by the operation; the engine never inspects it.
pub type PreservedState = Arc<RwLock<HashMap<String, Value>>>;

/// Configuration for one `execute_with_retry` call
#[derive(Clone)]
pub struct RetryOptions {
    /// Retry budget (initial attempt excluded)
    pub max_retries: u32,
    /// Backoff shape
    pub strategy: BackoffStrategy,
    /// Base inter-attempt delay
    pub base_delay: Duration,
    /// Exponential growth factor
    pub backoff_multiplier: f64,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
    /// Breaker and rule scoping key
    pub operation_type: String,
    /// Human-readable operation identity (defaults to the operation type)
    pub operation_name: Option<String>,
    /// Custom retry eligibility predicate
    pub retry_condition: Option<RetryCondition>,
    /// Scale delays by a random factor in [0.5, 1.0] to avoid retry storms
    pub jitter: bool,
    /// Overall deadline for the whole call, measured from the first attempt
    pub deadline: Option<Duration>,
    /// Caller cancellation signal, observed during inter-attempt delays
    pub cancellation: Option<CancellationToken>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::seconds(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::seconds(30),
            operation_type: "default".to_string(),
            operation_name: None,
            retry_condition: None,
            jitter: true,
            deadline: None,
            cancellation: None,
        }
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("operation_type", &self.operation_type)
            .field("operation_name", &self.operation_name)
            .field(
                "retry_condition",
                &self.retry_condition.as_ref().map(|_| "<predicate>"),
            )
            .field("jitter", &self.jitter)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl RetryOptions {
    /// Options for an operation type with the remaining fields defaulted
    pub fn for_operation_type<S: Into<String>>(operation_type: S) -> Self {
        Self {
            operation_type: operation_type.into(),
            ..Default::default()
        }
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff shape
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the exponential growth factor
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the delay upper bound
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the operation name
    pub fn with_operation_name<S: Into<String>>(mut self, name: S) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Set a custom retry eligibility predicate
    pub fn with_retry_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_condition = Some(condition);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the overall deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Resolved operation name for logs and enriched errors
    pub fn resolved_name(&self) -> &str {
        self.operation_name.as_deref().unwrap_or(&self.operation_type)
    }

    /// Compute the pre-jitter delay before retry attempt `attempt`
    /// (1-based). The classification's policy multiplier scales the result,
    /// which is then capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, classification_multiplier: f64) -> Duration {
        let strategy_factor = match self.strategy {
            BackoffStrategy::Exponential => {
                self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32)
            }
            BackoffStrategy::Linear => attempt as f64,
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Immediate => 0.0,
        };

        let ms = self.base_delay.num_milliseconds() as f64
            * strategy_factor
            * classification_multiplier;
        let capped = Duration::milliseconds(ms as i64);
        if capped > self.max_delay {
            self.max_delay
        } else {
            capped
        }
    }
}

/// One attempt's view of the retry loop, handed to the operation
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Attempt counter, starting at 0 for the initial attempt
    pub attempt_number: u32,
    /// Retry budget for this call
    pub max_retries: u32,
    /// Breaker scoping key
    pub operation_type: String,
    /// Resolved operation name
    pub operation_name: String,
    /// When the call entered the engine
    pub start_time: DateTime<Utc>,
    /// Cross-attempt state bag, owned by the operation
    pub preserved_state: PreservedState,
}

/// Retry history entry. Statistics only; never consulted by retry
/// decisions.
#[derive(Debug, Clone, Serialize)]
pub struct RetryRecord {
    /// Operation identity
    pub operation_name: String,
    /// Whether the call ultimately succeeded
    pub success: bool,
    /// Operation invocations made
    pub attempts: u32,
    /// Wall time spent in the engine
    pub duration_ms: i64,
    /// Summary of the terminal error, when failed
    pub error_summary: Option<String>,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

/// Aggregate retry statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    /// Calls entering the engine
    pub total_operations: u64,
    /// Calls that succeeded on the initial attempt
    pub successful_first_attempt: u64,
    /// Calls that succeeded after at least one retry
    pub successful_after_retry: u64,
    /// Calls that exhausted eligible retries
    pub failed_after_retries: u64,
    /// Calls rejected by an open breaker
    pub circuit_rejections: u64,
    /// Calls abandoned on caller cancellation or deadline
    pub cancelled_operations: u64,
    /// Individual retry attempts made
    pub total_retry_attempts: u64,
    /// Last retry timestamp
    pub last_retry: Option<DateTime<Utc>>,
}

/// Retry engine driving operations through breaker and classifier
pub struct RetryEngine {
    classifier: Arc<ErrorClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    history: Arc<RwLock<VecDeque<RetryRecord>>>,
    stats: Arc<RwLock<RetryStats>>,
}

impl RetryEngine {
    /// Create an engine over shared classifier and breaker registry
    pub fn new(classifier: Arc<ErrorClassifier>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            classifier,
            breakers,
            history: Arc::new(RwLock::new(VecDeque::new())),
            stats: Arc::new(RwLock::new(RetryStats::default())),
        }
    }

    /// Breaker registry this engine consults
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Classifier this engine consults
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Execute an operation with retry, backoff and circuit breaking.
    ///
    /// The operation receives an [`AttemptContext`] per attempt. On
    /// terminal failure the returned error is enriched with attempt count
    /// and operation identity; breaker rejections and cancellations keep
    /// their own distinguishable flavors.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: F, options: RetryOptions) -> Result<T>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Utc::now();
        let operation_name = options.resolved_name().to_string();
        let preserved_state: PreservedState = Arc::new(RwLock::new(HashMap::new()));
        let breaker = self.breakers.breaker(&options.operation_type).await;

        {
            let mut stats = self.stats.write().await;
            stats.total_operations += 1;
        }

        let mut attempt: u32 = 0;
        loop {
            if let Err(rejection) = breaker.check_permission().await {
                // Breaker rejections do not consume the retry budget
                let mut stats = self.stats.write().await;
                stats.circuit_rejections += 1;
                drop(stats);
                self.record(&operation_name, false, attempt, started, Some("circuit open"))
                    .await;
                return Err(rejection);
            }

            let context = AttemptContext {
                attempt_number: attempt,
                max_retries: options.max_retries,
                operation_type: options.operation_type.clone(),
                operation_name: operation_name.clone(),
                start_time: started,
                preserved_state: preserved_state.clone(),
            };

            match operation(context).await {
                Ok(value) => {
                    breaker.record_success().await;
                    let mut stats = self.stats.write().await;
                    if attempt == 0 {
                        stats.successful_first_attempt += 1;
                    } else {
                        stats.successful_after_retry += 1;
                        info!(
                            operation = %operation_name,
                            attempts = attempt + 1,
                            "operation succeeded after retry"
                        );
                    }
                    drop(stats);
                    self.record(&operation_name, true, attempt + 1, started, None)
                        .await;
                    return Ok(value);
                }
                Err(error) => {
                    breaker.record_failure().await;

                    if error.is_cancelled() {
                        let mut stats = self.stats.write().await;
                        stats.cancelled_operations += 1;
                        drop(stats);
                        self.record(&operation_name, false, attempt + 1, started, Some("cancelled"))
                            .await;
                        return Err(error);
                    }

                    let classification_context = ClassificationContext::new()
                        .with_operation_type(options.operation_type.clone())
                        .with_operation_name(operation_name.clone())
                        .with_prior_retries(attempt);
                    let classification =
                        self.classifier.classify(&error, &classification_context).await;

                    let eligible = match &options.retry_condition {
                        Some(condition) => condition(&error, &classification, attempt),
                        None => default_retry_eligibility(&error, &classification),
                    };

                    if !eligible || attempt >= options.max_retries {
                        let total_attempts = attempt + 1;
                        warn!(
                            operation = %operation_name,
                            attempts = total_attempts,
                            kind = %classification.kind,
                            retryable = eligible,
                            "giving up: {error}"
                        );
                        let mut stats = self.stats.write().await;
                        stats.failed_after_retries += 1;
                        drop(stats);
                        self.record(
                            &operation_name,
                            false,
                            total_attempts,
                            started,
                            Some(&error.to_string()),
                        )
                        .await;
                        return Err(ResilienceError::RetryExhausted {
                            operation_name,
                            total_attempts,
                            max_retries: options.max_retries,
                            source: Box::new(error),
                        });
                    }

                    attempt += 1;
                    let delay =
                        options.delay_for_attempt(attempt, classification.backoff_multiplier);
                    let delay = apply_jitter(delay, options.jitter);

                    {
                        let mut stats = self.stats.write().await;
                        stats.total_retry_attempts += 1;
                        stats.last_retry = Some(Utc::now());
                    }

                    debug!(
                        operation = %operation_name,
                        attempt,
                        max_retries = options.max_retries,
                        delay_ms = delay.num_milliseconds(),
                        kind = %classification.kind,
                        "retrying after delay"
                    );

                    self.sleep_between_attempts(&options, started, delay).await?;
                }
            }
        }
    }

    /// Cancellable inter-attempt delay, the engine's only suspension point
    async fn sleep_between_attempts(
        &self,
        options: &RetryOptions,
        started: DateTime<Utc>,
        delay: Duration,
    ) -> Result<()> {
        let delay_ms = delay.num_milliseconds().max(0) as u64;

        // An overall deadline shrinks the sleep; reaching it cancels the loop
        let (sleep_ms, deadline_hit) = match options.deadline {
            Some(deadline) => {
                let elapsed = Utc::now() - started;
                let remaining = (deadline - elapsed).num_milliseconds().max(0) as u64;
                if remaining <= delay_ms {
                    (remaining, true)
                } else {
                    (delay_ms, false)
                }
            }
            None => (delay_ms, false),
        };

        let sleep_future = sleep(std::time::Duration::from_millis(sleep_ms));
        match &options.cancellation {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        let mut stats = self.stats.write().await;
                        stats.cancelled_operations += 1;
                        return Err(ResilienceError::cancelled(format!(
                            "caller cancelled '{}' during retry delay",
                            options.resolved_name()
                        )));
                    }
                    _ = sleep_future => {}
                }
            }
            None => sleep_future.await,
        }

        if deadline_hit {
            let mut stats = self.stats.write().await;
            stats.cancelled_operations += 1;
            return Err(ResilienceError::cancelled(format!(
                "deadline elapsed for '{}' during retry delay",
                options.resolved_name()
            )));
        }
        Ok(())
    }

    async fn record(
        &self,
        operation_name: &str,
        success: bool,
        attempts: u32,
        started: DateTime<Utc>,
        error_summary: Option<&str>,
    ) {
        let record = RetryRecord {
            operation_name: operation_name.to_string(),
            success,
            attempts,
            duration_ms: (Utc::now() - started).num_milliseconds(),
            error_summary: error_summary.map(|s| s.to_string()),
            timestamp: Utc::now(),
        };

        let mut history = self.history.write().await;
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Aggregate statistics snapshot
    pub async fn stats(&self) -> RetryStats {
        self.stats.read().await.clone()
    }

    /// Recent call history, oldest first
    pub async fn history(&self) -> Vec<RetryRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Reset aggregate statistics
    pub async fn reset_stats(&self) {
        *self.stats.write().await = RetryStats::default();
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(
            Arc::new(ErrorClassifier::new()),
            Arc::new(CircuitBreakerRegistry::default()),
        )
    }
}

/// Default eligibility: the kind's policy must allow retries and the
/// message must not match a terminal pattern.
fn default_retry_eligibility(error: &ResilienceError, classification: &Classification) -> bool {
    if !policy_for(classification.kind).retryable {
        return false;
    }
    let message = error.to_string().to_lowercase();
    !TERMINAL_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Scale a delay by a uniform random factor in [0.5, 1.0]
fn apply_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::milliseconds((delay.num_milliseconds() as f64 * factor) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> RetryEngine {
        RetryEngine::default()
    }

    fn fast_options(operation_type: &str) -> RetryOptions {
        RetryOptions::for_operation_type(operation_type)
            .with_base_delay(Duration::milliseconds(5))
            .with_jitter(false)
    }

    #[test]
    fn test_exponential_backoff_growth() {
        let options = RetryOptions::default()
            .with_base_delay(Duration::milliseconds(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(options.delay_for_attempt(1, 1.0), Duration::milliseconds(100));
        assert_eq!(options.delay_for_attempt(2, 1.0), Duration::milliseconds(200));
        assert_eq!(options.delay_for_attempt(3, 1.0), Duration::milliseconds(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let options = RetryOptions::default()
            .with_base_delay(Duration::milliseconds(100))
            .with_max_delay(Duration::milliseconds(250));

        assert_eq!(options.delay_for_attempt(3, 1.0), Duration::milliseconds(250));
    }

    #[test]
    fn test_linear_fixed_immediate_strategies() {
        let base = RetryOptions::default().with_base_delay(Duration::milliseconds(100));

        let linear = base.clone().with_strategy(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for_attempt(3, 1.0), Duration::milliseconds(300));

        let fixed = base.clone().with_strategy(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for_attempt(3, 1.0), Duration::milliseconds(100));

        let immediate = base.with_strategy(BackoffStrategy::Immediate);
        assert_eq!(immediate.delay_for_attempt(3, 1.0), Duration::zero());
    }

    #[test]
    fn test_classification_multiplier_scales_delay() {
        let options = RetryOptions::default()
            .with_base_delay(Duration::milliseconds(100))
            .with_strategy(BackoffStrategy::Fixed);

        assert_eq!(options.delay_for_attempt(1, 3.0), Duration::milliseconds(300));
    }

    #[test]
    fn test_jitter_stays_in_half_to_full_range() {
        let delay = Duration::milliseconds(1000);
        for _ in 0..50 {
            let jittered = apply_jitter(delay, true).num_milliseconds();
            assert!((500..=1000).contains(&jittered), "jittered delay {jittered}");
        }
    }

    #[tokio::test]
    async fn test_always_failing_operation_attempt_count() {
        let engine = engine();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let result: Result<()> = engine
            .execute_with_retry(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ResilienceError::network("connection reset by peer"))
                    }
                },
                fast_options("flaky").with_max_retries(2),
            )
            .await;

        // 1 initial + 2 retries
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            ResilienceError::RetryExhausted {
                operation_name,
                total_attempts,
                max_retries,
                source,
            } => {
                assert_eq!(operation_name, "flaky");
                assert_eq!(total_attempts, 3);
                assert_eq!(max_retries, 2);
                assert!(matches!(*source, ResilienceError::Network(_)));
            }
            other => panic!("expected retry exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let engine = engine();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let result = engine
            .execute_with_retry(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ResilienceError::network("connection refused"))
                        } else {
                            Ok("ready")
                        }
                    }
                },
                fast_options("warmup"),
            )
            .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        let stats = engine.stats().await;
        assert_eq!(stats.successful_after_retry, 1);
        assert_eq!(stats.total_retry_attempts, 2);
    }

    #[tokio::test]
    async fn test_authentication_errors_never_retry() {
        let engine = engine();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let result: Result<()> = engine
            .execute_with_retry(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ResilienceError::authentication("token expired"))
                    }
                },
                fast_options("session").with_max_retries(5),
            )
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_retry_exhausted());
    }

    #[tokio::test]
    async fn test_terminal_message_short_circuits() {
        let engine = engine();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let result: Result<()> = engine
            .execute_with_retry(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        // Network kind is retryable but the message is terminal
                        Err(ResilienceError::api("upstream error: 404 not found"))
                    }
                },
                fast_options("lookup"),
            )
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_custom_retry_condition_wins() {
        let engine = engine();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let condition: RetryCondition = Arc::new(|_, _, _| false);
        let result: Result<()> = engine
            .execute_with_retry(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ResilienceError::network("connection refused"))
                    }
                },
                fast_options("custom").with_retry_condition(condition),
            )
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_invoking_operation() {
        let engine = engine();
        let options = fast_options("fragile").with_max_retries(5);

        // Exhaust the breaker threshold
        let _: Result<()> = engine
            .execute_with_retry(
                |_ctx| async { Err(ResilienceError::network("connection refused")) },
                options.clone(),
            )
            .await;

        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        let result: Result<()> = engine
            .execute_with_retry(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                options,
            )
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_during_delay() {
        let engine = engine();
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result: Result<()> = engine
            .execute_with_retry(
                |_ctx| async { Err(ResilienceError::network("connection refused")) },
                RetryOptions::for_operation_type("slow")
                    .with_base_delay(Duration::seconds(10))
                    .with_jitter(false)
                    .with_cancellation(token),
            )
            .await;

        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_elapses_during_delay() {
        let engine = engine();

        let started = std::time::Instant::now();
        let result: Result<()> = engine
            .execute_with_retry(
                |_ctx| async { Err(ResilienceError::network("connection refused")) },
                RetryOptions::for_operation_type("deadline")
                    .with_base_delay(Duration::seconds(10))
                    .with_jitter(false)
                    .with_deadline(Duration::milliseconds(50)),
            )
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_preserved_state_survives_across_attempts() {
        let engine = engine();

        let result = engine
            .execute_with_retry(
                |ctx: AttemptContext| async move {
                    let mut state = ctx.preserved_state.write().await;
                    let progress = state
                        .get("progress")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    state.insert("progress".to_string(), Value::from(progress + 1));
                    if progress + 1 < 3 {
                        Err(ResilienceError::network("connection refused"))
                    } else {
                        Ok(progress + 1)
                    }
                },
                fast_options("checkpointed"),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_history_records_outcomes() {
        let engine = engine();

        let _ = engine
            .execute_with_retry(|_ctx| async { Ok(1) }, fast_options("ok"))
            .await;
        let _: Result<()> = engine
            .execute_with_retry(
                |_ctx| async { Err(ResilienceError::logic("assertion failed")) },
                fast_options("broken"),
            )
            .await;

        let history = engine.history().await;
        assert_eq!(history.len(), 2);
        assert!(history[0].success);
        assert!(!history[1].success);
        assert!(history[1].error_summary.is_some());
    }
}
