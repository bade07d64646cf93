//! Resilience manager combining classifier, retry engine and escalation
//!
//! A facade over the full pipeline: classify, retry-or-not behind the
//! operation type's breaker, and on retry exhaustion hand the enriched
//! failure to the escalation engine before propagating it. Components are
//! explicitly constructed and injected; there are no module-level globals.

use crate::classifier::{CacheStats, ClassificationContext, DeployEnvironment, ErrorClassifier};
use crate::error::{ResilienceError, Result};
use crate::escalation::{EscalationContext, EscalationEngine, EscalationStats};
use crate::recovery::{
    AttemptContext, CircuitBreakerRegistry, CircuitBreakerStats, RetryEngine, RetryOptions,
    RetryStats,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Aggregated read-only statistics for dashboard collaborators
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Retry engine counters
    pub retry: RetryStats,
    /// Per-operation-type breaker snapshots
    pub breakers: HashMap<String, CircuitBreakerStats>,
    /// Escalation counters
    pub escalation: EscalationStats,
    /// Classifier memoization cache counters
    pub classifier_cache: CacheStats,
}

/// Dependency-injected pipeline facade
pub struct ResilienceManager {
    classifier: Arc<ErrorClassifier>,
    retry_engine: RetryEngine,
    escalation: Arc<EscalationEngine>,
}

impl ResilienceManager {
    /// Manager wired with default-configuration components
    pub fn new() -> Self {
        Self::with_components(
            Arc::new(ErrorClassifier::new()),
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(EscalationEngine::new()),
        )
    }

    /// Manager over caller-owned components
    pub fn with_components(
        classifier: Arc<ErrorClassifier>,
        breakers: Arc<CircuitBreakerRegistry>,
        escalation: Arc<EscalationEngine>,
    ) -> Self {
        Self {
            retry_engine: RetryEngine::new(classifier.clone(), breakers),
            classifier,
            escalation,
        }
    }

    /// The shared classifier
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// The retry engine
    pub fn retry_engine(&self) -> &RetryEngine {
        &self.retry_engine
    }

    /// The escalation engine
    pub fn escalation(&self) -> &Arc<EscalationEngine> {
        &self.escalation
    }

    /// Run an operation through the whole pipeline. On retry exhaustion the
    /// terminal cause is classified and handed to the escalation engine,
    /// then the enriched error is propagated to the caller either way.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        operation: F,
        options: RetryOptions,
        environment: DeployEnvironment,
    ) -> Result<T>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let operation_type = options.operation_type.clone();
        let operation_name = options.resolved_name().to_string();

        match self.retry_engine.execute_with_retry(operation, options).await {
            Ok(value) => Ok(value),
            Err(error) => {
                if let ResilienceError::RetryExhausted { total_attempts, .. } = &error {
                    let retries_spent = total_attempts.saturating_sub(1);
                    let cause = error.root_cause();

                    let classification = self
                        .classifier
                        .classify(
                            cause,
                            &ClassificationContext::new()
                                .with_operation_type(operation_type.clone())
                                .with_operation_name(operation_name.clone())
                                .with_environment(environment)
                                .with_prior_retries(retries_spent),
                        )
                        .await;

                    let result = self
                        .escalation
                        .evaluate_escalation(
                            cause,
                            &classification,
                            &EscalationContext::for_operation(operation_name.clone())
                                .with_operation_type(operation_type)
                                .with_environment(environment)
                                .with_retry_attempt(retries_spent),
                        )
                        .await;

                    debug!(
                        operation = %operation_name,
                        escalated = result.escalated,
                        level = %result.level,
                        "post-exhaustion escalation evaluated"
                    );
                }
                Err(error)
            }
        }
    }

    /// Aggregated statistics snapshot
    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            retry: self.retry_engine.stats().await,
            breakers: self.retry_engine.breakers().all_stats().await,
            escalation: self.escalation.stats().await,
            classifier_cache: self.classifier.cache_stats().await,
        }
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new()
    }
}
