//! End-to-end tests for the classify -> retry -> escalate pipeline

use resilience_core::classifier::ClassificationContext;
use resilience_core::escalation::{
    ChannelRateLimit, EscalationContext, EscalationEngine, EscalationLevel, EscalationMessage,
    NotificationChannel,
};
use resilience_core::recovery::{CircuitBreakerRegistry, ResilienceManager, RetryEngine};
use resilience_core::{
    DeployEnvironment, ErrorClassifier, ErrorKind, ResilienceError, Result, RetryOptions,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use tokio_test::assert_ok;

struct CountingChannel {
    name: String,
    sent: AtomicU32,
}

impl CountingChannel {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: AtomicU32::new(0),
        })
    }
}

#[async_trait::async_trait]
impl NotificationChannel for CountingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _message: &EscalationMessage) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The full payment-api scenario: a connection-refused failure classified
/// as network with high confidence, retried with exponential backoff until
/// the budget is spent, then escalated at support level.
#[tokio::test]
async fn test_payment_api_end_to_end() {
    let classifier = Arc::new(ErrorClassifier::new());
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let retry_engine = RetryEngine::new(classifier.clone(), breakers);
    let escalation = EscalationEngine::new();

    let error = ResilienceError::network("Connection refused: ECONNREFUSED");
    let classification = classifier
        .classify(
            &error,
            &ClassificationContext::new().with_operation_type("payment-api"),
        )
        .await;

    assert_eq!(classification.kind, ErrorKind::Network);
    assert!(classification.confidence >= 0.9);
    assert_eq!(classification.max_retries, 3);

    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let result: Result<()> = retry_engine
        .execute_with_retry(
            move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ResilienceError::network("Connection refused: ECONNREFUSED"))
                }
            },
            RetryOptions::for_operation_type("payment-api")
                .with_max_retries(3)
                .with_base_delay(Duration::milliseconds(5))
                .with_jitter(false),
        )
        .await;

    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    let error = result.unwrap_err();
    let (total_attempts, cause_summary) = match &error {
        ResilienceError::RetryExhausted {
            operation_name,
            total_attempts,
            max_retries,
            source,
        } => {
            assert_eq!(operation_name, "payment-api");
            assert_eq!(*max_retries, 3);
            (*total_attempts, source.to_string())
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    };
    assert_eq!(total_attempts, 4);
    assert!(cause_summary.contains("ECONNREFUSED"));

    let escalation_result = escalation
        .evaluate_escalation(
            error.root_cause(),
            &classification,
            &EscalationContext::for_operation("payment-api").with_retry_attempt(3),
        )
        .await;

    assert!(escalation_result.escalated);
    assert_eq!(escalation_result.level, EscalationLevel::Support);
    assert_eq!(escalation_result.rule.as_deref(), Some("retries-exhausted"));
}

/// The manager facade runs the same flow in one call and records it in the
/// aggregated stats.
#[tokio::test]
async fn test_manager_runs_full_pipeline() {
    let manager = ResilienceManager::new();
    let chat = CountingChannel::new("chat");
    manager.escalation().register_channel(chat.clone(), None).await;

    let result: Result<()> = manager
        .execute_with_recovery(
            |_ctx| async { Err(ResilienceError::network("Connection refused: ECONNREFUSED")) },
            RetryOptions::for_operation_type("payment-api")
                .with_max_retries(3)
                .with_base_delay(Duration::milliseconds(5))
                .with_jitter(false),
            DeployEnvironment::Production,
        )
        .await;

    assert!(result.unwrap_err().is_retry_exhausted());
    assert_eq!(chat.sent.load(Ordering::SeqCst), 1);

    let stats = manager.stats().await;
    assert_eq!(stats.retry.total_operations, 1);
    assert_eq!(stats.retry.failed_after_retries, 1);
    assert_eq!(stats.escalation.escalations, 1);
    assert!(stats.breakers.contains_key("payment-api"));
}

/// Classification work done by the retry loop is shared with direct
/// classifier users through the memoization cache.
#[tokio::test]
async fn test_classifier_cache_is_shared_across_pipeline() {
    let manager = ResilienceManager::new();

    let _: Result<()> = manager
        .execute_with_recovery(
            |_ctx| async { Err(ResilienceError::network("Connection refused: ECONNREFUSED")) },
            RetryOptions::for_operation_type("sync")
                .with_max_retries(2)
                .with_base_delay(Duration::milliseconds(5))
                .with_jitter(false),
            DeployEnvironment::Development,
        )
        .await;

    let stats = manager.stats().await;
    // Three in-loop classifications plus the post-exhaustion one; only the
    // first misses.
    assert_eq!(stats.classifier_cache.misses, 1);
    assert!(stats.classifier_cache.hits >= 3);
}

/// A breaker opened by one caller protects every caller sharing the
/// operation type, and the rejection is distinguishable from the
/// operation's own errors.
#[tokio::test]
async fn test_operation_type_shares_breaker_fate() {
    let classifier = Arc::new(ErrorClassifier::new());
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let engine = RetryEngine::new(classifier, breakers);

    let options = RetryOptions::for_operation_type("webhook-dispatch")
        .with_max_retries(5)
        .with_base_delay(Duration::milliseconds(2))
        .with_jitter(false);

    let _: Result<()> = engine
        .execute_with_retry(
            |_ctx| async { Err(ResilienceError::network("connection reset by peer")) },
            options.clone(),
        )
        .await;

    let untouched = Arc::new(AtomicU32::new(0));
    let counter = untouched.clone();
    let rejected: Result<()> = engine
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

    let error = rejected.unwrap_err();
    assert!(error.is_circuit_open());
    assert!(!error.is_retry_exhausted());
    assert_eq!(untouched.load(Ordering::SeqCst), 0);

    // The first caller was also rejected once its own failures opened the
    // breaker mid-loop.
    let stats = engine.stats().await;
    assert_eq!(stats.circuit_rejections, 2);
}

/// Concurrent failures for one operation type serialize on that breaker's
/// own lock: the breaker opens exactly once, with no double-counted
/// transition, and other callers are rejected fast.
#[tokio::test]
async fn test_concurrent_failures_open_breaker_exactly_once() {
    let engine = Arc::new(RetryEngine::new(
        Arc::new(ErrorClassifier::new()),
        Arc::new(CircuitBreakerRegistry::default()),
    ));

    let invocations = Arc::new(AtomicU32::new(0));
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            let counter = invocations.clone();
            tokio::spawn(async move {
                let _: Result<()> = engine
                    .execute_with_retry(
                        move |_ctx| {
                            let counter = counter.clone();
                            async move {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Err(ResilienceError::network("connection reset by peer"))
                            }
                        },
                        RetryOptions::for_operation_type("bulk-import").with_max_retries(0),
                    )
                    .await;
            })
        })
        .collect();
    futures::future::join_all(tasks).await;

    let stats = engine.breakers().all_stats().await;
    let breaker_stats = &stats["bulk-import"];
    assert_eq!(breaker_stats.open_count, 1);

    let invoked = invocations.load(Ordering::SeqCst);
    assert!((5..=20).contains(&invoked), "invoked {invoked} times");

    // A manual reset re-admits traffic immediately
    engine.breakers().breaker("bulk-import").await.reset().await;
    assert_ok!(
        engine
            .breakers()
            .breaker("bulk-import")
            .await
            .check_permission()
            .await
    );
}

/// Two identical failures inside one cooldown window produce exactly one
/// dispatched escalation; a rate-limited channel is skipped while others
/// deliver.
#[tokio::test]
async fn test_storm_suppression_end_to_end() {
    let escalation = EscalationEngine::new();
    let chat = CountingChannel::new("chat");
    let pager = CountingChannel::new("pager");
    escalation
        .register_channel(
            chat.clone(),
            Some(ChannelRateLimit {
                max_per_window: 1,
                window: StdDuration::from_secs(3600),
            }),
        )
        .await;
    escalation.register_channel(pager.clone(), None).await;

    let classifier = ErrorClassifier::new();
    let error = ResilienceError::authentication("invalid credentials for deploy key");
    let classification = classifier
        .classify(&error, &ClassificationContext::new())
        .await;

    // Same rule and operation: second evaluation suppressed by cooldown
    let context = EscalationContext::for_operation("deploy");
    let first = escalation
        .evaluate_escalation(&error, &classification, &context)
        .await;
    let second = escalation
        .evaluate_escalation(&error, &classification, &context)
        .await;

    assert!(first.escalated);
    assert!(!second.escalated);
    assert_eq!(chat.sent.load(Ordering::SeqCst), 1);
    assert_eq!(pager.sent.load(Ordering::SeqCst), 1);

    // Different operation escapes the cooldown but hits chat's rate limit;
    // the pager is unaffected
    let third = escalation
        .evaluate_escalation(
            &error,
            &classification,
            &EscalationContext::for_operation("rollback"),
        )
        .await;

    assert!(third.escalated);
    let chat_outcome = third.outcomes.iter().find(|o| o.channel == "chat").unwrap();
    assert!(!chat_outcome.success);
    assert_eq!(chat_outcome.error.as_deref(), Some("rate limit exceeded"));
    assert_eq!(pager.sent.load(Ordering::SeqCst), 2);
}
