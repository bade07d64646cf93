//! Error resilience pipeline for automation platforms
//!
//! This crate decides, for every failure in the surrounding platform, what
//! kind of failure it is, whether and how to retry it, when to stop
//! retrying and protect the system via circuit breaking, and when a human
//! or external channel must be notified.
//!
//! # Components
//!
//! - Confidence-scored error classification over a closed taxonomy
//! - Per-operation-type circuit breakers with lazy recovery
//! - Retry engine with exponential/linear/fixed/immediate backoff and jitter
//! - Rule-driven escalation with cooldowns and rate-limited channels
//!
//! The three components form one pipeline: classify, retry-or-not, and on
//! exhaustion escalate-or-not. [`recovery::ResilienceManager`] wires them
//! together for callers that want the whole flow in one call.

// Core modules
pub mod classifier;
pub mod error;
pub mod escalation;
pub mod recovery;

// Re-export main types for convenience
pub use classifier::{
    Classification, ClassificationContext, DeployEnvironment, ErrorClassifier, ErrorKind, Severity,
};
pub use error::{ResilienceError, Result};
pub use escalation::{
    EscalationContext, EscalationEngine, EscalationLevel, EscalationResult, EscalationRule,
    NotificationChannel,
};
pub use recovery::{
    BackoffStrategy, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ResilienceManager,
    RetryEngine, RetryOptions,
};
