//! Error types for the resilience pipeline
//!
//! This module provides the error surface shared by the classifier, the
//! retry engine and the escalation engine, including the two engine-level
//! wrapper flavors ("circuit open" and "retry exhausted") that callers must
//! be able to distinguish from an operation's own failures.

use crate::recovery::CircuitState;
use thiserror::Error;

/// Result type alias for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Error types produced and consumed by the resilience pipeline
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Network errors (connection refused, reset, DNS failures)
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Upstream API errors
    #[error("API error: {0}")]
    Api(String),

    /// Input or schema validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication and authorization errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource exhaustion (memory, disk, quota)
    #[error("Resource exhausted: {0}")]
    Resource(String),

    /// Missing or broken dependency errors
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Environment errors (missing variables, bad paths, platform issues)
    #[error("Environment error: {0}")]
    Environment(String),

    /// Syntax errors in generated code or configuration
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// Logic errors requiring human judgment
    #[error("Logic error: {0}")]
    Logic(String),

    /// Rejected by an open circuit breaker before the operation ran
    #[error("Circuit breaker open for operation type '{operation_type}' ({state:?})")]
    CircuitOpen {
        /// Operation-type key of the rejecting breaker
        operation_type: String,
        /// Breaker state at rejection time
        state: CircuitState,
        /// Time remaining until the breaker will allow a trial call
        retry_after: Option<chrono::Duration>,
    },

    /// All eligible retries were consumed without success
    #[error("Retry budget exhausted for '{operation_name}' after {total_attempts} attempts")]
    RetryExhausted {
        /// Human-readable operation identity
        operation_name: String,
        /// Total invocations of the operation (initial attempt included)
        total_attempts: u32,
        /// Retry budget the caller configured
        max_retries: u32,
        /// The last underlying failure
        #[source]
        source: Box<ResilienceError>,
    },

    /// The caller's deadline or cancellation signal fired mid-retry
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl ResilienceError {
    /// Create a network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an API error
    pub fn api<S: Into<String>>(msg: S) -> Self {
        Self::Api(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a resource exhaustion error
    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Self::Resource(msg.into())
    }

    /// Create a dependency error
    pub fn dependency<S: Into<String>>(msg: S) -> Self {
        Self::Dependency(msg.into())
    }

    /// Create an environment error
    pub fn environment<S: Into<String>>(msg: S) -> Self {
        Self::Environment(msg.into())
    }

    /// Create a syntax error
    pub fn syntax<S: Into<String>>(msg: S) -> Self {
        Self::Syntax(msg.into())
    }

    /// Create a logic error
    pub fn logic<S: Into<String>>(msg: S) -> Self {
        Self::Logic(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Whether this error was produced by an open circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this error wraps an exhausted retry loop
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Whether this error reports caller-driven cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The innermost operation error, unwrapping retry-exhaustion wrappers
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            Self::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
