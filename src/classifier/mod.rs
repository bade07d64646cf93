//! Confidence-scored error classification
//!
//! The classifier turns a failure plus its calling context into a
//! [`Classification`]: a kind from the closed taxonomy, a refined severity,
//! a confidence score and the policy defaults for that kind. It fuses
//! independent signals with a fixed precedence and memoizes the
//! message-derived portion, since classification runs on every failure
//! including tight retry loops.
//!
//! Classification never fails: any input degrades to `unknown` / `medium`
//! rather than producing a new error on an error path.

pub mod patterns;
pub mod policy;

pub use policy::{policy_for, DeployEnvironment, ErrorKind, KindPolicy, Severity};

use crate::error::ResilienceError;
use patterns::{kind_for_platform_code, kind_for_status, pattern_sets, KindPatterns};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Confidence assigned to an HTTP status mapping
const STATUS_CONFIDENCE: f64 = 0.95;
/// Confidence assigned to a platform error-code mapping
const PLATFORM_CODE_CONFIDENCE: f64 = 0.93;
/// Base confidence for a single matched message pattern
const PATTERN_BASE_CONFIDENCE: f64 = 0.6;
/// Confidence added per additional distinct pattern matched
const PATTERN_STEP: f64 = 0.15;
/// Upper bound for pattern-derived confidence
const PATTERN_CAP: f64 = 0.95;
/// Confidence assigned to a caller-supplied kind hint
const HINT_CONFIDENCE: f64 = 0.5;
/// Confidence when no signal fired
const UNKNOWN_CONFIDENCE: f64 = 0.1;

/// Structured verdict for one failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    /// Failure kind from the closed taxonomy
    pub kind: ErrorKind,
    /// Severity after context refinement
    pub severity: Severity,
    /// Combined signal confidence in [0, 1]
    pub confidence: f64,
    /// Advisory resolution approach (not binding for the retry engine)
    pub strategy: &'static str,
    /// Suggested retry budget from the kind's policy
    pub max_retries: u32,
    /// Delay scaling from the kind's policy
    pub backoff_multiplier: f64,
    /// Occurrences before escalation is advisable
    pub escalation_threshold: u32,
    /// Human-readable evidence, in evaluation order. Audit only.
    pub matched_signals: Vec<String>,
}

/// Caller-supplied context for one classification
#[derive(Debug, Clone, Default)]
pub struct ClassificationContext {
    /// Operation-type scoping key, when known
    pub operation_type: Option<String>,
    /// Human-readable operation identity
    pub operation_name: Option<String>,
    /// HTTP status observed by the caller, if any
    pub status_code: Option<u16>,
    /// Explicit platform error code (e.g. "ECONNREFUSED"), if the caller has one
    pub error_code: Option<String>,
    /// Explicit kind hint from the caller
    pub kind_hint: Option<ErrorKind>,
    /// Deployment environment of the failing call
    pub environment: DeployEnvironment,
    /// Whether the call is marked production-critical
    pub production_critical: bool,
    /// Retries already spent on this logical operation
    pub prior_retries: u32,
}

impl ClassificationContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation-type scoping key
    pub fn with_operation_type<S: Into<String>>(mut self, operation_type: S) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    /// Set the operation name
    pub fn with_operation_name<S: Into<String>>(mut self, operation_name: S) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }

    /// Set the observed HTTP status
    pub fn with_status_code(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Set an explicit platform error code
    pub fn with_error_code<S: Into<String>>(mut self, code: S) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Set an explicit kind hint
    pub fn with_kind_hint(mut self, hint: ErrorKind) -> Self {
        self.kind_hint = Some(hint);
        self
    }

    /// Set the deployment environment
    pub fn with_environment(mut self, environment: DeployEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Mark the call production-critical
    pub fn with_production_critical(mut self, critical: bool) -> Self {
        self.production_critical = critical;
        self
    }

    /// Record retries already spent on this logical operation
    pub fn with_prior_retries(mut self, retries: u32) -> Self {
        self.prior_retries = retries;
        self
    }
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Enable the memoization cache
    pub cache_enabled: bool,
    /// Cache entries kept before the cache is cleared wholesale
    pub max_cache_entries: usize,
    /// Message prefix length used in the memoization key
    pub message_key_length: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            max_cache_entries: 2048,
            message_key_length: 160,
        }
    }
}

/// Memoization cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that recomputed the fusion
    pub misses: u64,
    /// Entries currently cached
    pub entries: usize,
}

/// Memoization key: truncated message + error code + status code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    message_prefix: String,
    error_code: Option<String>,
    status_code: Option<u16>,
}

impl CacheKey {
    fn new(message: &str, context: &ClassificationContext, prefix_len: usize) -> Self {
        let message_prefix = match message.char_indices().nth(prefix_len) {
            Some((idx, _)) => message[..idx].to_string(),
            None => message.to_string(),
        };
        Self {
            message_prefix,
            error_code: context.error_code.clone(),
            status_code: context.status_code,
        }
    }
}

/// Message-derived fusion outcome. Only this part is cacheable: the kind
/// hint and severity refinement depend on context fields outside the key.
#[derive(Debug, Clone)]
struct FusedSignal {
    kind: ErrorKind,
    confidence: f64,
    matched_signals: Vec<String>,
}

struct CacheState {
    map: HashMap<CacheKey, FusedSignal>,
    hits: u64,
    misses: u64,
}

/// Signal-fusing error classifier with a shared memoization cache
pub struct ErrorClassifier {
    config: ClassifierConfig,
    pattern_sets: &'static [KindPatterns],
    cache: Arc<RwLock<CacheState>>,
}

impl ErrorClassifier {
    /// Create a classifier with default configuration
    pub fn new() -> Self {
        Self::with_config(ClassifierConfig::default())
    }

    /// Create a classifier with custom configuration
    pub fn with_config(config: ClassifierConfig) -> Self {
        Self {
            config,
            pattern_sets: pattern_sets(),
            cache: Arc::new(RwLock::new(CacheState {
                map: HashMap::new(),
                hits: 0,
                misses: 0,
            })),
        }
    }

    /// Classify a failure. Pure with respect to (error, context) and the
    /// static policy table; repeated calls return identical classifications.
    pub async fn classify(
        &self,
        error: &ResilienceError,
        context: &ClassificationContext,
    ) -> Classification {
        let message = error.to_string();
        let fused = self.fused_signal(&message, context).await;

        // Context hint is the last signal; it overrides only on strictly
        // greater confidence.
        let mut kind = fused.kind;
        let mut confidence = fused.confidence;
        let mut matched_signals = fused.matched_signals;
        if let Some(hint) = context.kind_hint {
            if HINT_CONFIDENCE > confidence {
                kind = hint;
                confidence = HINT_CONFIDENCE;
                matched_signals.push(format!("context hint: {hint}"));
            }
        }

        let policy = policy_for(kind);
        let severity = refine_severity(policy.default_severity, confidence, context);

        Classification {
            kind,
            severity,
            confidence,
            strategy: policy.strategy,
            max_retries: policy.max_retries,
            backoff_multiplier: policy.backoff_multiplier,
            escalation_threshold: policy.escalation_threshold,
            matched_signals,
        }
    }

    /// Memoization cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        CacheStats {
            hits: cache.hits,
            misses: cache.misses,
            entries: cache.map.len(),
        }
    }

    /// Drop all cached fusion results. Never changes decision outcomes,
    /// only repeats the classification work.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.map.clear();
    }

    async fn fused_signal(&self, message: &str, context: &ClassificationContext) -> FusedSignal {
        if !self.config.cache_enabled {
            return self.fuse_signals(message, context);
        }

        let key = CacheKey::new(message, context, self.config.message_key_length);
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.map.get(&key).cloned() {
                cache.hits += 1;
                return cached;
            }
            cache.misses += 1;
        }

        let fused = self.fuse_signals(message, context);

        let mut cache = self.cache.write().await;
        if cache.map.len() >= self.config.max_cache_entries {
            debug!(
                entries = cache.map.len(),
                "classification cache full, clearing"
            );
            cache.map.clear();
        }
        cache.map.insert(key, fused.clone());
        fused
    }

    /// Evaluate the message-derived signal sources in fixed precedence,
    /// keeping the highest-confidence result. Ties keep the earlier signal.
    fn fuse_signals(&self, message: &str, context: &ClassificationContext) -> FusedSignal {
        let mut best: Option<(ErrorKind, f64)> = None;
        let mut matched_signals = Vec::new();

        // 1. Transport/HTTP status mapping
        if let Some(status) = context.status_code {
            if let Some(kind) = kind_for_status(status) {
                matched_signals.push(format!("http status {status} -> {kind}"));
                best = Some((kind, STATUS_CONFIDENCE));
            }
        }

        // 2. Platform error-code mapping
        if let Some((kind, code)) = kind_for_platform_code(message, context.error_code.as_deref())
        {
            matched_signals.push(format!("platform code {code} -> {kind}"));
            if best.map_or(true, |(_, confidence)| PLATFORM_CODE_CONFIDENCE > confidence) {
                best = Some((kind, PLATFORM_CODE_CONFIDENCE));
            }
        }

        // 3. Pattern sets: most distinct patterns matched wins, capped
        let mut pattern_best: Option<(ErrorKind, f64, Vec<String>)> = None;
        for set in self.pattern_sets {
            let matched: Vec<String> = set
                .patterns
                .iter()
                .filter(|regex| regex.is_match(message))
                .map(|regex| format!("pattern '{}' -> {}", regex.as_str(), set.kind))
                .collect();
            if matched.is_empty() {
                continue;
            }
            let confidence = (PATTERN_BASE_CONFIDENCE
                + PATTERN_STEP * (matched.len() as f64 - 1.0))
                .min(PATTERN_CAP);
            if pattern_best
                .as_ref()
                .map_or(true, |(_, best_confidence, _)| confidence > *best_confidence)
            {
                pattern_best = Some((set.kind, confidence, matched));
            }
        }
        if let Some((kind, confidence, evidence)) = pattern_best {
            matched_signals.extend(evidence);
            if best.map_or(true, |(_, best_confidence)| confidence > best_confidence) {
                best = Some((kind, confidence));
            }
        }

        match best {
            Some((kind, confidence)) => FusedSignal {
                kind,
                confidence,
                matched_signals,
            },
            None => FusedSignal {
                kind: ErrorKind::Unknown,
                confidence: UNKNOWN_CONFIDENCE,
                matched_signals,
            },
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Context-based severity refinement. The confidence downgrade is applied
/// last: an uncertain classification can never claim extreme severity, even
/// for production-critical calls.
fn refine_severity(base: Severity, confidence: f64, context: &ClassificationContext) -> Severity {
    let mut severity = base;
    if context.production_critical {
        severity = Severity::Critical;
    }
    if context.prior_retries > 5 && severity < Severity::High {
        severity = Severity::High;
    }
    if confidence < 0.5 {
        severity = Severity::Medium;
    }
    severity
}
