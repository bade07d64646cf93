//! Failure taxonomy and static per-kind policy defaults
//!
//! The taxonomy is a closed set: every failure maps to exactly one
//! [`ErrorKind`], with `Unknown` as the mandatory fallback. The policy
//! lookup is an exhaustive match so adding a kind without a policy entry is
//! a compile-time error.

use serde::{Deserialize, Serialize};

/// Failure kinds recognized by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Malformed code or configuration
    Syntax,
    /// Missing or conflicting dependencies
    Dependency,
    /// Host environment problems (permissions, paths, variables)
    Environment,
    /// Logic errors requiring human judgment
    Logic,
    /// Transport-level network failures
    Network,
    /// Upstream API failures
    Api,
    /// Input or schema validation failures
    Validation,
    /// Resource exhaustion (memory, disk, quota)
    Resource,
    /// Authentication and authorization failures
    Authentication,
    /// Anything that matched no signal
    Unknown,
}

impl ErrorKind {
    /// All kinds in taxonomy order (also the pattern-set tie-break order)
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Syntax,
        ErrorKind::Dependency,
        ErrorKind::Environment,
        ErrorKind::Logic,
        ErrorKind::Network,
        ErrorKind::Api,
        ErrorKind::Validation,
        ErrorKind::Resource,
        ErrorKind::Authentication,
        ErrorKind::Unknown,
    ];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Environment => "environment",
            ErrorKind::Logic => "logic",
            ErrorKind::Network => "network",
            ErrorKind::Api => "api",
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered severity of a classified failure
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic or recoverable without intervention
    Low,
    /// Default severity for ordinary failures
    #[default]
    Medium,
    /// Degrades the platform, needs attention soon
    High,
    /// Requires immediate attention
    Critical,
}

impl Severity {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment environment reported by the calling context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployEnvironment {
    /// Local or CI development
    #[default]
    Development,
    /// Pre-production staging
    Staging,
    /// Production
    Production,
}

/// Static policy defaults attached to each failure kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KindPolicy {
    /// Severity before context refinement
    pub default_severity: Severity,
    /// Whether the retry engine may retry this kind at all
    pub retryable: bool,
    /// Suggested retry budget
    pub max_retries: u32,
    /// Additional delay scaling applied by the retry engine
    pub backoff_multiplier: f64,
    /// Occurrences before escalation is advisable
    pub escalation_threshold: u32,
    /// Advisory resolution approach, not binding for callers
    pub strategy: &'static str,
}

/// Policy lookup for a kind. Exhaustive by construction.
pub fn policy_for(kind: ErrorKind) -> KindPolicy {
    match kind {
        ErrorKind::Syntax => KindPolicy {
            default_severity: Severity::High,
            retryable: false,
            max_retries: 0,
            backoff_multiplier: 1.0,
            escalation_threshold: 1,
            strategy: "auto-fix",
        },
        ErrorKind::Dependency => KindPolicy {
            default_severity: Severity::Medium,
            retryable: true,
            max_retries: 2,
            backoff_multiplier: 1.5,
            escalation_threshold: 3,
            strategy: "retry-with-backoff",
        },
        ErrorKind::Environment => KindPolicy {
            default_severity: Severity::High,
            retryable: true,
            max_retries: 1,
            backoff_multiplier: 1.0,
            escalation_threshold: 2,
            strategy: "escalate",
        },
        ErrorKind::Logic => KindPolicy {
            default_severity: Severity::High,
            retryable: false,
            max_retries: 0,
            backoff_multiplier: 1.0,
            escalation_threshold: 1,
            strategy: "escalate",
        },
        ErrorKind::Network => KindPolicy {
            default_severity: Severity::Medium,
            retryable: true,
            max_retries: 3,
            backoff_multiplier: 2.0,
            escalation_threshold: 5,
            strategy: "retry-with-backoff",
        },
        ErrorKind::Api => KindPolicy {
            default_severity: Severity::Medium,
            retryable: true,
            max_retries: 3,
            backoff_multiplier: 2.0,
            escalation_threshold: 4,
            strategy: "retry-with-backoff",
        },
        ErrorKind::Validation => KindPolicy {
            default_severity: Severity::Low,
            retryable: false,
            max_retries: 0,
            backoff_multiplier: 1.0,
            escalation_threshold: 3,
            strategy: "manual-review",
        },
        ErrorKind::Resource => KindPolicy {
            default_severity: Severity::Critical,
            retryable: true,
            max_retries: 2,
            backoff_multiplier: 3.0,
            escalation_threshold: 2,
            strategy: "throttle-and-retry",
        },
        ErrorKind::Authentication => KindPolicy {
            default_severity: Severity::Critical,
            retryable: false,
            max_retries: 0,
            backoff_multiplier: 1.0,
            escalation_threshold: 1,
            strategy: "escalate",
        },
        ErrorKind::Unknown => KindPolicy {
            default_severity: Severity::Medium,
            retryable: true,
            max_retries: 1,
            backoff_multiplier: 1.5,
            escalation_threshold: 3,
            strategy: "retry-with-backoff",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_every_kind_has_a_policy() {
        for kind in ErrorKind::ALL {
            let policy = policy_for(kind);
            assert!(policy.backoff_multiplier >= 1.0, "{kind}");
            if !policy.retryable {
                assert_eq!(policy.max_retries, 0, "{kind}");
            }
        }
    }

    #[test]
    fn test_non_retryable_kinds() {
        for kind in [
            ErrorKind::Syntax,
            ErrorKind::Logic,
            ErrorKind::Validation,
            ErrorKind::Authentication,
        ] {
            assert!(!policy_for(kind).retryable, "{kind}");
        }
    }
}
