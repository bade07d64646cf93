//! Escalation levels, rules and the built-in default rule set

use crate::classifier::{Classification, DeployEnvironment, ErrorKind, Severity};
use crate::error::{ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::EscalationContext;

/// Escalation targets, ordered by urgency
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    /// No escalation
    #[default]
    None,
    /// Automated remediation only
    Automated,
    /// Monitoring systems, no humans paged
    Monitoring,
    /// Support rotation
    Support,
    /// Engineering on-call
    Engineering,
    /// Immediate human attention
    Critical,
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EscalationLevel::None => "none",
            EscalationLevel::Automated => "automated",
            EscalationLevel::Monitoring => "monitoring",
            EscalationLevel::Support => "support",
            EscalationLevel::Engineering => "engineering",
            EscalationLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Rule predicate over the failure, its classification and the calling
/// context. A condition returning `Err` is skipped with a warning and
/// evaluation continues with the remaining rules.
pub type RuleCondition =
    Arc<dyn Fn(&ResilienceError, &Classification, &EscalationContext) -> Result<bool> + Send + Sync>;

/// Named condition-to-action mapping
#[derive(Clone)]
pub struct EscalationRule {
    /// Unique rule name (also half of the cooldown key)
    pub name: String,
    /// Lower sorts first when multiple rules match
    pub priority: u32,
    /// Level assigned when this rule is primary
    pub level: EscalationLevel,
    /// Notification channels, dispatched in order
    pub channels: Vec<String>,
    /// Suppression window per (rule, operation) key
    pub cooldown: Duration,
    /// Matching predicate
    pub condition: RuleCondition,
}

impl std::fmt::Debug for EscalationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("level", &self.level)
            .field("channels", &self.channels)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl EscalationRule {
    /// Create a rule with the given identity and predicate
    pub fn new<S: Into<String>>(
        name: S,
        priority: u32,
        level: EscalationLevel,
        channels: Vec<String>,
        cooldown: Duration,
        condition: RuleCondition,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            level,
            channels,
            cooldown,
            condition,
        }
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The built-in rule set. Callers replace or augment these explicitly via
/// the engine's registration methods; nothing deletes them silently.
pub fn default_rules() -> Vec<EscalationRule> {
    vec![
        EscalationRule::new(
            "critical-failure",
            10,
            EscalationLevel::Critical,
            strings(&["pager", "chat", "log"]),
            Duration::from_secs(120),
            Arc::new(|_error, classification, _context| {
                Ok(classification.severity == Severity::Critical
                    || matches!(
                        classification.kind,
                        ErrorKind::Authentication | ErrorKind::Resource
                    ))
            }),
        ),
        EscalationRule::new(
            "sustained-failure-frequency",
            20,
            EscalationLevel::Engineering,
            strings(&["chat", "log"]),
            Duration::from_secs(600),
            Arc::new(|_error, _classification, context| {
                Ok(context.recent_kind_occurrences > 10)
            }),
        ),
        EscalationRule::new(
            "retries-exhausted",
            30,
            EscalationLevel::Support,
            strings(&["chat", "log"]),
            Duration::from_secs(300),
            Arc::new(|_error, classification, context| {
                Ok(context
                    .retry_attempt
                    .is_some_and(|attempt| attempt >= classification.max_retries))
            }),
        ),
        EscalationRule::new(
            "logic-error",
            40,
            EscalationLevel::Engineering,
            strings(&["chat", "log"]),
            Duration::from_secs(600),
            Arc::new(|_error, classification, _context| {
                Ok(classification.kind == ErrorKind::Logic)
            }),
        ),
        EscalationRule::new(
            "uncertain-classification",
            50,
            EscalationLevel::Monitoring,
            strings(&["log"]),
            Duration::from_secs(900),
            Arc::new(|_error, classification, _context| {
                Ok(classification.kind == ErrorKind::Unknown && classification.confidence < 0.5)
            }),
        ),
        EscalationRule::new(
            "production-failure",
            60,
            EscalationLevel::Support,
            strings(&["chat", "log"]),
            Duration::from_secs(300),
            Arc::new(|_error, classification, context| {
                Ok(context.environment == DeployEnvironment::Production
                    && classification.severity > Severity::Low)
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(EscalationLevel::None < EscalationLevel::Automated);
        assert!(EscalationLevel::Monitoring < EscalationLevel::Support);
        assert!(EscalationLevel::Engineering < EscalationLevel::Critical);
    }

    #[test]
    fn test_default_rules_are_priority_sorted_and_unique() {
        let rules = default_rules();
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), rules.len());

        let priorities: Vec<u32> = rules.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable();
        assert_eq!(priorities, sorted);
    }
}
