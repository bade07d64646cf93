//! Rule-driven escalation with cooldowns and rate-limited notification
//!
//! Consulted after retry exhaustion, or immediately for rule-matched
//! conditions. Evaluation never fails: "no rule matched" and "suppressed by
//! cooldown" are ordinary results, and a rule whose condition errors is
//! skipped while the remaining rules are still evaluated.

pub mod notification;
pub mod rules;

pub use notification::{
    ChannelRateLimit, EscalationMessage, NotificationChannel, TracingChannel,
};
pub use rules::{default_rules, EscalationLevel, EscalationRule, RuleCondition};

use crate::classifier::{Classification, DeployEnvironment, ErrorKind};
use crate::error::ResilienceError;
use chrono::{DateTime, Utc};
use notification::SlidingWindowCounter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest error summary stored in records and messages
const MAX_SUMMARY_LEN: usize = 300;

/// Caller context for one escalation evaluation
#[derive(Debug, Clone, Default)]
pub struct EscalationContext {
    /// Operation identity; half of the cooldown key
    pub operation: String,
    /// Operation-type scoping key, when known
    pub operation_type: Option<String>,
    /// Deployment environment of the failing call
    pub environment: DeployEnvironment,
    /// Retries spent before this evaluation, when it follows a retry loop
    pub retry_attempt: Option<u32>,
    /// Same-kind occurrences within the frequency window. Filled in by the
    /// engine before rules are evaluated.
    pub recent_kind_occurrences: u32,
    /// Opaque caller metadata forwarded to channels
    pub metadata: HashMap<String, Value>,
}

impl EscalationContext {
    /// Context for an operation identity
    pub fn for_operation<S: Into<String>>(operation: S) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Set the operation-type key
    pub fn with_operation_type<S: Into<String>>(mut self, operation_type: S) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    /// Set the deployment environment
    pub fn with_environment(mut self, environment: DeployEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Record the retries spent before this evaluation
    pub fn with_retry_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = Some(attempt);
        self
    }

    /// Attach caller metadata
    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Why an evaluation with a matching rule did not escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    /// The (rule, operation) cooldown window is still active
    CooldownPeriod,
}

/// Per-channel dispatch outcome
#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    /// Channel name
    pub channel: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Failure detail when delivery did not happen
    pub error: Option<String>,
}

/// Result of one escalation evaluation
#[derive(Debug, Clone, Serialize)]
pub struct EscalationResult {
    /// Whether notifications were dispatched
    pub escalated: bool,
    /// Level of the primary rule, `None` when nothing matched
    pub level: EscalationLevel,
    /// Primary rule name, when one matched
    pub rule: Option<String>,
    /// Set when a matching rule was suppressed
    pub reason: Option<SuppressionReason>,
    /// Dispatch outcomes in channel order
    pub outcomes: Vec<ChannelOutcome>,
}

impl EscalationResult {
    fn no_match() -> Self {
        Self {
            escalated: false,
            level: EscalationLevel::None,
            rule: None,
            reason: None,
            outcomes: Vec::new(),
        }
    }
}

/// Append-only history entry, one per evaluation that selected a primary
/// rule
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRecord {
    /// Record id
    pub id: Uuid,
    /// Evaluation time
    pub timestamp: DateTime<Utc>,
    /// Sanitized error summary
    pub error_summary: String,
    /// Classification snapshot
    pub classification: Classification,
    /// Primary rule name
    pub rule: String,
    /// Resulting level
    pub level: EscalationLevel,
    /// Whether the cooldown suppressed dispatch
    pub suppressed: bool,
    /// Per-channel dispatch outcomes
    pub outcomes: Vec<ChannelOutcome>,
    /// True only if every attempted channel succeeded
    pub success: bool,
}

/// Aggregate escalation statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EscalationStats {
    /// Evaluations performed
    pub total_evaluations: u64,
    /// Evaluations that dispatched notifications
    pub escalations: u64,
    /// Evaluations suppressed by a cooldown
    pub suppressed_by_cooldown: u64,
    /// Evaluations matching no rule
    pub no_rule_matched: u64,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// History entries kept before the oldest is evicted
    pub max_history: usize,
    /// Window for the sustained-frequency occurrence count
    #[serde(with = "humantime_serde")]
    pub frequency_window: Duration,
    /// Per-kind occurrence timestamps retained
    pub frequency_retained: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            frequency_window: Duration::from_secs(300),
            frequency_retained: 64,
        }
    }
}

struct RegisteredChannel {
    channel: Arc<dyn NotificationChannel>,
    limiter: Option<SlidingWindowCounter>,
}

/// Rule evaluation and notification dispatch engine
pub struct EscalationEngine {
    config: EscalationConfig,
    rules: RwLock<Vec<EscalationRule>>,
    channels: RwLock<HashMap<String, RegisteredChannel>>,
    cooldowns: RwLock<HashMap<(String, String), Instant>>,
    occurrences: RwLock<HashMap<ErrorKind, VecDeque<Instant>>>,
    history: RwLock<VecDeque<EscalationRecord>>,
    stats: RwLock<EscalationStats>,
}

impl EscalationEngine {
    /// Engine with the default rule set and the built-in `log` channel
    pub fn new() -> Self {
        Self::with_config(EscalationConfig::default())
    }

    /// Engine with custom configuration, default rules and `log` channel
    pub fn with_config(config: EscalationConfig) -> Self {
        let mut channels = HashMap::new();
        let log = TracingChannel::default();
        channels.insert(
            log.name().to_string(),
            RegisteredChannel {
                channel: Arc::new(log),
                limiter: None,
            },
        );

        Self {
            config,
            rules: RwLock::new(default_rules()),
            channels: RwLock::new(channels),
            cooldowns: RwLock::new(HashMap::new()),
            occurrences: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(EscalationStats::default()),
        }
    }

    /// Register a rule, replacing any existing rule with the same name.
    /// Administrative path; not intended for hot failure paths.
    pub async fn register_rule(&self, rule: EscalationRule) {
        let mut rules = self.rules.write().await;
        rules.retain(|existing| existing.name != rule.name);
        info!(rule = %rule.name, priority = rule.priority, "registered escalation rule");
        rules.push(rule);
    }

    /// Replace the whole rule set explicitly
    pub async fn set_rules(&self, new_rules: Vec<EscalationRule>) {
        let mut rules = self.rules.write().await;
        info!(count = new_rules.len(), "replaced escalation rule set");
        *rules = new_rules;
    }

    /// Register a notification channel with an optional rate limit.
    /// Administrative path; not intended for hot failure paths.
    pub async fn register_channel(
        &self,
        channel: Arc<dyn NotificationChannel>,
        rate_limit: Option<ChannelRateLimit>,
    ) {
        let name = channel.name().to_string();
        let limiter = rate_limit.as_ref().map(SlidingWindowCounter::new);
        let mut channels = self.channels.write().await;
        info!(channel = %name, rate_limited = rate_limit.is_some(), "registered channel");
        channels.insert(name, RegisteredChannel { channel, limiter });
    }

    /// Evaluate the rule set for one failure and dispatch notifications for
    /// the primary matching rule, subject to cooldown and rate limits.
    pub async fn evaluate_escalation(
        &self,
        error: &ResilienceError,
        classification: &Classification,
        context: &EscalationContext,
    ) -> EscalationResult {
        {
            let mut stats = self.stats.write().await;
            stats.total_evaluations += 1;
        }

        let mut context = context.clone();
        context.recent_kind_occurrences = self.record_occurrence(classification.kind).await;

        let primary = {
            let rules = self.rules.read().await;
            let mut matching: Vec<&EscalationRule> = Vec::new();
            for rule in rules.iter() {
                match (rule.condition)(error, classification, &context) {
                    Ok(true) => matching.push(rule),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(rule = %rule.name, "rule condition failed, skipping: {e}");
                    }
                }
            }
            matching.sort_by_key(|rule| rule.priority);
            matching.first().map(|rule| (*rule).clone())
        };

        let Some(primary) = primary else {
            let mut stats = self.stats.write().await;
            stats.no_rule_matched += 1;
            debug!(operation = %context.operation, "no escalation rule matched");
            return EscalationResult::no_match();
        };

        let error_summary = sanitize_summary(&error.to_string());

        // Cooldown check and refresh are a single atomic step per key, so
        // two near-simultaneous failures cannot both slip through.
        let suppressed = {
            let key = (primary.name.clone(), context.operation.clone());
            let now = Instant::now();
            let mut cooldowns = self.cooldowns.write().await;
            match cooldowns.get(&key) {
                Some(expiry) if now < *expiry => true,
                _ => {
                    cooldowns.insert(key, now + primary.cooldown);
                    false
                }
            }
        };

        if suppressed {
            debug!(
                rule = %primary.name,
                operation = %context.operation,
                "escalation suppressed by cooldown"
            );
            let mut stats = self.stats.write().await;
            stats.suppressed_by_cooldown += 1;
            drop(stats);

            self.append_record(EscalationRecord {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                error_summary,
                classification: classification.clone(),
                rule: primary.name.clone(),
                level: primary.level,
                suppressed: true,
                outcomes: Vec::new(),
                success: false,
            })
            .await;

            return EscalationResult {
                escalated: false,
                level: primary.level,
                rule: Some(primary.name),
                reason: Some(SuppressionReason::CooldownPeriod),
                outcomes: Vec::new(),
            };
        }

        let message = EscalationMessage {
            rule: primary.name.clone(),
            level: primary.level,
            operation: context.operation.clone(),
            error_summary: error_summary.clone(),
            kind: classification.kind,
            severity: classification.severity,
            metadata: context.metadata.clone(),
        };

        let outcomes = self.dispatch(&primary, &message).await;
        let success = outcomes.iter().all(|outcome| outcome.success);

        info!(
            rule = %primary.name,
            level = %primary.level,
            operation = %context.operation,
            success,
            "escalated"
        );

        {
            let mut stats = self.stats.write().await;
            stats.escalations += 1;
        }

        self.append_record(EscalationRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            error_summary,
            classification: classification.clone(),
            rule: primary.name.clone(),
            level: primary.level,
            suppressed: false,
            outcomes: outcomes.clone(),
            success,
        })
        .await;

        EscalationResult {
            escalated: true,
            level: primary.level,
            rule: Some(primary.name),
            reason: None,
            outcomes,
        }
    }

    /// Escalation history, oldest first
    pub async fn history(&self) -> Vec<EscalationRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Aggregate statistics snapshot
    pub async fn stats(&self) -> EscalationStats {
        self.stats.read().await.clone()
    }

    /// Drop expired cooldown entries. Purely a memory-bounding
    /// optimization; correctness relies on lazy expiry at check time.
    pub async fn cleanup_cooldowns(&self) {
        let now = Instant::now();
        let mut cooldowns = self.cooldowns.write().await;
        cooldowns.retain(|_, expiry| *expiry > now);
    }

    /// Dispatch to the rule's channels in order. Rate-limited or missing
    /// channels are reported, never block the remaining channels.
    async fn dispatch(
        &self,
        rule: &EscalationRule,
        message: &EscalationMessage,
    ) -> Vec<ChannelOutcome> {
        let mut outcomes = Vec::with_capacity(rule.channels.len());

        for channel_name in &rule.channels {
            let target = {
                let mut channels = self.channels.write().await;
                match channels.get_mut(channel_name) {
                    None => {
                        warn!(channel = %channel_name, "channel not registered");
                        outcomes.push(ChannelOutcome {
                            channel: channel_name.clone(),
                            success: false,
                            error: Some("channel not registered".to_string()),
                        });
                        continue;
                    }
                    Some(registered) => {
                        let allowed = registered
                            .limiter
                            .as_mut()
                            .map_or(true, |limiter| limiter.try_acquire(Instant::now()));
                        if !allowed {
                            warn!(channel = %channel_name, "rate limit exceeded");
                            outcomes.push(ChannelOutcome {
                                channel: channel_name.clone(),
                                success: false,
                                error: Some("rate limit exceeded".to_string()),
                            });
                            continue;
                        }
                        registered.channel.clone()
                    }
                }
            };

            // Lock released before the potentially slow send
            let outcome = match target.send(message).await {
                Ok(()) => ChannelOutcome {
                    channel: channel_name.clone(),
                    success: true,
                    error: None,
                },
                Err(e) => ChannelOutcome {
                    channel: channel_name.clone(),
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Record a kind occurrence and return the count within the frequency
    /// window
    async fn record_occurrence(&self, kind: ErrorKind) -> u32 {
        let now = Instant::now();
        let mut occurrences = self.occurrences.write().await;
        let timestamps = occurrences.entry(kind).or_default();

        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.config.frequency_window)
        {
            timestamps.pop_front();
        }

        timestamps.push_back(now);
        while timestamps.len() > self.config.frequency_retained {
            timestamps.pop_front();
        }

        timestamps.len() as u32
    }

    async fn append_record(&self, record: EscalationRecord) {
        let mut history = self.history.write().await;
        if history.len() >= self.config.max_history {
            history.pop_front();
        }
        history.push_back(record);
    }
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Trim an error message for storage and outbound messages
fn sanitize_summary(message: &str) -> String {
    match message.char_indices().nth(MAX_SUMMARY_LEN) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}
