//! Notification channels and per-channel rate limiting
//!
//! A channel is an addressable sink (chat, pager, ticketing, log) able to
//! deliver an escalation message. Each registered channel may carry a rate
//! limit, enforced with a fixed-capacity sliding window of send timestamps
//! so the check stays O(1) regardless of traffic.

use crate::classifier::{ErrorKind, Severity};
use crate::error::Result;
use crate::escalation::rules::EscalationLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::warn;

/// Message handed to a channel's `send`
#[derive(Debug, Clone, Serialize)]
pub struct EscalationMessage {
    /// Name of the rule that escalated
    pub rule: String,
    /// Resulting escalation level
    pub level: EscalationLevel,
    /// Operation identity the failure belongs to
    pub operation: String,
    /// Sanitized error summary
    pub error_summary: String,
    /// Classified failure kind
    pub kind: ErrorKind,
    /// Classified severity
    pub severity: Severity,
    /// Caller-supplied metadata, passed through untouched
    pub metadata: HashMap<String, Value>,
}

/// An addressable notification sink
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name used in rule channel lists
    fn name(&self) -> &str;

    /// Deliver one escalation message
    async fn send(&self, message: &EscalationMessage) -> Result<()>;
}

/// Per-channel delivery rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRateLimit {
    /// Notifications allowed per window
    pub max_per_window: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Fixed-capacity sliding window over send timestamps. Holds at most
/// `max` entries; expired entries are dropped lazily on each check.
#[derive(Debug)]
pub(crate) struct SlidingWindowCounter {
    timestamps: VecDeque<Instant>,
    max: u32,
    window: Duration,
}

impl SlidingWindowCounter {
    pub(crate) fn new(limit: &ChannelRateLimit) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(limit.max_per_window as usize),
            max: limit.max_per_window,
            window: limit.window,
        }
    }

    /// Try to consume one send slot at `now`
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        while self
            .timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            self.timestamps.pop_front();
        }

        if self.timestamps.len() < self.max as usize {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Built-in channel that emits escalations through `tracing`
pub struct TracingChannel {
    name: String,
}

impl TracingChannel {
    /// Create a tracing-backed channel with the given name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl Default for TracingChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait::async_trait]
impl NotificationChannel for TracingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &EscalationMessage) -> Result<()> {
        warn!(
            rule = %message.rule,
            level = %message.level,
            operation = %message.operation,
            kind = %message.kind,
            severity = %message.severity,
            "escalation: {}",
            message.error_summary
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max_per_window: u32, window_ms: u64) -> ChannelRateLimit {
        ChannelRateLimit {
            max_per_window,
            window: Duration::from_millis(window_ms),
        }
    }

    #[test]
    fn test_window_allows_up_to_limit() {
        let mut counter = SlidingWindowCounter::new(&limit(2, 1000));
        let now = Instant::now();

        assert!(counter.try_acquire(now));
        assert!(counter.try_acquire(now));
        assert!(!counter.try_acquire(now));
    }

    #[test]
    fn test_window_slides() {
        let mut counter = SlidingWindowCounter::new(&limit(1, 50));
        let start = Instant::now();

        assert!(counter.try_acquire(start));
        assert!(!counter.try_acquire(start + Duration::from_millis(10)));
        // The first send has aged out of the window
        assert!(counter.try_acquire(start + Duration::from_millis(60)));
    }

    #[test]
    fn test_window_capacity_stays_bounded() {
        let mut counter = SlidingWindowCounter::new(&limit(3, 1000));
        let now = Instant::now();
        for _ in 0..100 {
            counter.try_acquire(now);
        }
        assert!(counter.timestamps.len() <= 3);
    }
}
