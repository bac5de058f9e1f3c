//! Per-sender admission control
//!
//! Sliding window plus optional cooldown. Timestamp lists are process-local
//! and never persisted; a restart forgets all rate-limit history.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::HubConfig;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Message may proceed
    Allowed,
    /// Message must be rejected, with a human-readable reason
    Rejected(String),
}

impl RateDecision {
    /// True for [`RateDecision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Sliding-window + cooldown rate limiter keyed by sender agent id.
pub struct RateLimiter {
    enabled: bool,
    max_messages: usize,
    window: Duration,
    cooldown: Duration,
    sent: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    /// Build a limiter from the daemon config.
    pub fn new(config: &HubConfig) -> Self {
        Self::with_limits(
            config.rate_limit_enabled,
            config.rate_limit_max,
            config.rate_limit_window,
            config.rate_limit_cooldown,
        )
    }

    /// Build a limiter with explicit limits.
    pub fn with_limits(
        enabled: bool,
        max_messages: usize,
        window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            enabled,
            max_messages,
            window,
            cooldown,
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether `sender` may send now. Prunes expired timestamps as a
    /// side effect. Does not record the send; call [`RateLimiter::record`]
    /// after the message is accepted.
    pub fn check(&self, sender: &str) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed;
        }

        let now = Instant::now();
        let mut sent = self.sent.lock();
        let times = sent.entry(sender.to_string()).or_default();

        if !self.cooldown.is_zero()
            && let Some(last) = times.last()
        {
            let elapsed = now.duration_since(*last);
            if elapsed < self.cooldown {
                let remaining = (self.cooldown - elapsed).as_secs();
                return RateDecision::Rejected(format!(
                    "Cooldown: wait {remaining}s before sending again"
                ));
            }
        }

        times.retain(|t| now.duration_since(*t) < self.window);

        if times.len() >= self.max_messages {
            return RateDecision::Rejected(format!(
                "Rate limit: max {} messages per {}s",
                self.max_messages,
                self.window.as_secs()
            ));
        }

        RateDecision::Allowed
    }

    /// Record an accepted send. Must be called exactly once per accepted
    /// message, after a successful check. No-op while disabled.
    pub fn record(&self, sender: &str) {
        if !self.enabled {
            return;
        }
        self.sent
            .lock()
            .entry(sender.to_string())
            .or_default()
            .push(Instant::now());
    }
}
