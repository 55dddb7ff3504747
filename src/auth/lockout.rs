//! Progressive lockout
//!
//! Failures are counted across PIN and biometric attempts alike. Crossing a
//! tier threshold starts a cool-down; each tier is longer than the last and
//! the counter only resets on a successful authentication.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Longest cool-down a tier may impose (7 days)
pub const MAX_COOLDOWN_SECS: u64 = 7 * 24 * 60 * 60;

/// One escalation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutTier {
    /// Consecutive failures that trigger this tier
    pub threshold: u32,
    /// Cool-down length in seconds
    pub cooldown_secs: u64,
}

/// Lockout escalation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicy {
    pub tiers: Vec<LockoutTier>,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                LockoutTier { threshold: 3, cooldown_secs: 30 },
                LockoutTier { threshold: 5, cooldown_secs: 300 },
                LockoutTier { threshold: 8, cooldown_secs: 1800 },
            ],
        }
    }
}

impl LockoutPolicy {
    /// Thresholds strictly increase; cool-downs never shrink
    pub fn validate(&self) -> VaultResult<()> {
        if self.tiers.is_empty() {
            return Err(VaultError::InvalidConfig("lockout policy needs at least one tier".into()));
        }
        if self.tiers[0].threshold == 0 {
            return Err(VaultError::InvalidConfig("lockout threshold must be positive".into()));
        }
        if self.tiers.iter().any(|t| t.cooldown_secs > MAX_COOLDOWN_SECS) {
            return Err(VaultError::InvalidConfig(format!(
                "lockout cool-down must not exceed {} seconds",
                MAX_COOLDOWN_SECS
            )));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].threshold <= pair[0].threshold || pair[1].cooldown_secs < pair[0].cooldown_secs {
                return Err(VaultError::InvalidConfig(
                    "lockout tiers must escalate monotonically".into(),
                ));
            }
        }
        Ok(())
    }

    /// Tier `index`, clamped to the last (longest) tier
    fn tier(&self, index: u8) -> LockoutTier {
        let last = self.tiers.len().saturating_sub(1);
        self.tiers[(index as usize).min(last)]
    }

    fn past_last_tier(&self, index: u8) -> bool {
        index as usize >= self.tiers.len()
    }
}

/// Outcome of one recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// More attempts allowed before the next cool-down
    Continue { remaining: u32 },
    /// A cool-down started
    LockedOut { until: DateTime<Utc>, tier: u8 },
}

/// Persisted lockout counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutState {
    pub consecutive_failures: u32,
    pub lockout_expiry: Option<DateTime<Utc>>,
    /// Number of cool-downs entered since the last success
    pub tier: u8,
}

impl LockoutState {
    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lockout_expiry, Some(until) if now < until)
    }

    /// Seconds until the current cool-down ends, rounded up
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        match self.lockout_expiry {
            Some(until) if now < until => {
                let millis = (until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            }
            _ => 0,
        }
    }

    /// Error to return while the cool-down is active
    pub fn locked_error(&self, now: DateTime<Utc>) -> VaultError {
        VaultError::LockedOut {
            retry_after_secs: self.retry_after_secs(now),
            tier: self.tier,
        }
    }

    /// Attempts left before the next cool-down
    pub fn remaining_attempts(&self, policy: &LockoutPolicy) -> u32 {
        if policy.past_last_tier(self.tier) {
            return 1;
        }
        policy
            .tier(self.tier)
            .threshold
            .saturating_sub(self.consecutive_failures)
    }

    /// Count a failed attempt. Callers must reject attempts during a
    /// cool-down before calling this, so the counter never moves while locked.
    pub fn record_failure(&mut self, policy: &LockoutPolicy, now: DateTime<Utc>) -> FailureOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let exhausted = policy.past_last_tier(self.tier);
        let current = policy.tier(self.tier);

        if exhausted || self.consecutive_failures >= current.threshold {
            let until = now + Duration::seconds(current.cooldown_secs.min(MAX_COOLDOWN_SECS) as i64);
            self.lockout_expiry = Some(until);
            self.tier = self.tier.saturating_add(1);

            log::warn!(
                "Lockout tier {} after {} consecutive failures (until {})",
                self.tier,
                self.consecutive_failures,
                until
            );
            return FailureOutcome::LockedOut { until, tier: self.tier };
        }

        FailureOutcome::Continue {
            remaining: current.threshold - self.consecutive_failures,
        }
    }

    pub fn record_success(&mut self) {
        *self = Self::default();
    }

    /// Drop an expired cool-down; counters are kept
    pub fn clear_expired(&mut self, now: DateTime<Utc>) {
        if matches!(self.lockout_expiry, Some(until) if now >= until) {
            self.lockout_expiry = None;
        }
    }
}
