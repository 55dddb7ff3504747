//! ALFA Docs Vault - Master Key Rotation Schedule
//!
//! Each master key version lives in one epoch. The key manager opens a new
//! epoch on every committed rotation; the schedule only tracks when the
//! next one is due and keeps a short history of closed epochs.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// When to rotate and what to keep afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    pub interval_days: u32,
    /// Start reporting `due_soon` this many days ahead
    pub warn_before_days: u32,
    /// Old master keys kept in the store after a rotation
    pub retain_previous: u8,
    /// Closed epochs kept in the history
    pub history_len: u8,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval_days: 90,
            warn_before_days: 7,
            retain_previous: 1,
            history_len: 3,
        }
    }
}

impl RotationPolicy {
    fn interval(&self) -> Duration {
        Duration::days(self.interval_days as i64)
    }
}

/// A closed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterEpoch {
    pub epoch: u64,
    pub master_version: u32,
    pub began: DateTime<Utc>,
    pub ended: DateTime<Utc>,
}

/// Persistable rotation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub epoch: u64,
    pub master_version: u32,
    pub began: DateTime<Utc>,
    pub due: DateTime<Utc>,
    pub policy: RotationPolicy,
    pub history: VecDeque<MasterEpoch>,
}

impl RotationSchedule {
    /// First epoch for `master_version`, starting `now`
    pub fn new(policy: RotationPolicy, master_version: u32, now: DateTime<Utc>) -> Self {
        Self {
            epoch: 1,
            master_version,
            began: now,
            due: now + policy.interval(),
            policy,
            history: VecDeque::new(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.due
    }

    pub fn in_warning_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.due - Duration::days(self.policy.warn_before_days as i64)
    }

    /// Whole days until the rotation is due; negative once overdue
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.due - now).num_days()
    }

    /// Close the current epoch and open the next one. Returns the new epoch.
    pub fn advance(&mut self, new_master_version: u32, now: DateTime<Utc>) -> u64 {
        self.history.push_back(MasterEpoch {
            epoch: self.epoch,
            master_version: self.master_version,
            began: self.began,
            ended: now,
        });
        while self.history.len() > self.policy.history_len as usize {
            self.history.pop_front();
        }

        self.epoch += 1;
        self.master_version = new_master_version;
        self.began = now;
        self.due = now + self.policy.interval();
        self.epoch
    }

    pub fn status(&self, now: DateTime<Utc>) -> RotationStatus {
        RotationStatus {
            epoch: self.epoch,
            master_version: self.master_version,
            rotated_at: self.began,
            due: self.due,
            days_remaining: self.days_remaining(now),
            overdue: self.is_due(now),
            due_soon: self.in_warning_window(now),
        }
    }
}

/// Snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub epoch: u64,
    pub master_version: u32,
    pub rotated_at: DateTime<Utc>,
    pub due: DateTime<Utc>,
    pub days_remaining: i64,
    pub overdue: bool,
    pub due_soon: bool,
}
