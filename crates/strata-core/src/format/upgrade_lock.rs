use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::chrono_duration;
use crate::error::{Result, StrataError};
use crate::util::duration_secs;

/// A client's declared intent to take the repository offline for an index
/// format upgrade. Stored inside the format blob so every client sees it
/// on its next format refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeLockIntent {
    pub owner_id: String,
    pub creation_time: DateTime<Utc>,
    /// Zero means the lock takes effect immediately.
    #[serde(with = "duration_secs")]
    pub advance_notice: Duration,
    /// Upper bound on how long another client may keep writing with a stale
    /// format cache.
    #[serde(with = "duration_secs")]
    pub io_drain_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub status_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_permitted_clock_drift: Duration,
    #[serde(default)]
    pub message: String,
}

impl UpgradeLockIntent {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StrataError::Config(format!("upgrade lock: {msg}")));
        if self.owner_id.trim().is_empty() {
            return invalid("owner id is required");
        }
        if self.io_drain_timeout.is_zero() {
            return invalid("io drain timeout must be positive");
        }
        if self.status_poll_interval.is_zero() || self.status_poll_interval > self.io_drain_timeout
        {
            return invalid("status poll interval must be positive and not exceed the drain timeout");
        }
        if self.max_permitted_clock_drift.is_zero() {
            return invalid("max permitted clock drift must be positive");
        }
        if !self.advance_notice.is_zero() && self.advance_notice < self.total_drain_interval() {
            return invalid("advance notice must cover the total drain interval");
        }
        Ok(())
    }

    /// Time every writer is guaranteed to have seen the lock, allowing for
    /// clock drift on both sides.
    pub fn total_drain_interval(&self) -> Duration {
        self.max_permitted_clock_drift + self.io_drain_timeout * 2
    }

    /// When the upgrade may begin.
    pub fn upgrade_time(&self) -> DateTime<Utc> {
        let wait = if self.advance_notice.is_zero() {
            self.total_drain_interval()
        } else {
            self.advance_notice
        };
        self.creation_time + chrono_duration(wait)
    }

    /// `(locked, writers_drained)` at `now`. The lock engages one drain
    /// interval before the upgrade time, and writers count as drained from
    /// the upgrade time on.
    pub fn is_locked(&self, now: DateTime<Utc>) -> (bool, bool) {
        let upgrade_time = self.upgrade_time();
        let locked_from = upgrade_time - chrono_duration(self.total_drain_interval());
        (now >= locked_from, now >= upgrade_time)
    }

    /// Same owner and timing parameters; creation time and message are
    /// not compared so a retried request is recognised.
    pub fn same_intent(&self, other: &UpgradeLockIntent) -> bool {
        self.owner_id == other.owner_id
            && self.advance_notice == other.advance_notice
            && self.io_drain_timeout == other.io_drain_timeout
            && self.status_poll_interval == other.status_poll_interval
            && self.max_permitted_clock_drift == other.max_permitted_clock_drift
    }
}
