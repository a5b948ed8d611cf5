//! Monthly cost-unit accounting.
//!
//! One cost unit is 30 seconds of browser session time, partial periods
//! rounded up. The period rolls over at 00:00 UTC on the first of each
//! month; rollover is detected lazily by `roll_over`.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session time covered by one cost unit.
pub const UNIT_DURATION_MS: u64 = 30_000;

/// Minimum estimate checked against the quota before a session starts.
pub const MIN_UNIT_ESTIMATE: u64 = 1;

/// Cost of a session that ran for `elapsed`.
pub fn units_for(elapsed: Duration) -> u64 {
    let ms = elapsed.as_millis() as u64;
    ms.div_ceil(UNIT_DURATION_MS)
}

/// Start of the calendar month after `now`, in UTC.
pub fn next_period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Persistable view of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub units_used: u64,
    pub quota_reset_at: DateTime<Utc>,
    pub total_requests: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub forced_releases: u64,
}

/// Usage counters for the current billing period.
#[derive(Debug, Clone)]
pub struct UsageLedger {
    units_used: u64,
    quota_reset_at: DateTime<Utc>,
    total_requests: u64,
    timed_out: u64,
    rejected: u64,
    forced_releases: u64,
}

impl UsageLedger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            units_used: 0,
            quota_reset_at: next_period_start(now),
            total_requests: 0,
            timed_out: 0,
            rejected: 0,
            forced_releases: 0,
        }
    }

    /// Reset every counter if `now` has reached the period boundary.
    /// Returns whether a rollover happened.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.quota_reset_at {
            return false;
        }
        tracing::info!(
            "usage period rolled over at {}: {} units used last period",
            self.quota_reset_at,
            self.units_used
        );
        *self = Self::new(now);
        true
    }

    pub fn units_used(&self) -> u64 {
        self.units_used
    }

    pub fn units_remaining(&self, quota: u64) -> u64 {
        quota.saturating_sub(self.units_used)
    }

    /// Whether a session estimated at `MIN_UNIT_ESTIMATE` still fits.
    pub fn has_capacity(&self, quota: u64) -> bool {
        self.units_remaining(quota) >= MIN_UNIT_ESTIMATE
    }

    pub fn quota_reset_at(&self) -> DateTime<Utc> {
        self.quota_reset_at
    }

    pub fn charge(&mut self, units: u64) {
        self.units_used = self.units_used.saturating_add(units);
    }

    pub fn note_request(&mut self) {
        self.total_requests += 1;
    }

    pub fn note_timeout(&mut self) {
        self.timed_out += 1;
    }

    pub fn note_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn note_forced_release(&mut self) {
        self.forced_releases += 1;
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            units_used: self.units_used,
            quota_reset_at: self.quota_reset_at,
            total_requests: self.total_requests,
            timed_out: self.timed_out,
            rejected: self.rejected,
            forced_releases: self.forced_releases,
        }
    }

    pub fn restore(snapshot: &UsageSnapshot) -> Self {
        Self {
            units_used: snapshot.units_used,
            quota_reset_at: snapshot.quota_reset_at,
            total_requests: snapshot.total_requests,
            timed_out: snapshot.timed_out,
            rejected: snapshot.rejected,
            forced_releases: snapshot.forced_releases,
        }
    }
}
