//! Learning policy as a pure reducer over `DomainPreference`.
//!
//! Two independent rules move a domain's preferred tier:
//! - on success at a different tier, switch only when the current
//!   preference fails more than half as often as it succeeds;
//! - on total failure, escalate one tier once failures exceed two.

use super::DomainPreference;
use crate::tier::RenderTier;
use chrono::{DateTime, Utc};

/// Failures at the final tier before the preference escalates.
pub const ESCALATION_FAILURE_THRESHOLD: u64 = 2;

/// What a finished fetch teaches about a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningOutcome {
    /// A tier produced an accepted page.
    Success { tier: RenderTier, latency_ms: u64 },
    /// Every tier failed. `start` is where the cascade began, `last` the
    /// final tier attempted.
    Failure { start: RenderTier, last: RenderTier },
}

/// Fold one outcome into a domain's preference.
pub fn apply_outcome(
    domain: &str,
    prior: Option<&DomainPreference>,
    outcome: LearningOutcome,
    now: DateTime<Utc>,
) -> DomainPreference {
    match outcome {
        LearningOutcome::Success { tier, latency_ms } => {
            apply_success(domain, prior, tier, latency_ms, now)
        }
        LearningOutcome::Failure { start, last } => apply_failure(domain, prior, start, last, now),
    }
}

fn apply_success(
    domain: &str,
    prior: Option<&DomainPreference>,
    tier: RenderTier,
    latency_ms: u64,
    now: DateTime<Utc>,
) -> DomainPreference {
    let Some(prior) = prior else {
        return DomainPreference {
            domain: domain.to_string(),
            preferred_tier: tier,
            success_count: 1,
            failure_count: 0,
            last_used_at: now,
            avg_response_time_ms: latency_ms as f64,
        };
    };

    let mut next = prior.clone();
    next.last_used_at = now;
    next.success_count += 1;
    next.avg_response_time_ms +=
        (latency_ms as f64 - next.avg_response_time_ms) / next.success_count as f64;

    if next.preferred_tier != tier && next.failure_count as f64 > next.success_count as f64 / 2.0
    {
        tracing::info!(
            "domain {domain}: preferred tier {} -> {tier} (failures {} > successes {}/2)",
            next.preferred_tier,
            next.failure_count,
            next.success_count
        );
        next.preferred_tier = tier;
        next.success_count = 1;
        next.failure_count = 0;
    }
    next
}

fn apply_failure(
    domain: &str,
    prior: Option<&DomainPreference>,
    start: RenderTier,
    last: RenderTier,
    now: DateTime<Utc>,
) -> DomainPreference {
    let mut next = prior.cloned().unwrap_or_else(|| DomainPreference {
        domain: domain.to_string(),
        preferred_tier: start,
        success_count: 0,
        failure_count: 0,
        last_used_at: now,
        avg_response_time_ms: 0.0,
    });
    next.last_used_at = now;
    next.failure_count += 1;

    if next.failure_count > ESCALATION_FAILURE_THRESHOLD {
        if let Some(escalated) = last.next() {
            tracing::info!(
                "domain {domain}: escalating preferred tier {} -> {escalated} after {} failures at {last}",
                next.preferred_tier,
                next.failure_count
            );
            next.preferred_tier = escalated;
            next.success_count = 0;
            next.failure_count = 0;
        }
    }
    next
}
