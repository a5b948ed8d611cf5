//! Per-domain learned tier preferences.
//!
//! The store is an explicit state object shared by the controller. It never
//! deletes entries; pruning and persistence belong to whoever holds the
//! `export_preferences` / `import_preferences` snapshots.

pub mod learning;

pub use learning::{apply_outcome, LearningOutcome};

use crate::tier::RenderTier;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Successes required before a learned preference overrides heuristics.
pub const MIN_SUCCESSES_FOR_PREFERENCE: u64 = 3;

/// What has been learned about one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainPreference {
    pub domain: String,
    pub preferred_tier: RenderTier,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used_at: DateTime<Utc>,
    pub avg_response_time_ms: f64,
}

impl DomainPreference {
    /// Whether there is enough history to start at `preferred_tier`.
    pub fn is_trusted(&self) -> bool {
        self.success_count >= MIN_SUCCESSES_FOR_PREFERENCE
    }

    /// Successes over all recorded outcomes since the last reset.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// Domain → preference map.
#[derive(Debug, Default)]
pub struct DomainPreferenceStore {
    entries: DashMap<String, DomainPreference>,
}

impl DomainPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<DomainPreference> {
        self.entries.get(domain).map(|e| e.value().clone())
    }

    /// The learned starting tier, if the domain's history is trusted.
    pub fn preferred_tier(&self, domain: &str) -> Option<RenderTier> {
        self.entries
            .get(domain)
            .filter(|e| e.is_trusted())
            .map(|e| e.preferred_tier)
    }

    /// Apply an outcome atomically and return the stored result.
    pub fn record(&self, domain: &str, outcome: LearningOutcome) -> DomainPreference {
        let now = Utc::now();
        let updated = match self.entries.entry(domain.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = apply_outcome(domain, Some(entry.get()), outcome, now);
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => {
                let next = apply_outcome(domain, None, outcome, now);
                entry.insert(next.clone());
                next
            }
        };

        tracing::debug!(
            "domain {domain}: preferred={} successes={} failures={}",
            updated.preferred_tier,
            updated.success_count,
            updated.failure_count
        );
        updated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every preference, sorted by domain.
    pub fn export_preferences(&self) -> Vec<DomainPreference> {
        let mut all: Vec<DomainPreference> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    /// Load a snapshot, replacing existing entries for the same domains.
    pub fn import_preferences(&self, preferences: impl IntoIterator<Item = DomainPreference>) -> usize {
        let mut imported = 0;
        for pref in preferences {
            self.entries.insert(pref.domain.clone(), pref);
            imported += 1;
        }
        tracing::info!("imported {imported} domain preference(s)");
        imported
    }
}
