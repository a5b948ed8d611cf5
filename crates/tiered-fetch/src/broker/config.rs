//! Broker limits per subscription plan, with environment overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Provisioning-service plan; selects a fixed set of broker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Starter,
    Team,
    Enterprise,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Team => "team",
            Plan::Enterprise => "enterprise",
        }
    }

    /// The limits table.
    pub fn limits(self) -> BrokerConfig {
        let (max_concurrent, max_session_secs, monthly_unit_quota, queue_capacity, connect_secs) =
            match self {
                Plan::Free => (1, 60, 1_000, 5, 30),
                Plan::Starter => (3, 300, 10_000, 20, 30),
                Plan::Team => (10, 600, 50_000, 50, 60),
                Plan::Enterprise => (50, 1_800, 500_000, 200, 60),
            };
        BrokerConfig {
            plan: self,
            max_concurrent,
            max_session_duration_ms: max_session_secs * 1000,
            monthly_unit_quota,
            queue_capacity,
            connection_timeout_ms: connect_secs * 1000,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "starter" => Ok(Plan::Starter),
            "team" => Ok(Plan::Team),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

/// Limits enforced by the resource broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub plan: Plan,
    /// Sessions allowed to run at once.
    pub max_concurrent: usize,
    /// Sessions are force-released after this long.
    pub max_session_duration_ms: u64,
    /// Cost units available per calendar month.
    pub monthly_unit_quota: u64,
    /// Waiters allowed in the FIFO queue.
    pub queue_capacity: usize,
    /// How long a queued acquire waits for a slot.
    pub connection_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Plan::Free.limits()
    }
}

impl BrokerConfig {
    pub fn for_plan(plan: Plan) -> Self {
        plan.limits()
    }

    /// Plan from `TIERED_FETCH_PLAN` (default free), then per-field overrides.
    pub fn from_env() -> Self {
        let plan = read_env_string("TIERED_FETCH_PLAN")
            .and_then(|p| match p.parse::<Plan>() {
                Ok(plan) => Some(plan),
                Err(e) => {
                    tracing::warn!("{e}, falling back to the free plan");
                    None
                }
            })
            .unwrap_or(Plan::Free);
        let defaults = plan.limits();

        Self {
            plan,
            max_concurrent: read_env_usize("TIERED_FETCH_MAX_CONCURRENT", defaults.max_concurrent)
                .max(1),
            max_session_duration_ms: read_env_u64(
                "TIERED_FETCH_MAX_SESSION_MS",
                defaults.max_session_duration_ms,
            )
            .max(1),
            monthly_unit_quota: read_env_u64(
                "TIERED_FETCH_MONTHLY_UNITS",
                defaults.monthly_unit_quota,
            ),
            queue_capacity: read_env_usize("TIERED_FETCH_QUEUE_CAPACITY", defaults.queue_capacity),
            connection_timeout_ms: read_env_u64(
                "TIERED_FETCH_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout_ms,
            ),
        }
    }

    pub fn max_session_duration(&self) -> Duration {
        Duration::from_millis(self.max_session_duration_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
