//! Tier executor abstraction.
//!
//! Defines the `TierExecutor` trait that concrete renderers implement (plain
//! HTTP, lightweight JS VM, full browser). The cascade controller only sees
//! this trait and is agnostic to how rendering happens.

use crate::tier::RenderTier;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A page produced by a tier executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedPage {
    /// Raw (or rendered) HTML.
    pub html: String,
    /// Main text extracted from the page.
    pub extracted_text: String,
    /// The final URL after any redirects.
    pub final_url: String,
}

/// Per-attempt parameters handed to an executor.
#[derive(Debug, Clone)]
pub struct TierRequest {
    /// Tier being attempted.
    pub tier: RenderTier,
    /// Budget the controller enforces around `execute`.
    pub timeout: Duration,
    /// Broker session id when the tier holds a brokered slot.
    pub session_id: Option<String>,
}

/// Renders a URL at one tier.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    /// Fetch and render `url`. Any error counts as a failure of this tier.
    async fn execute(&self, url: &str, request: &TierRequest) -> Result<RenderedPage>;
}

/// Executors keyed by tier.
#[derive(Clone, Default)]
pub struct TierExecutors {
    executors: HashMap<RenderTier, Arc<dyn TierExecutor>>,
}

impl TierExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a tier.
    pub fn with(mut self, tier: RenderTier, executor: Arc<dyn TierExecutor>) -> Self {
        self.executors.insert(tier, executor);
        self
    }

    pub fn insert(&mut self, tier: RenderTier, executor: Arc<dyn TierExecutor>) {
        self.executors.insert(tier, executor);
    }

    pub fn get(&self, tier: RenderTier) -> Option<&Arc<dyn TierExecutor>> {
        self.executors.get(&tier)
    }

    /// Registered tiers, cheapest first.
    pub fn tiers(&self) -> Vec<RenderTier> {
        let mut tiers: Vec<RenderTier> = self.executors.keys().copied().collect();
        tiers.sort();
        tiers
    }
}
