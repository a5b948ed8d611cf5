//! Tier cascade controller: cheapest-first fetching with per-domain learning.
//!
//! For each URL the controller picks a starting tier, then walks the tiers
//! in increasing-cost order until one produces a page that passes
//! validation:
//!
//! 1. Start at `force_tier`, else a trusted learned preference, else a
//!    hostname heuristic, else `Static`.
//! 2. Attempt each tier from the start through the ceiling, strictly in
//!    order and one at a time. The full-browser tier first takes a slot
//!    from the resource broker.
//! 3. Executor errors, timeouts, broker refusals and validation rejections
//!    are all tier failures; the cascade just moves on.
//! 4. The outcome (success tier or total failure) is folded into the
//!    domain's preference.

use crate::broker::ResourceBroker;
use crate::error::{FetchError, FetchResult};
use crate::executor::{RenderedPage, TierExecutors, TierRequest};
use crate::heuristics::HostnameHeuristics;
use crate::preferences::{DomainPreference, DomainPreferenceStore, LearningOutcome};
use crate::tier::{self, RenderTier};
use crate::validation::{self, DEFAULT_MIN_CONTENT_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-call fetch options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Start at this tier regardless of history or heuristics.
    pub force_tier: Option<RenderTier>,
    /// Never attempt a tier costlier than this.
    pub max_tier: Option<RenderTier>,
    /// Minimum extracted-text length, inclusive.
    pub min_content_length: usize,
    /// Per-tier executor timeout; tier defaults apply when unset.
    pub tier_timeout_ms: Option<u64>,
    /// Record the outcome in the domain preference store.
    pub enable_learning: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            force_tier: None,
            max_tier: None,
            min_content_length: DEFAULT_MIN_CONTENT_LENGTH,
            tier_timeout_ms: None,
            enable_learning: true,
        }
    }
}

impl FetchOptions {
    fn timeout_for(&self, tier: RenderTier) -> Duration {
        self.tier_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| tier.default_timeout())
    }

    fn ceiling(&self) -> RenderTier {
        self.max_tier.unwrap_or(RenderTier::FullBrowser)
    }
}

/// How the starting tier was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StartReason {
    Forced,
    LearnedPreference,
    Heuristic(String),
    Default,
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartReason::Forced => f.write_str("forced by caller"),
            StartReason::LearnedPreference => f.write_str("learned domain preference"),
            StartReason::Heuristic(rule) => write!(f, "hostname heuristic ({rule})"),
            StartReason::Default => f.write_str("default cheapest-first"),
        }
    }
}

/// Provenance of one tier attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAttempt {
    pub tier: RenderTier,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
    pub final_url: Option<String>,
    pub duration_ms: u64,
}

/// A validated fetch result with full attempt provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub url: String,
    pub domain: String,
    pub final_url: String,
    pub final_tier: RenderTier,
    pub tiers_attempted: Vec<RenderTier>,
    pub fell_back: bool,
    /// One entry per attempted tier, with its timing.
    pub attempts: Vec<TierAttempt>,
    pub start_reason: StartReason,
    pub reason: String,
    pub html: String,
    pub extracted_text: String,
    pub total_ms: u64,
}

/// What `fetch` would do for a URL, without doing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadePlan {
    pub domain: String,
    pub start_tier: RenderTier,
    pub start_reason: StartReason,
    pub tiers: Vec<RenderTier>,
}

/// Lower-cased host of `url` without a leading `www.`.
pub fn domain_of(url: &str) -> FetchResult<String> {
    let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidUrl(format!("{url}: missing host")))?
        .to_ascii_lowercase();
    Ok(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

/// Orchestrates tier attempts for fetches.
pub struct TierCascadeController {
    executors: TierExecutors,
    preferences: Arc<DomainPreferenceStore>,
    broker: Option<ResourceBroker>,
    heuristics: HostnameHeuristics,
}

impl TierCascadeController {
    pub fn new(executors: TierExecutors, preferences: Arc<DomainPreferenceStore>) -> Self {
        Self {
            executors,
            preferences,
            broker: None,
            heuristics: HostnameHeuristics::default(),
        }
    }

    /// Gate the full-browser tier through `broker`.
    pub fn with_broker(mut self, broker: ResourceBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_heuristics(mut self, heuristics: HostnameHeuristics) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn preferences(&self) -> &Arc<DomainPreferenceStore> {
        &self.preferences
    }

    pub fn broker(&self) -> Option<&ResourceBroker> {
        self.broker.as_ref()
    }

    pub fn domain_preference(&self, domain: &str) -> Option<DomainPreference> {
        self.preferences.get(domain)
    }

    /// Preview the cascade for `url`.
    pub fn plan(&self, url: &str, options: &FetchOptions) -> FetchResult<CascadePlan> {
        let domain = domain_of(url)?;
        Ok(self.plan_for_domain(domain, options))
    }

    fn plan_for_domain(&self, domain: String, options: &FetchOptions) -> CascadePlan {
        let (start, start_reason) = self.start_tier(&domain, options);
        let tiers = tier::cascade(start, options.ceiling());
        CascadePlan {
            start_tier: tiers[0],
            domain,
            start_reason,
            tiers,
        }
    }

    fn start_tier(&self, domain: &str, options: &FetchOptions) -> (RenderTier, StartReason) {
        if let Some(forced) = options.force_tier {
            return (forced, StartReason::Forced);
        }
        if let Some(preferred) = self.preferences.preferred_tier(domain) {
            return (preferred, StartReason::LearnedPreference);
        }
        if let Some(m) = self.heuristics.classify(domain) {
            return (m.tier, StartReason::Heuristic(m.rule));
        }
        (RenderTier::Static, StartReason::Default)
    }

    /// Fetch `url`, escalating through tiers until a page validates.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> FetchResult<FetchOutcome> {
        let started = Instant::now();
        let plan = self.plan(url, options)?;
        tracing::debug!(
            "fetch {url}: start={} ({}) cascade={:?}",
            plan.start_tier,
            plan.start_reason,
            plan.tiers
        );

        let mut attempts: Vec<TierAttempt> = Vec::with_capacity(plan.tiers.len());
        for &tier in &plan.tiers {
            let (attempt, page) = self.attempt(tier, url, options).await;
            attempts.push(attempt);

            let Some(page) = page else {
                continue;
            };

            let total_ms = started.elapsed().as_millis() as u64;
            if options.enable_learning {
                self.preferences.record(
                    &plan.domain,
                    LearningOutcome::Success {
                        tier,
                        latency_ms: total_ms,
                    },
                );
            }

            let tiers_attempted: Vec<RenderTier> = attempts.iter().map(|a| a.tier).collect();
            let fell_back = tiers_attempted.len() > 1;
            if fell_back {
                tracing::info!(
                    "fetch {url}: succeeded at {tier} after falling back from {}",
                    plan.start_tier
                );
            }
            return Ok(FetchOutcome {
                url: url.to_string(),
                reason: plan.start_reason.to_string(),
                domain: plan.domain,
                final_url: page.final_url,
                final_tier: tier,
                tiers_attempted,
                fell_back,
                attempts,
                start_reason: plan.start_reason,
                html: page.html,
                extracted_text: page.extracted_text,
                total_ms,
            });
        }

        let last = attempts.last();
        let last_tier = last.map(|a| a.tier).unwrap_or(plan.start_tier);
        let message = last
            .and_then(|a| a.failure_reason.clone())
            .unwrap_or_else(|| "no tier attempted".to_string());

        if options.enable_learning {
            self.preferences.record(
                &plan.domain,
                LearningOutcome::Failure {
                    start: plan.start_tier,
                    last: last_tier,
                },
            );
        }
        tracing::warn!(
            "fetch {url}: all {} tier(s) failed, last: {message}",
            attempts.len()
        );
        Err(FetchError::AllTiersFailed { message, attempts })
    }

    /// Fetch many URLs with at most `concurrency` in flight. Results keep
    /// the input order.
    pub async fn fetch_many(
        &self,
        urls: &[String],
        options: &FetchOptions,
        concurrency: usize,
    ) -> Vec<(String, FetchResult<FetchOutcome>)> {
        use futures::stream::{self, StreamExt};

        stream::iter(urls.iter())
            .map(|url| async move { (url.clone(), self.fetch(url, options).await) })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn attempt(
        &self,
        tier: RenderTier,
        url: &str,
        options: &FetchOptions,
    ) -> (TierAttempt, Option<RenderedPage>) {
        let started = Instant::now();
        let result = self.run_tier(tier, url, options.timeout_for(tier)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let failed = |reason: String| {
            tracing::debug!("fetch {url}: {tier} failed: {reason}");
            TierAttempt {
                tier,
                succeeded: false,
                failure_reason: Some(reason),
                final_url: None,
                duration_ms,
            }
        };

        match result {
            Ok(page) => match validation::validate(&page, options.min_content_length) {
                Ok(()) => (
                    TierAttempt {
                        tier,
                        succeeded: true,
                        failure_reason: None,
                        final_url: Some(page.final_url.clone()),
                        duration_ms,
                    },
                    Some(page),
                ),
                Err(rejection) => {
                    let mut attempt = failed(format!("{tier} rejected: {rejection}"));
                    attempt.final_url = Some(page.final_url);
                    (attempt, None)
                }
            },
            Err(reason) => (failed(reason), None),
        }
    }

    /// Run one executor, holding a broker slot around it when required.
    async fn run_tier(
        &self,
        tier: RenderTier,
        url: &str,
        timeout: Duration,
    ) -> Result<RenderedPage, String> {
        let Some(executor) = self.executors.get(tier) else {
            return Err(format!("no executor registered for tier {tier}"));
        };

        let permit = match (&self.broker, tier.is_brokered()) {
            (Some(broker), true) => {
                let session_id = format!("fetch-{}", uuid::Uuid::new_v4());
                Some(broker.acquire(&session_id).await.map_err(|e| e.to_string())?)
            }
            _ => None,
        };

        let request = TierRequest {
            tier,
            timeout,
            session_id: permit.as_ref().map(|p| p.session_id().to_string()),
        };
        let result = tokio::time::timeout(timeout, executor.execute(url, &request)).await;

        if let Some(permit) = permit {
            permit.release();
        }

        match result {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(e)) => Err(format!("{tier} executor error: {e:#}")),
            Err(_) => Err(format!("{tier} timed out after {}ms", timeout.as_millis())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TierExecutor;
    use async_trait::async_trait;

    struct Fixed(Option<RenderedPage>);

    #[async_trait]
    impl TierExecutor for Fixed {
        async fn execute(&self, url: &str, _request: &TierRequest) -> anyhow::Result<RenderedPage> {
            self.0
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused: {url}"))
        }
    }

    fn good_page() -> RenderedPage {
        RenderedPage {
            html: "<article><h1>Hi</h1></article>".to_string(),
            extracted_text: "word ".repeat(300),
            final_url: "https://example.com/final".to_string(),
        }
    }

    fn controller(static_ok: bool) -> TierCascadeController {
        let executors = TierExecutors::new()
            .with(
                RenderTier::Static,
                Arc::new(Fixed(static_ok.then(good_page))),
            )
            .with(RenderTier::Lightweight, Arc::new(Fixed(Some(good_page()))))
            .with(RenderTier::FullBrowser, Arc::new(Fixed(Some(good_page()))));
        TierCascadeController::new(executors, Arc::new(DomainPreferenceStore::new()))
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://WWW.Example.com/a?b=1").unwrap(), "example.com");
        assert_eq!(domain_of("http://sub.example.org:8080/").unwrap(), "sub.example.org");
        assert!(matches!(domain_of("not a url"), Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn test_plan_start_reasons() {
        let c = controller(true);
        let opts = FetchOptions::default();

        let plan = c.plan("https://example.com/", &opts).unwrap();
        assert_eq!(plan.start_reason, StartReason::Default);
        assert_eq!(plan.tiers, RenderTier::ALL.to_vec());

        let plan = c.plan("https://www.linkedin.com/in/someone", &opts).unwrap();
        assert!(matches!(plan.start_reason, StartReason::Heuristic(_)));
        assert_eq!(plan.tiers, vec![RenderTier::FullBrowser]);

        let forced = FetchOptions {
            force_tier: Some(RenderTier::Lightweight),
            ..FetchOptions::default()
        };
        let plan = c.plan("https://www.linkedin.com/", &forced).unwrap();
        assert_eq!(plan.start_reason, StartReason::Forced);
        assert_eq!(plan.start_tier, RenderTier::Lightweight);
    }

    #[test]
    fn test_plan_respects_max_tier() {
        let c = controller(true);
        let opts = FetchOptions {
            max_tier: Some(RenderTier::Lightweight),
            ..FetchOptions::default()
        };
        let plan = c.plan("https://x.com/home", &opts).unwrap();
        assert_eq!(plan.tiers, vec![RenderTier::Lightweight]);
    }

    #[test]
    fn test_learned_preference_needs_three_successes() {
        let c = controller(true);
        for _ in 0..3 {
            c.preferences().record(
                "example.com",
                LearningOutcome::Success {
                    tier: RenderTier::Lightweight,
                    latency_ms: 10,
                },
            );
        }
        let plan = c.plan("https://example.com/", &FetchOptions::default()).unwrap();
        assert_eq!(plan.start_reason, StartReason::LearnedPreference);
        assert_eq!(plan.tiers, vec![RenderTier::Lightweight, RenderTier::FullBrowser]);
    }

    #[tokio::test]
    async fn test_fetch_first_tier_success() {
        let c = controller(true);
        let outcome = c
            .fetch("https://example.com/page", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.final_tier, RenderTier::Static);
        assert!(!outcome.fell_back);
        assert_eq!(outcome.final_url, "https://example.com/final");
        assert_eq!(outcome.reason, "default cheapest-first");
        assert_eq!(c.domain_preference("example.com").unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_learning_can_be_disabled() {
        let c = controller(false);
        let opts = FetchOptions {
            enable_learning: false,
            ..FetchOptions::default()
        };
        let outcome = c.fetch("https://example.com/", &opts).await.unwrap();
        assert_eq!(outcome.final_tier, RenderTier::Lightweight);
        assert!(c.domain_preference("example.com").is_none());
    }

    #[tokio::test]
    async fn test_missing_executor_is_a_tier_failure() {
        let executors = TierExecutors::new().with(RenderTier::FullBrowser, Arc::new(Fixed(Some(good_page()))));
        let c = TierCascadeController::new(executors, Arc::new(DomainPreferenceStore::new()));
        let outcome = c.fetch("https://example.com/", &FetchOptions::default()).await.unwrap();
        assert_eq!(outcome.final_tier, RenderTier::FullBrowser);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.attempts[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("no executor registered"));
    }
}
