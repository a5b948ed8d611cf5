// Copyright 2026 Cortex Contributors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive, cheapest-first page rendering.
//!
//! A [`TierCascadeController`] walks render tiers (static HTTP, lightweight
//! JS, full browser) until a page passes content validation, learning a
//! starting tier per domain. The costly full-browser tier is gated by a
//! [`ResourceBroker`] that enforces concurrency, a FIFO wait queue, session
//! duration caps and a monthly cost-unit quota.

pub mod broker;
pub mod cascade;
pub mod error;
pub mod executor;
pub mod heuristics;
pub mod preferences;
pub mod tier;
pub mod validation;

pub use broker::{BrokerConfig, BrokerStats, Plan, ResourceBroker, SessionPermit, UsageSnapshot};
pub use cascade::{
    domain_of, CascadePlan, FetchOptions, FetchOutcome, StartReason, TierAttempt,
    TierCascadeController,
};
pub use error::{BrokerError, BrokerResult, FetchError, FetchResult};
pub use executor::{RenderedPage, TierExecutor, TierExecutors, TierRequest};
pub use heuristics::HostnameHeuristics;
pub use preferences::{DomainPreference, DomainPreferenceStore, LearningOutcome};
pub use tier::RenderTier;
