//! Render tiers, the ordered rendering strategies a fetch can use.
//!
//! Tiers are ordered by increasing cost and capability. A cascade always
//! walks them in that order, starting wherever the controller decides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A rendering strategy, ordered cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderTier {
    /// Plain HTTP fetch, no script execution.
    Static,
    /// Lightweight JS VM over the fetched document.
    Lightweight,
    /// Full headless browser from the provisioning service (costly, brokered).
    FullBrowser,
}

impl RenderTier {
    /// Every tier in cascade order.
    pub const ALL: [RenderTier; 3] = [
        RenderTier::Static,
        RenderTier::Lightweight,
        RenderTier::FullBrowser,
    ];

    /// The next costlier tier, if any.
    pub fn next(self) -> Option<RenderTier> {
        match self {
            RenderTier::Static => Some(RenderTier::Lightweight),
            RenderTier::Lightweight => Some(RenderTier::FullBrowser),
            RenderTier::FullBrowser => None,
        }
    }

    /// Whether this tier must go through the resource broker.
    pub fn is_brokered(self) -> bool {
        self == RenderTier::FullBrowser
    }

    /// Default executor timeout when the caller does not set one.
    pub fn default_timeout(self) -> Duration {
        match self {
            RenderTier::Static => Duration::from_secs(10),
            RenderTier::Lightweight => Duration::from_secs(20),
            RenderTier::FullBrowser => Duration::from_secs(45),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RenderTier::Static => "static",
            RenderTier::Lightweight => "lightweight",
            RenderTier::FullBrowser => "full_browser",
        }
    }
}

impl fmt::Display for RenderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" | "intelligence" => Ok(RenderTier::Static),
            "lightweight" => Ok(RenderTier::Lightweight),
            "full_browser" | "fullbrowser" | "browser" | "playwright" => {
                Ok(RenderTier::FullBrowser)
            }
            other => Err(format!("unknown render tier: {other}")),
        }
    }
}

/// Tiers to attempt, in order, from `start` up to and including `ceiling`.
///
/// A start above the ceiling is lowered to the ceiling, so the result is
/// never empty.
pub fn cascade(start: RenderTier, ceiling: RenderTier) -> Vec<RenderTier> {
    let start = start.min(ceiling);
    RenderTier::ALL
        .iter()
        .copied()
        .filter(|t| *t >= start && *t <= ceiling)
        .collect()
}
