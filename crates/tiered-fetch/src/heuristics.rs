//! Static hostname rules for picking a starting tier on unfamiliar domains.

use crate::tier::RenderTier;

/// Hosts whose content is almost always server-rendered.
const STATIC_SUFFIXES: &[&str] = &[
    "gov",
    "edu",
    "wikipedia.org",
    "wikimedia.org",
    "readthedocs.io",
    "github.io",
    "docs.rs",
    "rust-lang.org",
    "python.org",
    "arxiv.org",
    "archive.org",
    "substack.com",
    "medium.com",
];

/// Heavily interactive or bot-hostile hosts that only render in a browser.
const BROWSER_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "instagram.com",
    "facebook.com",
    "linkedin.com",
    "tiktok.com",
    "threads.net",
    "airbnb.com",
    "booking.com",
    "ticketmaster.com",
    "zillow.com",
    "indeed.com",
];

/// Why a starting tier was picked by hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicMatch {
    pub tier: RenderTier,
    /// The rule that matched.
    pub rule: String,
}

/// Hostname suffix rules. Empty lists mean "no opinion".
#[derive(Debug, Clone)]
pub struct HostnameHeuristics {
    static_suffixes: Vec<String>,
    browser_domains: Vec<String>,
}

impl Default for HostnameHeuristics {
    fn default() -> Self {
        Self {
            static_suffixes: STATIC_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            browser_domains: BROWSER_DOMAINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl HostnameHeuristics {
    /// Rules with no entries; every host falls through to the default tier.
    pub fn empty() -> Self {
        Self {
            static_suffixes: Vec::new(),
            browser_domains: Vec::new(),
        }
    }

    pub fn with_static_suffix(mut self, suffix: &str) -> Self {
        self.static_suffixes.push(normalize(suffix));
        self
    }

    pub fn with_browser_domain(mut self, domain: &str) -> Self {
        self.browser_domains.push(normalize(domain));
        self
    }

    /// Match `host` against the rules. Browser rules win over static ones.
    pub fn classify(&self, host: &str) -> Option<HeuristicMatch> {
        let host = normalize(host);

        if let Some(rule) = self.browser_domains.iter().find(|d| matches_suffix(&host, d)) {
            return Some(HeuristicMatch {
                tier: RenderTier::FullBrowser,
                rule: format!("interactive domain {rule}"),
            });
        }
        if let Some(rule) = self.static_suffixes.iter().find(|s| matches_suffix(&host, s)) {
            return Some(HeuristicMatch {
                tier: RenderTier::Static,
                rule: format!("static-content suffix {rule}"),
            });
        }
        None
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `host` equals `suffix` or ends with `.suffix` (label boundary).
fn matches_suffix(host: &str, suffix: &str) -> bool {
    host == suffix
        || host
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
