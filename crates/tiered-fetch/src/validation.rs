//! Content-quality checks applied to every tier result.
//!
//! A tier "succeeds" only if its page survives these checks. Lengths are
//! measured in characters of the extracted text, not HTML bytes.

use crate::executor::RenderedPage;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Default minimum extracted-text length.
pub const DEFAULT_MIN_CONTENT_LENGTH: usize = 200;

/// Below this length, an incomplete-render marker rejects the page.
pub const INCOMPLETE_RENDER_THRESHOLD: usize = 500;

/// Below this length, a page with no structural marker is rejected.
pub const UNSTRUCTURED_THRESHOLD: usize = 1000;

/// Why a page was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Extracted text shorter than the caller's minimum.
    TooShort { length: usize, minimum: usize },
    /// HTML still shows loading placeholders or an empty app root.
    IncompleteRender { length: usize },
    /// No main/article/content/heading markup and not enough text to trust.
    Unstructured { length: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooShort { length, minimum } => {
                write!(f, "content too short: {length} chars (minimum {minimum})")
            }
            Rejection::IncompleteRender { length } => write!(
                f,
                "incomplete render: loading placeholder with only {length} chars"
            ),
            Rejection::Unstructured { length } => write!(
                f,
                "unstructured content: no main/article/heading markup and only {length} chars"
            ),
        }
    }
}

fn incomplete_render_markers() -> &'static [Regex] {
    static MARKERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        [
            r#"(?i)<div[^>]*\bid\s*=\s*["'](?:root|app|__next|__nuxt)["'][^>]*>\s*</div>"#,
            r"(?i)<app-root[^>]*>\s*</app-root>",
            r"(?i)>\s*loading(?:\.\.\.|…)?\s*<",
            r#"(?i)class\s*=\s*["'][^"']*\b(?:spinner|skeleton|loading)\b"#,
            r"(?i)enable javascript to run this app",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid incomplete-render regex"))
        .collect()
    })
}

fn structural_markers() -> &'static [Regex] {
    static MARKERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        [
            r"(?i)<main[\s>]",
            r"(?i)<article[\s>]",
            r"(?i)<h[1-6][\s>]",
            r#"(?i)role\s*=\s*["']main["']"#,
            r#"(?i)(?:class|id)\s*=\s*["'][^"']*\bcontent\b"#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid structural regex"))
        .collect()
    })
}

/// Whether the HTML still looks like an unfinished client-side render.
pub fn has_incomplete_render_marker(html: &str) -> bool {
    incomplete_render_markers().iter().any(|re| re.is_match(html))
}

/// Whether the HTML carries any recognized content structure.
pub fn has_structural_marker(html: &str) -> bool {
    structural_markers().iter().any(|re| re.is_match(html))
}

/// Judge a rendered page. `Ok(())` means the tier result is acceptable.
pub fn validate(page: &RenderedPage, min_content_length: usize) -> Result<(), Rejection> {
    let length = page.extracted_text.chars().count();

    if length < min_content_length {
        return Err(Rejection::TooShort {
            length,
            minimum: min_content_length,
        });
    }
    if length < INCOMPLETE_RENDER_THRESHOLD && has_incomplete_render_marker(&page.html) {
        return Err(Rejection::IncompleteRender { length });
    }
    if length < UNSTRUCTURED_THRESHOLD && !has_structural_marker(&page.html) {
        return Err(Rejection::Unstructured { length });
    }
    Ok(())
}
