//! Allow-list of permitted resource paths for secure routes
//!
//! The pattern set is compiled once at startup and shared read-only across
//! all in-flight requests.

use regex::Regex;

/// A fixed set of compiled resource-path patterns.
///
/// Matching is any-pattern-matches over the set. The gateway lower-cases the
/// resource path before classification and before calling [`AllowList::is_allowed`],
/// so patterns are expected to be written lower-case.
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<Regex>,
}

impl AllowList {
    /// Compile the pattern set. Fails if any pattern is not a valid
    /// regular expression.
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether the resource path is permitted to be forwarded.
    ///
    /// Fails closed: an empty resource is never allowed.
    pub fn is_allowed(&self, resource: &str) -> bool {
        if resource.is_empty() {
            return false;
        }
        let normalized = resource.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.is_match(&normalized))
    }
}
