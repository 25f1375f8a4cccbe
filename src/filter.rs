//! Include/exclude rule sets
//!
//! Glob-based filtering applied to object paths during listing. Exclude
//! rules win over include rules; an empty include set admits everything.

use crate::error::{Result, SyncError};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compiled include/exclude rule set
#[derive(Debug, Default)]
pub struct Filter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl Filter {
    /// Build a filter from glob patterns
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    /// Whether an object path passes the rules
    pub fn matches(&self, remote: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(remote) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(remote),
            None => true,
        }
    }

    /// True when no rules are configured
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Usage(format!("invalid pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| SyncError::Usage(format!("invalid pattern set: {e}")))?;
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_admits_all() {
        let filter = Filter::default();
        assert!(filter.is_empty());
        assert!(filter.matches("anything/at/all.txt"));
    }

    #[test]
    fn test_include_only() {
        let filter = Filter::new(&strings(&["*.jpg", "photos/**"]), &[]).unwrap();
        assert!(filter.matches("cat.jpg"));
        assert!(filter.matches("photos/2024/trip.raw"));
        assert!(!filter.matches("notes.txt"));
    }

    #[test]
    fn test_exclude_wins() {
        let filter = Filter::new(&strings(&["**"]), &strings(&["*.tmp"])).unwrap();
        assert!(filter.matches("keep.txt"));
        assert!(!filter.matches("scratch.tmp"));
    }

    #[test]
    fn test_invalid_pattern_is_usage_error() {
        let err = Filter::new(&strings(&["[unclosed"]), &[]).unwrap_err();
        assert!(matches!(err, SyncError::Usage(_)));
    }
}
