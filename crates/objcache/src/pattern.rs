// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Filtering a remote listing against a single-wildcard pattern

use crate::reference::WildcardSegment;
use crate::storage::RemoteObjectDescriptor;

/// Final-segment glob with exactly one `*`, split around the star.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentGlob {
    prefix: String,
    suffix: String,
}

impl SegmentGlob {
    /// Build from a segment such as `*.csv` or `part-*.parquet`. A segment
    /// without a star matches only itself.
    #[must_use]
    pub fn new(segment: &str) -> Self {
        match segment.split_once('*') {
            Some((prefix, suffix)) => Self {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            },
            None => Self {
                prefix: segment.to_string(),
                suffix: String::new(),
            },
        }
    }

    /// Case-sensitive match of one path segment.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }
}

/// Matches listed objects against a [`WildcardSegment`].
///
/// A key matches when it lies under the pattern's directory prefix (at any
/// depth) and its final segment matches the glob. Directory placeholder keys
/// ending in `/` never match.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    dir_prefix: String,
    glob: SegmentGlob,
}

impl PatternMatcher {
    #[must_use]
    pub fn new(wildcard: &WildcardSegment) -> Self {
        Self {
            dir_prefix: wildcard.prefix.clone(),
            glob: SegmentGlob::new(&wildcard.glob),
        }
    }

    #[must_use]
    pub fn is_match(&self, key: &str) -> bool {
        let Some(rest) = key.strip_prefix(&self.dir_prefix) else {
            return false;
        };
        if rest.is_empty() || rest.ends_with('/') {
            return false;
        }
        let last = rest.rsplit('/').next().unwrap_or(rest);
        self.glob.matches(last)
    }

    /// Matching subset of `listing`, sorted by key and free of duplicates.
    #[must_use]
    pub fn filter(&self, listing: Vec<RemoteObjectDescriptor>) -> Vec<RemoteObjectDescriptor> {
        let mut matched: Vec<_> = listing.into_iter().filter(|d| self.is_match(&d.key)).collect();
        matched.sort_by(|a, b| a.key.cmp(&b.key));
        matched.dedup_by(|a, b| a.key == b.key);
        matched
    }
}
