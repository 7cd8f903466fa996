// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client VSN filter rules.

use crate::catalog::{CatalogEntry, MediaType};
use regex::Regex;

/// One sharing rule: volumes of `media` in library `eq` whose VSN matches
/// `pattern`.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub eq: u16,
    pub media: MediaType,
    pattern: Regex,
}

impl FilterRule {
    /// Compile a rule. Matching is case-sensitive and unanchored.
    pub fn new(eq: u16, media: MediaType, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            eq,
            media,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        self.eq == entry.eq && self.media == entry.media && self.pattern.is_match(entry.vsn.as_str())
    }
}

/// First rule matching `entry`, in rule order.
pub fn first_match<'a>(rules: &'a [FilterRule], entry: &CatalogEntry) -> Option<&'a FilterRule> {
    rules.iter().find(|rule| rule.matches(entry))
}

/// Whether `entry` may be forwarded to a client holding `rules`.
///
/// Unusable volumes are rejected before any pattern runs.
pub fn is_eligible(rules: &[FilterRule], entry: &CatalogEntry) -> bool {
    entry.status.is_usable() && first_match(rules, entry).is_some()
}
