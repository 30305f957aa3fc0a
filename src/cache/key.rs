//! Cache Key Module
//!
//! Normalizes a logical key and optional group into the namespaced composite
//! key used by the stores.

use std::fmt;

use crate::error::{CacheError, Result};

// == Cache Key ==
/// A trimmed `(key, group)` pair.
///
/// An empty group means "ungrouped".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    group: String,
}

impl CacheKey {
    // == Constructor ==
    /// Builds a key, trimming surrounding whitespace from both parts.
    pub fn new(key: &str, group: &str) -> Self {
        Self {
            key: key.trim().to_string(),
            group: group.trim().to_string(),
        }
    }

    /// Builds a key and rejects one that is empty after trimming.
    ///
    /// Keys of any length are accepted; durable stores name files after a
    /// hash of the key.
    pub fn parse(key: &str, group: &str) -> Result<Self> {
        let parsed = Self::new(key, group);

        if parsed.key.is_empty() {
            return Err(CacheError::InvalidRequest("Key must not be empty".to_string()));
        }

        Ok(parsed)
    }

    /// The trimmed logical key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The trimmed group, empty when ungrouped.
    pub fn group(&self) -> &str {
        &self.group
    }

    // == Composite ==
    /// `g_<group>_<key>`, or `_<key>` when ungrouped.
    pub fn composite(&self) -> String {
        format!("{}{}", group_prefix(&self.group), self.key)
    }

    /// Whether this key belongs to `group` (compared after trimming).
    pub fn in_group(&self, group: &str) -> bool {
        self.group == group.trim()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite())
    }
}

/// Namespacing prefix shared by every composite key of a group.
pub fn group_prefix(group: &str) -> String {
    let group = group.trim();
    if group.is_empty() {
        "_".to_string()
    } else {
        format!("g_{}_", group)
    }
}
