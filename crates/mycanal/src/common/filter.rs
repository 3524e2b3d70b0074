//! Table filtering for replicated events
//!
//! Tables are addressed as `schema.table`. A table is eligible when the
//! include list is empty or one of its patterns matches, and none of the
//! exclude patterns match. Patterns are regular expressions evaluated with
//! search semantics, so anchor them (`^...$`) for exact matches.
//!
//! # Example
//!
//! ```rust
//! use mycanal::common::{TableFilter, TableFilterConfig};
//!
//! let filter = TableFilter::new(&TableFilterConfig {
//!     include_table_regex: vec![r".*\.orders".to_string()],
//!     exclude_table_regex: vec![r"mysql\..*".to_string()],
//! })
//! .unwrap();
//!
//! assert!(filter.check_table_match("shop.orders"));
//! assert!(!filter.check_table_match("mysql.orders"));
//! ```

use crate::common::{CanalError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Include/exclude patterns over `schema.table`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilterConfig {
    /// Tables to include; empty includes everything
    #[serde(default)]
    pub include_table_regex: Vec<String>,

    /// Tables to exclude, evaluated after includes
    #[serde(default)]
    pub exclude_table_regex: Vec<String>,
}

impl TableFilterConfig {
    pub fn is_empty(&self) -> bool {
        self.include_table_regex.is_empty() && self.exclude_table_regex.is_empty()
    }
}

/// Compiled filter with a memo of previous decisions
pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    cache: Mutex<HashMap<String, bool>>,
}

impl TableFilter {
    /// Compile the configured patterns.
    pub fn new(config: &TableFilterConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| CanalError::config(format!("invalid table regex '{}': {}", p, e)))
                })
                .collect()
        };

        Ok(Self {
            include: compile(&config.include_table_regex)?,
            exclude: compile(&config.exclude_table_regex)?,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// A filter that accepts every table.
    pub fn allow_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether no rule is configured.
    pub fn is_pass_through(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Check a fully-qualified `schema.table` key.
    pub fn check_table_match(&self, key: &str) -> bool {
        if self.is_pass_through() {
            return true;
        }

        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(key) {
                return *hit;
            }
        }

        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(key));
        let matched = included && !self.exclude.iter().any(|r| r.is_match(key));

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), matched);
        }
        matched
    }

    /// Convenience wrapper taking schema and table separately.
    pub fn should_include_table(&self, schema: &str, table: &str) -> bool {
        self.check_table_match(&format!("{}.{}", schema, table))
    }
}

impl std::fmt::Debug for TableFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFilter")
            .field(
                "include",
                &self.include.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .field(
                "exclude",
                &self.exclude.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .finish()
    }
}
