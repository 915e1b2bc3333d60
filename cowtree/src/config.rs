//! Tree configuration.
//!
//! Limits on caller input and the merge policy used by deletes. Defaults match
//! the on-disk format constants; a configuration can only tighten the limits,
//! never loosen them past what a page can hold.
//!
//! # Environment Variables
//!
//! - `COWTREE_MAX_KEY_SIZE`: maximum key size in bytes (default: `1000`)
//! - `COWTREE_MAX_VALUE_SIZE`: maximum value size in bytes (default: `3000`)
//! - `COWTREE_MERGE_THRESHOLD`: nodes whose encoded size is below this many
//!   bytes after a delete are merged with a sibling (default: `1024`)
//!
//! # Invariants
//!
//! A validated configuration guarantees that a node holding one record of
//! maximal size fits in a page, so an oversized node can always be split.

use std::str::FromStr;

use crate::btree::node::{
    HEADER_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE, OFFSET_SIZE, POINTER_SIZE, RECORD_HEADER_SIZE,
};
use crate::page::PAGE_SIZE;

/// Tree configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Largest key accepted by insert.
    pub max_key_size: usize,
    /// Largest value accepted by insert.
    pub max_value_size: usize,
    /// Encoded size in bytes below which a node is merged with a sibling.
    pub merge_threshold: usize,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
    /// A single maximal record would not fit in a page.
    Unsplittable { node_size: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
            Self::Unsplittable { node_size } => write!(
                f,
                "a node holding one maximal record needs {node_size} bytes, page size is {PAGE_SIZE}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_key_size: MAX_KEY_SIZE,
            max_value_size: MAX_VALUE_SIZE,
            merge_threshold: Self::DEFAULT_MERGE_THRESHOLD,
        }
    }
}

impl TreeConfig {
    /// Default merge threshold: a quarter page.
    pub const DEFAULT_MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset, then validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_key_size: load_var("COWTREE_MAX_KEY_SIZE", defaults.max_key_size)?,
            max_value_size: load_var("COWTREE_MAX_VALUE_SIZE", defaults.max_value_size)?,
            merge_threshold: load_var("COWTREE_MERGE_THRESHOLD", defaults.merge_threshold)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Size of the largest node that holds a single record under these limits.
    #[must_use]
    pub const fn single_record_node_size(&self) -> usize {
        HEADER_SIZE
            + POINTER_SIZE
            + OFFSET_SIZE
            + RECORD_HEADER_SIZE
            + self.max_key_size
            + self.max_value_size
    }

    /// Check the configuration against the page format.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a limit exceeds the format maximum (`MAX_KEY_SIZE`, `MAX_VALUE_SIZE`)
    /// - one maximal record would not fit in a page on its own
    /// - the merge threshold is larger than a page
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_key_size > MAX_KEY_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "max_key_size".to_string(),
                message: format!("{} exceeds the format maximum {MAX_KEY_SIZE}", self.max_key_size),
            });
        }
        if self.max_value_size > MAX_VALUE_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "max_value_size".to_string(),
                message: format!(
                    "{} exceeds the format maximum {MAX_VALUE_SIZE}",
                    self.max_value_size
                ),
            });
        }
        let node_size = self.single_record_node_size();
        if node_size > PAGE_SIZE {
            return Err(ConfigError::Unsplittable { node_size });
        }
        if self.merge_threshold > PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "merge_threshold".to_string(),
                message: format!("{} exceeds the page size {PAGE_SIZE}", self.merge_threshold),
            });
        }
        Ok(())
    }
}

/// Load a value from the environment.
///
/// Returns the default if not set.
pub(crate) fn load_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("cannot parse '{value}'"),
        }),
        Err(_) => Ok(default),
    }
}
