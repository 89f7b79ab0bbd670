//! Common types used throughout the index engine.

mod page_id;

pub use page_id::PageId;

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size.
///
/// A page must hold the node header plus at least two uncompressed entries,
/// and the file header must fit in page 0.
pub const MIN_PAGE_SIZE: usize = 64;

/// Bytes used to store a child page id inside an inner node
pub const CHILD_ID_SIZE: usize = 4;

/// Tree configuration, fixed at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeConfig {
    /// Fixed byte budget per node page
    pub page_size: usize,
    /// Unique mode: distinct keys, ordered by key alone.
    /// Non-unique mode: entries ordered by (key, value).
    pub unique: bool,
    /// Bytes per stored value element (1, 2, 4 or 8)
    pub value_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            unique: true,
            value_size: 8,
        }
    }
}

impl TreeConfig {
    /// Create a new configuration
    pub fn new(page_size: usize, unique: bool, value_size: usize) -> Self {
        Self {
            page_size,
            unique,
            value_size,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(IndexError::invalid_config(format!(
                "page size {} below minimum {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if !matches!(self.value_size, 1 | 2 | 4 | 8) {
            return Err(IndexError::invalid_config(format!(
                "value size {} not one of 1, 2, 4, 8",
                self.value_size
            )));
        }
        Ok(())
    }

    /// The underfull boundary: a non-root node whose serialized size drops
    /// below this is a candidate for rebalancing.
    pub fn page_size_threshold(&self) -> usize {
        self.page_size * 3 / 4
    }
}
