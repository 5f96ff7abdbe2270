//! Persistent batch store
//!
//! [`StoreSink`] splits batches into per-sample records and appends them to
//! an SQLite file; [`StoreSource`] scans the records back in insertion order
//! and re-batches them. A sink and a source may share a path: WAL mode lets
//! the reader scan while the writer appends.

pub mod record;
pub mod sink;
pub mod source;

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{HighwayError, Result};

pub use record::{parse_key, record_key, KEY_WIDTH};
pub use sink::StoreSink;
pub use source::StoreSource;

/// Location and read batching of a store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Samples per batch emitted by a source
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("highway.db"),
            batch_size: 32,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(HighwayError::config("store path must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(HighwayError::config("store batch size must be at least 1"));
        }
        Ok(())
    }
}
