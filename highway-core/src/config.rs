//! Configuration loading
//!
//! Every section has defaults, so a file only lists what it changes:
//!
//! ```toml
//! [stage]
//! workers = 4
//! queue_capacity = 64
//!
//! [network]
//! address = "0.0.0.0:5555"
//! bind = true
//!
//! [[transforms]]
//! type = "resize"
//! width = 224
//! ```
//!
//! `HIGHWAY_*` environment variables override the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::engine::StageConfig;
use crate::error::{HighwayError, Result};
use crate::network::NetworkConfig;
use crate::nodes::{GeneratorConfig, ReaderConfig};
use crate::store::StoreConfig;
use crate::transforms::{self, TransformRef, TransformSpec};

/// Top-level configuration of a highway deployment
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HighwayConfig {
    /// Defaults for every stage built from this config
    pub stage: StageConfig,
    pub network: NetworkConfig,
    pub store: StoreConfig,
    pub generator: GeneratorConfig,
    pub reader: ReaderConfig,
    /// Augmentation list, applied in order
    pub transforms: Vec<TransformSpec>,
    /// Run augmentations in evaluation mode
    pub deterministic: bool,
}

impl HighwayConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `HIGHWAY_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup
    ///
    /// Recognised names: `HIGHWAY_WORKERS`, `HIGHWAY_QUEUE_CAPACITY`,
    /// `HIGHWAY_TIMEOUT_MS`, `HIGHWAY_SEED`, `HIGHWAY_ADDRESS`,
    /// `HIGHWAY_BIND`, `HIGHWAY_STORE_PATH`, `HIGHWAY_BATCH_SIZE`.
    /// The batch size applies to the store, generator and reader alike.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parsed(&lookup, "HIGHWAY_WORKERS")? {
            self.stage.workers = value;
        }
        if let Some(value) = parsed(&lookup, "HIGHWAY_QUEUE_CAPACITY")? {
            self.stage.queue_capacity = value;
        }
        if let Some(value) = parsed(&lookup, "HIGHWAY_TIMEOUT_MS")? {
            self.stage.timeout_ms = value;
        }
        if let Some(value) = parsed(&lookup, "HIGHWAY_SEED")? {
            self.stage.seed = value;
        }
        if let Some(value) = lookup("HIGHWAY_ADDRESS") {
            self.network.address = value;
        }
        if let Some(value) = parsed(&lookup, "HIGHWAY_BIND")? {
            self.network.bind = value;
        }
        if let Some(value) = lookup("HIGHWAY_STORE_PATH") {
            self.store.path = PathBuf::from(value);
        }
        if let Some(value) = parsed::<usize, _>(&lookup, "HIGHWAY_BATCH_SIZE")? {
            self.store.batch_size = value;
            self.generator.batch_size = value;
            self.reader.batch_size = value;
        }
        Ok(())
    }

    /// Validate every section and every transform
    pub fn validate(&self) -> Result<()> {
        self.stage.validate()?;
        self.network.validate()?;
        self.store.validate()?;
        self.generator.validate()?;
        self.reader.validate()?;
        self.build_transforms()?;
        Ok(())
    }

    pub fn build_transforms(&self) -> Result<Vec<TransformRef>> {
        transforms::build_all(&self.transforms)
    }
}

fn parsed<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| HighwayError::config(format!("{name}={raw:?}: {e}"))),
    }
}
