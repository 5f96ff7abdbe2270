//! Highway - multi-stage tensor batch pipelines for ML data loading
//!
//! This crate provides:
//! - Stages of worker tasks joined by bounded, backpressured channels
//! - Image augmentation transforms
//! - A TCP push/pull transport for batches
//! - A persistent SQLite batch store with infinite replay
//! - A bounded sample cache and a training-loop adapter

pub mod adapter;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod network;
pub mod nodes;
pub mod store;
pub mod tensor;
pub mod transforms;

pub use adapter::ImageStream;
pub use cache::{CacheStats, FifoCache};
pub use config::HighwayConfig;
pub use engine::{
    Channel, Pipeline, Stage, StageConfig, StageWorker, StopToken, WorkerContext, WorkerExit,
};
pub use error::{HighwayError, Result};
pub use network::{NetworkConfig, NetworkSink, NetworkSource};
pub use nodes::{Augmenter, Generator, GeneratorConfig, ReaderConfig, SampleReader, Tap};
pub use store::{StoreConfig, StoreSink, StoreSource};
pub use tensor::{Batch, DType, Sample, Tensor};
pub use transforms::{Transform, TransformRef, TransformSpec};

/// Default stage output capacity, in batches
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
