//! Tensor data model
//!
//! Element types, dense tensors and the key-mapped batches that flow
//! between stages.

pub mod batch;
pub mod dtype;
#[allow(clippy::module_inception)]
pub mod tensor;

pub use batch::{Batch, Sample, TensorMap, IMAGES, KEYS, LABELS};
pub use dtype::{DType, Element};
pub use tensor::Tensor;
