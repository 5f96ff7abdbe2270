//! Key-mapped batches and per-sample records
//!
//! A [`Batch`] is the unit that moves through channels. A [`Sample`] is one
//! batch index with the leading axis removed; it is what the record store
//! persists.

use indexmap::IndexMap;

use super::tensor::Tensor;
use crate::error::{HighwayError, Result};

/// Conventional key for image tensors (NHWC)
pub const IMAGES: &str = "images";
/// Conventional key for label tensors
pub const LABELS: &str = "labels";
/// Conventional key for sample identifiers
pub const KEYS: &str = "keys";

/// Ordered map from key to tensor
pub type TensorMap = IndexMap<String, Tensor>;

/// A keyed collection of tensors sharing one leading (batch) dimension
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    entries: TensorMap,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.entries.insert(key.into(), tensor);
        self
    }

    /// Insert or replace a tensor, keeping the original key position
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.entries.insert(key.into(), tensor)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    /// Like [`get`](Self::get) but missing keys are an error
    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.entries.get(key).ok_or_else(|| HighwayError::MissingKey {
            key: key.to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keys (not the batch size)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &TensorMap {
        &self.entries
    }

    pub fn into_entries(self) -> TensorMap {
        self.entries
    }

    /// The common leading dimension of every entry
    ///
    /// Fails if the batch is empty, holds a scalar, or entries disagree.
    pub fn batch_size(&self) -> Result<usize> {
        let mut size = None;
        for (key, tensor) in &self.entries {
            let leading = tensor.leading_dim().ok_or_else(|| {
                HighwayError::shape(format!("entry {:?} is a scalar", key))
            })?;
            match size {
                None => size = Some(leading),
                Some(expected) if expected != leading => {
                    return Err(HighwayError::shape(format!(
                        "entry {:?} has batch dimension {}, expected {}",
                        key, leading, expected
                    )));
                }
                Some(_) => {}
            }
        }
        size.ok_or_else(|| HighwayError::shape("batch has no entries"))
    }

    /// Slice index `index` out of every entry
    pub fn sample(&self, index: usize) -> Result<Sample> {
        let mut entries = TensorMap::with_capacity(self.entries.len());
        for (key, tensor) in &self.entries {
            entries.insert(key.clone(), tensor.sample(index)?);
        }
        Ok(Sample { entries })
    }

    /// Re-assemble a batch from samples that share one key set
    ///
    /// Key order follows the first sample.
    pub fn from_samples(samples: &[Sample]) -> Result<Batch> {
        let first = samples
            .first()
            .ok_or_else(|| HighwayError::shape("cannot batch zero samples"))?;

        let mut entries = TensorMap::with_capacity(first.len());
        for key in first.entries.keys() {
            let mut column = Vec::with_capacity(samples.len());
            for (idx, sample) in samples.iter().enumerate() {
                if sample.len() != first.len() {
                    return Err(HighwayError::shape(format!(
                        "sample {} has {} keys, expected {}",
                        idx,
                        sample.len(),
                        first.len()
                    )));
                }
                let tensor = sample.get(key).ok_or_else(|| {
                    HighwayError::shape(format!("sample {} is missing key {:?}", idx, key))
                })?;
                column.push(tensor.clone());
            }
            entries.insert(key.clone(), Tensor::stack(&column)?);
        }
        Ok(Batch { entries })
    }
}

impl From<TensorMap> for Batch {
    fn from(entries: TensorMap) -> Self {
        Self { entries }
    }
}

/// One sample: every batch entry at a single index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    entries: TensorMap,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.entries.insert(key.into(), tensor);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &TensorMap {
        &self.entries
    }
}

impl From<TensorMap> for Sample {
    fn from(entries: TensorMap) -> Self {
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_key_batch() -> Batch {
        Batch::new()
            .with(IMAGES, Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap())
            .with(LABELS, Tensor::from_vec(vec![2], vec![0i64, 1]).unwrap())
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(two_key_batch().batch_size().unwrap(), 2);
        assert!(Batch::new().batch_size().is_err());

        let ragged = two_key_batch().with(KEYS, Tensor::zeros(vec![3], crate::tensor::DType::I64));
        assert!(ragged.batch_size().is_err());
    }

    #[test]
    fn test_sample_roundtrip() {
        let batch = two_key_batch();
        let samples: Vec<Sample> = (0..2).map(|i| batch.sample(i).unwrap()).collect();
        assert_eq!(samples[1].get(LABELS).unwrap().to_vec::<i64>().unwrap(), vec![1]);
        assert_eq!(Batch::from_samples(&samples).unwrap(), batch);
    }

    #[test]
    fn test_from_samples_rejects_key_drift() {
        let a = Sample::new().with(IMAGES, Tensor::full(vec![2], 1u8));
        let b = Sample::new().with(LABELS, Tensor::full(vec![2], 1u8));
        assert!(Batch::from_samples(&[a, b]).is_err());
    }

    #[test]
    fn test_insert_keeps_key_order() {
        let mut batch = two_key_batch();
        batch.insert(IMAGES, Tensor::full(vec![2, 1], 0.5f32));
        let keys: Vec<&str> = batch.keys().collect();
        assert_eq!(keys, vec![IMAGES, LABELS]);
    }
}
