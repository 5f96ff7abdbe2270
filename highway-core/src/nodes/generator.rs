//! Synthetic batch generator
//!
//! Emits constant or uniform-noise batches forever. Used to benchmark
//! downstream stages and in tests.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::{HighwayError, Result};
use crate::tensor::{Batch, DType, Tensor, IMAGES};

/// How generated tensors are filled
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    /// Every element equals the value (converted to the dtype)
    Constant(f64),
    /// Floats in `[0, 1)`; integers in `[0, 256)`
    Uniform,
}

/// Shape and contents of generated batches
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Per-sample shape; batches are `[batch_size, ..shape]`
    pub shape: Vec<usize>,
    pub batch_size: usize,
    pub dtype: DType,
    pub fill: Fill,
    /// Batch key the tensor is stored under
    pub key: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            shape: vec![32, 32, 3],
            batch_size: 32,
            dtype: DType::F32,
            fill: Fill::Uniform,
            key: IMAGES.to_string(),
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HighwayError::config("generator batch size must be at least 1"));
        }
        if self.key.is_empty() {
            return Err(HighwayError::config("generator key must not be empty"));
        }
        Ok(())
    }

    fn batch_shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(self.batch_size);
        shape.extend_from_slice(&self.shape);
        shape
    }
}

fn uniform_tensor(shape: Vec<usize>, dtype: DType, rng: &mut StdRng) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let values: Vec<f64> = match dtype {
        DType::F32 | DType::F64 => (0..count).map(|_| rng.gen::<f64>()).collect(),
        DType::U8 | DType::I32 | DType::I64 => {
            (0..count).map(|_| f64::from(rng.gen::<u8>())).collect()
        }
    };
    Tensor::from_f64(shape, dtype, &values)
}

/// Worker emitting one generated batch per step
pub struct Generator {
    config: GeneratorConfig,
    /// Cached batch for constant fills; clones share the buffer
    constant: Option<Batch>,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            constant: None,
        }
    }

    /// Build a generator stage
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        config: GeneratorConfig,
    ) -> Result<Stage> {
        config.validate()?;
        Stage::configure(name, stage, move |_| Generator::new(config.clone()))
    }
}

#[async_trait]
impl StageWorker for Generator {
    async fn setup(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        if let Fill::Constant(value) = self.config.fill {
            let values = vec![value; self.config.batch_shape().iter().product()];
            let tensor = Tensor::from_f64(self.config.batch_shape(), self.config.dtype, &values)?;
            self.constant = Some(Batch::new().with(self.config.key.clone(), tensor));
        }
        debug!(
            stage = ctx.stage(),
            worker = ctx.index(),
            shape = ?self.config.batch_shape(),
            "Generator ready"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        let batch = match &self.constant {
            Some(batch) => batch.clone(),
            None => {
                let shape = self.config.batch_shape();
                let dtype = self.config.dtype;
                let tensor = ctx.run_blocking(move |rng| uniform_tensor(shape, dtype, rng)).await??;
                Batch::new().with(self.config.key.clone(), tensor)
            }
        };
        ctx.enqueue(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stage_config() -> StageConfig {
        StageConfig::default()
            .with_queue_capacity(2)
            .with_timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_constant_generator() {
        let config = GeneratorConfig {
            shape: vec![2, 2, 1],
            batch_size: 3,
            dtype: DType::U8,
            fill: Fill::Constant(7.0),
            key: IMAGES.to_string(),
        };
        let mut stage = Generator::stage("noise", stage_config(), config).unwrap();
        stage.start().unwrap();

        let batch = stage.dequeue(Duration::from_secs(1)).await.unwrap();
        let images = batch.get(IMAGES).unwrap();
        assert_eq!(images.shape(), &[3, 2, 2, 1]);
        assert!(images.to_vec::<u8>().unwrap().iter().all(|v| *v == 7));

        stage.stop();
        stage.join().await;
    }

    #[tokio::test]
    async fn test_uniform_is_seeded() {
        let config = GeneratorConfig {
            shape: vec![4],
            batch_size: 2,
            ..GeneratorConfig::default()
        };

        let mut first = Vec::new();
        for _ in 0..2 {
            let mut stage =
                Generator::stage("noise", stage_config().with_seed(3), config.clone()).unwrap();
            stage.start().unwrap();
            first.push(stage.dequeue(Duration::from_secs(1)).await.unwrap());
            stage.stop();
            stage.join().await;
        }
        assert_eq!(first[0], first[1]);

        let values = first[0].get(IMAGES).unwrap().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let config = GeneratorConfig {
            batch_size: 0,
            ..GeneratorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
