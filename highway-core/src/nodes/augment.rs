//! Augmentation stage
//!
//! Dequeues a batch, applies the transform list in order on the blocking
//! pool and enqueues the result.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::Result;
use crate::metrics::standard;
use crate::transforms::{apply_all, TransformRef};

/// Worker applying a fixed transform chain
pub struct Augmenter {
    transforms: Arc<[TransformRef]>,
    deterministic: bool,
}

impl Augmenter {
    pub fn new(transforms: Arc<[TransformRef]>, deterministic: bool) -> Self {
        Self {
            transforms,
            deterministic,
        }
    }

    /// Build an augmentation stage sharing one transform list across workers
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        transforms: Vec<TransformRef>,
        deterministic: bool,
    ) -> Result<Stage> {
        let transforms: Arc<[TransformRef]> = transforms.into();
        Stage::configure(name, stage, move |_| Augmenter::new(transforms.clone(), deterministic))
    }
}

#[async_trait]
impl StageWorker for Augmenter {
    async fn setup(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        debug!(
            stage = ctx.stage(),
            worker = ctx.index(),
            transforms = ?self.transforms.iter().map(|t| t.name()).collect::<Vec<_>>(),
            deterministic = self.deterministic,
            "Augmenter ready"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        let batch = ctx.dequeue().await?;
        if self.transforms.is_empty() {
            return ctx.enqueue(batch).await;
        }

        let transforms = self.transforms.clone();
        let deterministic = self.deterministic;
        let augmented = ctx
            .run_blocking(move |rng| {
                standard::TRANSFORM_DURATION
                    .time(|| apply_all(&transforms, batch, deterministic, rng))
            })
            .await??;
        ctx.enqueue(augmented).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Pipeline;
    use crate::nodes::generator::{Fill, Generator, GeneratorConfig};
    use crate::tensor::{DType, IMAGES};
    use crate::transforms::{FlipX, Rescale};
    use std::time::Duration;

    fn stage_config() -> StageConfig {
        StageConfig::default()
            .with_queue_capacity(4)
            .with_timeout(Duration::from_millis(10))
    }

    fn source() -> Stage {
        let config = GeneratorConfig {
            shape: vec![4, 4, 1],
            batch_size: 2,
            dtype: DType::U8,
            fill: Fill::Constant(130.0),
            ..GeneratorConfig::default()
        };
        Generator::stage("source", stage_config(), config).unwrap()
    }

    #[tokio::test]
    async fn test_transforms_run_in_order() {
        let transforms: Vec<TransformRef> =
            vec![Arc::new(FlipX), Arc::new(Rescale::new(0.5, 128.0))];
        let augment =
            Augmenter::stage("augment", stage_config().with_workers(2), transforms, false)
                .unwrap();
        let mut pipeline = Pipeline::compose(vec![source(), augment]).unwrap();

        let batch = pipeline.dequeue().await.unwrap();
        let images = batch.get(IMAGES).unwrap();
        assert_eq!(images.dtype(), DType::F32);
        assert!(images.to_vec::<f32>().unwrap().iter().all(|v| *v == 1.0));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_chain_passes_through() {
        let augment = Augmenter::stage("augment", stage_config(), Vec::new(), true).unwrap();
        let mut pipeline = Pipeline::compose(vec![source(), augment]).unwrap();
        let batch = pipeline.dequeue().await.unwrap();
        assert_eq!(batch.get(IMAGES).unwrap().dtype(), DType::U8);
        pipeline.shutdown().await;
    }
}
