//! Training-loop adapter
//!
//! Presents a pipeline as an endless stream of image tensors.

use crate::engine::Pipeline;
use crate::error::Result;
use crate::tensor::{Tensor, IMAGES};

/// Nominal epoch length reported to training loops
pub const SIZE_HINT: usize = 128;

/// Yields the `"images"` entry of every batch the pipeline produces
pub struct ImageStream {
    pipeline: Pipeline,
}

impl ImageStream {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Next image tensor; waits for the pipeline like [`Pipeline::dequeue`]
    pub async fn next(&mut self) -> Result<Tensor> {
        let batch = self.pipeline.dequeue().await?;
        Ok(batch.require(IMAGES)?.clone())
    }

    /// The stream is infinite; this is only a hint for progress reporting
    pub fn size(&self) -> usize {
        SIZE_HINT
    }

    /// Nothing to reset: the stream has no epoch state
    pub fn reset_state(&mut self) {}

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Give the pipeline back, e.g. to shut it down
    pub fn into_inner(self) -> Pipeline {
        self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StageConfig;
    use crate::nodes::{Fill, Generator, GeneratorConfig};
    use crate::tensor::DType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_yields_images() {
        let config = GeneratorConfig {
            shape: vec![4, 4, 3],
            batch_size: 2,
            dtype: DType::U8,
            fill: Fill::Constant(1.0),
            ..GeneratorConfig::default()
        };
        let stage_config = StageConfig::default().with_timeout(Duration::from_millis(10));
        let stage = Generator::stage("noise", stage_config, config).unwrap();
        let mut stream = ImageStream::new(Pipeline::compose(vec![stage]).unwrap());

        assert_eq!(stream.size(), 128);
        stream.reset_state();
        for _ in 0..3 {
            assert_eq!(stream.next().await.unwrap().shape(), &[2, 4, 4, 3]);
        }

        stream.into_inner().shutdown().await;
    }
}
