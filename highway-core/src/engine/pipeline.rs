//! Linear chain of stages
//!
//! Stage `i` is the sole consumer of stage `i - 1`'s channel. A full channel
//! blocks its producers, so backpressure travels upstream on its own.

use std::time::Duration;
use tracing::info;

use super::stage::{Stage, WorkerExit};
use crate::error::{HighwayError, Result};
use crate::tensor::Batch;

/// A started, linearly connected list of stages
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Wire each stage to its predecessor, then start them in order
    pub fn compose(mut stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(HighwayError::config("pipeline needs at least one stage"));
        }

        for i in 1..stages.len() {
            let upstream = stages[i - 1].output();
            stages[i].attach(upstream)?;
        }
        for stage in &mut stages {
            stage.start()?;
        }

        info!(
            stages = ?stages.iter().map(Stage::name).collect::<Vec<_>>(),
            "Pipeline started"
        );
        Ok(Self { stages })
    }

    /// Read the next batch from the last stage, using its timeout
    pub async fn dequeue(&self) -> Result<Batch> {
        let last = self.last();
        last.dequeue(last.config().timeout()).await
    }

    /// Read the next batch from the last stage with an explicit timeout
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Result<Batch> {
        self.last().dequeue(timeout).await
    }

    /// Request stop on every stage without waiting
    pub fn stop(&self) {
        for stage in &self.stages {
            stage.stop();
        }
    }

    /// Stop every stage, then wait for all workers to exit
    pub async fn shutdown(&mut self) -> Vec<(String, Vec<WorkerExit>)> {
        self.stop();
        let mut report = Vec::with_capacity(self.stages.len());
        for stage in &mut self.stages {
            let exits = stage.join().await;
            report.push((stage.name().to_string(), exits));
        }
        info!("Pipeline shut down");
        report
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn last(&self) -> &Stage {
        // compose guarantees at least one stage
        &self.stages[self.stages.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{StageConfig, StageWorker, WorkerContext};
    use crate::tensor::{Tensor, IMAGES};
    use async_trait::async_trait;

    struct Source(i64);

    #[async_trait]
    impl StageWorker for Source {
        async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
            self.0 += 1;
            ctx.enqueue(Batch::new().with(IMAGES, Tensor::full(vec![1], self.0))).await
        }
    }

    struct Double;

    #[async_trait]
    impl StageWorker for Double {
        async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
            let batch = ctx.dequeue().await?;
            let value = batch.require(IMAGES)?.to_vec::<i64>()?[0];
            ctx.enqueue(Batch::new().with(IMAGES, Tensor::full(vec![1], value * 2))).await
        }
    }

    fn config() -> StageConfig {
        StageConfig::default()
            .with_queue_capacity(4)
            .with_timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_empty_pipeline_rejected() {
        assert!(Pipeline::compose(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_two_stage_chain() {
        let source = Stage::configure("source", config(), |_| Source(0)).unwrap();
        let double = Stage::configure("double", config(), |_| Double).unwrap();
        let mut pipeline = Pipeline::compose(vec![source, double]).unwrap();

        for i in 1..=10i64 {
            let batch = pipeline.dequeue().await.unwrap();
            assert_eq!(batch.get(IMAGES).unwrap().to_vec::<i64>().unwrap(), vec![2 * i]);
        }

        let report = pipeline.shutdown().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|(_, exits)| exits.iter().all(WorkerExit::is_clean)));
    }
}
