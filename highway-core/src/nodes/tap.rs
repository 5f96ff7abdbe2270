//! Tap stage
//!
//! Hands every batch to a caller-supplied dump function, e.g. to write
//! images to disk or log summaries, then optionally forwards it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::Result;
use crate::tensor::Batch;

/// Consumes one batch; runs on the blocking pool
pub type Dump = Arc<dyn Fn(&Batch) -> Result<()> + Send + Sync>;

/// Worker feeding batches to a [`Dump`]
///
/// A terminal tap (`forward == false`) drops batches after dumping them,
/// so nothing can be dequeued downstream of it. A dump error ends the
/// worker.
pub struct Tap {
    dump: Dump,
    forward: bool,
}

impl Tap {
    pub fn new(dump: Dump, forward: bool) -> Self {
        Self { dump, forward }
    }

    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        dump: Dump,
        forward: bool,
    ) -> Result<Stage> {
        Stage::configure(name, stage, move |_| Tap::new(dump.clone(), forward))
    }
}

#[async_trait]
impl StageWorker for Tap {
    async fn setup(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        debug!(
            stage = ctx.stage(),
            worker = ctx.index(),
            forward = self.forward,
            "Tap ready"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        let batch = ctx.dequeue().await?;
        let dump = self.dump.clone();
        let batch = ctx.run_blocking(move |_| dump(&batch).map(|()| batch)).await??;
        if self.forward {
            ctx.enqueue(batch).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Pipeline, WorkerExit};
    use crate::error::HighwayError;
    use crate::nodes::generator::{Fill, Generator, GeneratorConfig};
    use crate::tensor::{DType, IMAGES};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn stage_config() -> StageConfig {
        StageConfig::default()
            .with_queue_capacity(4)
            .with_timeout(Duration::from_millis(10))
    }

    fn source() -> Stage {
        let config = GeneratorConfig {
            shape: vec![2, 2, 1],
            batch_size: 3,
            dtype: DType::U8,
            fill: Fill::Constant(4.0),
            ..GeneratorConfig::default()
        };
        Generator::stage("source", stage_config(), config).unwrap()
    }

    fn counting(calls: Arc<AtomicUsize>) -> Dump {
        Arc::new(move |batch: &Batch| {
            assert_eq!(batch.get(IMAGES).unwrap().shape(), &[3, 2, 2, 1]);
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_forwarding_tap_passes_batches_on() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tap = Tap::stage("dump", stage_config(), counting(calls.clone()), true).unwrap();
        let mut pipeline = Pipeline::compose(vec![source(), tap]).unwrap();

        for _ in 0..3 {
            let batch = pipeline.dequeue().await.unwrap();
            assert!(batch.get(IMAGES).unwrap().data().iter().all(|&b| b == 4));
        }
        assert!(calls.load(Ordering::SeqCst) >= 3);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_tap_swallows_batches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tap = Tap::stage("dump", stage_config(), counting(calls.clone()), false).unwrap();
        let mut pipeline = Pipeline::compose(vec![source(), tap]).unwrap();

        let start = Instant::now();
        while calls.load(Ordering::SeqCst) < 5 {
            assert!(start.elapsed() < Duration::from_secs(5), "tap never dumped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let output = pipeline.stage("dump").unwrap().output();
        assert!(output.pop_timeout(Duration::from_millis(50)).await.is_err());

        for (_, exits) in pipeline.shutdown().await {
            assert!(exits.iter().all(WorkerExit::is_clean), "{:?}", exits);
        }
    }

    #[tokio::test]
    async fn test_dump_error_crashes_worker() {
        let dump: Dump = Arc::new(|_: &Batch| Err(HighwayError::message("disk full")));
        let tap = Tap::stage("dump", stage_config(), dump, true).unwrap();
        let mut pipeline = Pipeline::compose(vec![source(), tap]).unwrap();

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pipeline.stage("dump").unwrap().alive_workers() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(exited.is_ok(), "tap worker kept running");

        let results = pipeline.shutdown().await;
        let (_, tap_exits) = results.iter().find(|(name, _)| name == "dump").unwrap();
        assert!(matches!(tap_exits[0], WorkerExit::Crashed(_)), "{:?}", tap_exits);
    }
}
