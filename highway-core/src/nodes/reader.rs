//! Generic sample reader
//!
//! Assembles batches from a key list through a caller-supplied loader.
//! Loads are memoized per worker in a [`FifoCache`]; every worker of a
//! stage records into one shared statistics handle.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{FifoCache, SharedCacheStats};
use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::{HighwayError, Result};
use crate::tensor::{Batch, Sample, Tensor, KEYS};

/// Turns a key into one sample; runs on the blocking pool
pub type Loader = Arc<dyn Fn(&str) -> Result<Sample> + Send + Sync>;

/// Order in which keys are visited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadOrder {
    /// Independent uniform draws (with replacement)
    #[default]
    Random,
    /// Walk the key list, restarting at the end unless `once` is set
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub batch_size: usize,
    pub order: ReadOrder,
    /// Stop emitting after one sequential pass
    pub once: bool,
    /// Samples memoized per worker
    pub cache_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            order: ReadOrder::Random,
            once: false,
            cache_capacity: 1024,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HighwayError::config("reader batch size must be at least 1"));
        }
        if self.cache_capacity == 0 {
            return Err(HighwayError::config("reader cache capacity must be at least 1"));
        }
        if self.once && self.order == ReadOrder::Random {
            return Err(HighwayError::config("once mode needs sequential order"));
        }
        Ok(())
    }
}

/// Worker reading samples for a slice of the key list
///
/// In sequential order worker `i` of `n` visits keys `i, i + n, i + 2n, ..`
/// so a stage covers each key once per pass.
pub struct SampleReader {
    keys: Arc<[String]>,
    loader: Loader,
    config: ReaderConfig,
    stats: SharedCacheStats,
    /// Created in `setup`
    cache: Option<FifoCache<usize, Sample>>,
    /// Next position in this worker's sequential slice
    cursor: usize,
    finished: bool,
}

impl SampleReader {
    pub fn new(
        keys: Arc<[String]>,
        loader: Loader,
        config: ReaderConfig,
        stats: SharedCacheStats,
    ) -> Self {
        Self {
            keys,
            loader,
            config,
            stats,
            cache: None,
            cursor: 0,
            finished: false,
        }
    }

    /// Build a reader stage; returns the stage and its cache statistics
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        keys: Vec<String>,
        loader: Loader,
        config: ReaderConfig,
    ) -> Result<(Stage, SharedCacheStats)> {
        config.validate()?;
        if keys.is_empty() {
            return Err(HighwayError::config("reader needs at least one key"));
        }
        if config.order == ReadOrder::Sequential && keys.len() < stage.workers {
            return Err(HighwayError::config(format!(
                "{} keys cannot be split across {} sequential workers",
                keys.len(),
                stage.workers
            )));
        }

        let keys: Arc<[String]> = keys.into();
        let stats = SharedCacheStats::default();
        let shared = stats.clone();
        let stage = Stage::configure(name, stage, move |_| {
            SampleReader::new(keys.clone(), loader.clone(), config.clone(), shared.clone())
        })?;
        Ok((stage, stats))
    }

    /// Pick the key indices of the next batch; empty once a single pass is done
    fn next_indices(&mut self, ctx: &mut WorkerContext) -> Vec<usize> {
        let n = self.keys.len();
        match self.config.order {
            ReadOrder::Random => (0..self.config.batch_size)
                .map(|_| ctx.rng().gen_range(0..n))
                .collect(),
            ReadOrder::Sequential => {
                let stride = ctx.workers();
                let mut indices = Vec::with_capacity(self.config.batch_size);
                while indices.len() < self.config.batch_size {
                    let idx = ctx.index() + self.cursor * stride;
                    if idx >= n {
                        if self.config.once {
                            info!(
                                stage = ctx.stage(),
                                worker = ctx.index(),
                                "Reader finished its pass"
                            );
                            self.finished = true;
                            break;
                        }
                        self.cursor = 0;
                        continue;
                    }
                    indices.push(idx);
                    self.cursor += 1;
                }
                indices
            }
        }
    }
}

#[async_trait]
impl StageWorker for SampleReader {
    async fn setup(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        self.cache = Some(FifoCache::with_stats(self.config.cache_capacity, self.stats.clone())?);
        debug!(
            stage = ctx.stage(),
            worker = ctx.index(),
            keys = self.keys.len(),
            order = ?self.config.order,
            "Reader ready"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        if self.finished {
            // Single pass done: idle until stopped
            tokio::time::sleep(ctx.timeout()).await;
            return ctx.stop_token().check();
        }

        let indices = self.next_indices(ctx);
        if indices.is_empty() {
            return Ok(());
        }
        let cache = self
            .cache
            .as_mut()
            .ok_or_else(|| HighwayError::Internal {
                message: "reader stepped before setup".to_string(),
            })?;

        // one counted lookup per requested sample
        let mut slots: Vec<Option<Sample>> = indices.iter().map(|i| cache.get(i)).collect();
        let mut missing: Vec<usize> = indices
            .iter()
            .zip(&slots)
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| *i)
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if !missing.is_empty() {
            let keys = self.keys.clone();
            let loader = self.loader.clone();
            let fresh = ctx
                .run_blocking(move |_| {
                    missing
                        .into_iter()
                        .map(|idx| loader(&keys[idx]).map(|sample| (idx, sample)))
                        .collect::<Result<Vec<_>>>()
                })
                .await??;
            for (idx, slot) in indices.iter().zip(slots.iter_mut()) {
                if slot.is_none() {
                    *slot = fresh.iter().find(|(i, _)| i == idx).map(|(_, sample)| sample.clone());
                }
            }
            for (idx, sample) in fresh {
                cache.set(idx, sample);
            }
        }

        let samples = slots
            .into_iter()
            .zip(&indices)
            .map(|(slot, idx)| {
                slot.ok_or_else(|| HighwayError::Internal {
                    message: format!("sample {} was neither cached nor loaded", idx),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut batch = Batch::from_samples(&samples)?;
        let ids: Vec<i64> = indices.iter().map(|i| *i as i64).collect();
        batch.insert(KEYS, Tensor::from_vec(vec![ids.len()], ids)?);
        ctx.enqueue(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Sample, IMAGES};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sample-{}", i)).collect()
    }

    fn counting_loader(calls: Arc<AtomicUsize>) -> Loader {
        Arc::new(move |key: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            let id: u8 = key.trim_start_matches("sample-").parse().unwrap_or(0);
            Ok(Sample::new().with(IMAGES, Tensor::full(vec![2, 2, 1], id)))
        })
    }

    fn stage_config() -> StageConfig {
        StageConfig::default()
            .with_queue_capacity(4)
            .with_timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_sequential_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ReaderConfig {
            batch_size: 2,
            order: ReadOrder::Sequential,
            once: true,
            cache_capacity: 8,
        };
        let loader = counting_loader(calls.clone());
        let (mut stage, stats) =
            SampleReader::stage("reader", stage_config(), keys(5), loader, config).unwrap();
        stage.start().unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = stage.dequeue(Duration::from_secs(1)).await.unwrap();
            seen.extend(batch.get(KEYS).unwrap().to_vec::<i64>().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let none = stage.output().pop_timeout(Duration::from_millis(50)).await;
        assert!(none.is_err());

        stage.stop();
        stage.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let stats = stats.lock();
        assert_eq!(stats.misses, 5);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_stats_count_each_lookup_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ReaderConfig {
            batch_size: 3,
            order: ReadOrder::Sequential,
            once: true,
            cache_capacity: 1,
        };
        let loader = counting_loader(calls.clone());
        let (mut stage, stats) =
            SampleReader::stage("reader", stage_config(), keys(3), loader, config).unwrap();
        stage.start().unwrap();

        let batch = stage.dequeue(Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.get(KEYS).unwrap().to_vec::<i64>().unwrap(), vec![0, 1, 2]);
        let images = batch.get(IMAGES).unwrap().to_vec::<u8>().unwrap();
        assert_eq!(images, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);

        stage.stop();
        stage.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = stats.lock();
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.evictions, 2);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_reads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ReaderConfig {
            batch_size: 3,
            order: ReadOrder::Sequential,
            once: false,
            cache_capacity: 8,
        };
        let loader = counting_loader(calls.clone());
        let (mut stage, stats) =
            SampleReader::stage("reader", stage_config(), keys(3), loader, config).unwrap();
        stage.start().unwrap();

        for _ in 0..4 {
            let batch = stage.dequeue(Duration::from_secs(1)).await.unwrap();
            assert_eq!(batch.get(IMAGES).unwrap().shape(), &[3, 2, 2, 1]);
        }
        stage.stop();
        stage.join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = stats.lock();
        assert_eq!(stats.misses, 3);
        assert!(stats.hits >= 9);
    }

    #[tokio::test]
    async fn test_random_order_is_seeded() {
        let config = ReaderConfig {
            batch_size: 4,
            ..ReaderConfig::default()
        };
        let mut runs = Vec::new();
        for _ in 0..2 {
            let calls = Arc::new(AtomicUsize::new(0));
            let (mut stage, _) = SampleReader::stage(
                "reader",
                stage_config().with_seed(11),
                keys(10),
                counting_loader(calls),
                config.clone(),
            )
            .unwrap();
            stage.start().unwrap();
            runs.push(stage.dequeue(Duration::from_secs(1)).await.unwrap());
            stage.stop();
            stage.join().await;
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn test_once_requires_sequential() {
        let config = ReaderConfig {
            once: true,
            ..ReaderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
