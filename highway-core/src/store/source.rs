//! Store source: replays persisted samples as batches

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{debug, info};

use super::record;
use super::StoreConfig;
use crate::codec;
use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::{HighwayError, Result};
use crate::metrics::standard;
use crate::tensor::{Batch, Sample};

/// Scans records in key order and emits `batch_size` samples at a time
///
/// At the end of the store the scan wraps to the first key, completing the
/// current batch from the start (infinite replay). An empty store is polled
/// at the stage timeout.
///
/// The file is opened read-write (WAL needs the shared-memory index) but
/// never created, and the source only issues `SELECT`s, so it can scan a
/// store while a [`StoreSink`](super::StoreSink) is still appending to it.
pub struct StoreSource {
    config: StoreConfig,
    conn: Option<SqliteConnection>,
    /// Last key consumed; `None` restarts from the first record
    cursor: Option<String>,
    pending: Vec<Sample>,
}

impl StoreSource {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            pending: Vec::with_capacity(config.batch_size),
            config,
            conn: None,
            cursor: None,
        }
    }

    /// Build a source stage; a store is scanned by exactly one worker
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        config: StoreConfig,
    ) -> Result<Stage> {
        config.validate()?;
        if stage.workers != 1 {
            debug!(requested = stage.workers, "Store source runs a single worker");
        }
        Stage::configure(name, stage.with_workers(1), move |_| {
            StoreSource::new(config.clone())
        })
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn.as_mut().ok_or_else(|| HighwayError::Internal {
            message: "store source used before setup".to_string(),
        })
    }

    /// Check that a sample has the same keys, in order, as the batch so far
    fn check_keys(&self, key: &str, sample: &Sample) -> Result<()> {
        let Some(first) = self.pending.first() else {
            return Ok(());
        };
        if !first.entries().keys().eq(sample.entries().keys()) {
            return Err(HighwayError::CorruptRecord {
                key: key.to_string(),
                reason: format!(
                    "keys {:?} differ from {:?}",
                    sample.entries().keys().collect::<Vec<_>>(),
                    first.entries().keys().collect::<Vec<_>>()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StageWorker for StoreSource {
    async fn setup(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        if !self.config.path.exists() {
            return Err(HighwayError::StoreNotFound {
                path: self.config.path.display().to_string(),
            });
        }
        self.conn = Some(record::connect(&self.config.path, false).await?);
        info!(
            path = %self.config.path.display(),
            batch_size = self.config.batch_size,
            "Store opened for reading"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        let wanted = self.config.batch_size - self.pending.len();
        let after = self.cursor.clone().unwrap_or_default();

        let conn = self.conn()?;
        let table = sqlx::query(record::TABLE_EXISTS).fetch_optional(&mut *conn).await?;
        let rows = match table {
            Some(_) => {
                sqlx::query(record::SCAN)
                    .bind(after)
                    .bind(wanted as i64)
                    .fetch_all(&mut *conn)
                    .await?
            }
            None => Vec::new(),
        };

        if rows.is_empty() {
            if self.cursor.is_none() {
                // nothing stored yet
                tokio::time::sleep(ctx.timeout()).await;
                return ctx.stop_token().check();
            }
            debug!(path = %self.config.path.display(), "Store exhausted, replaying from start");
            standard::STORE_WRAPS.inc();
            self.cursor = None;
            return Ok(());
        }

        standard::RECORDS_READ.inc_by(rows.len() as u64);
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: Vec<u8> = row.try_get("value")?;
            let sample = codec::decode_sample(Bytes::from(value)).map_err(|e| {
                HighwayError::CorruptRecord {
                    key: key.clone(),
                    reason: e.to_string(),
                }
            })?;
            self.check_keys(&key, &sample)?;
            self.pending.push(sample);
            self.cursor = Some(key);
        }

        if self.pending.len() == self.config.batch_size {
            let batch = Batch::from_samples(&self.pending)?;
            self.pending.clear();
            ctx.enqueue(batch).await?;
        }
        Ok(())
    }

    async fn close(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        debug!(path = %self.config.path.display(), "Store source closed");
        Ok(())
    }
}
