//! Store sink: disaggregates batches into per-sample records

use async_trait::async_trait;
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{debug, info};

use super::record::{self, parse_key, record_key};
use super::StoreConfig;
use crate::codec;
use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::{HighwayError, Result};
use crate::metrics::standard;

/// Appends every sample of every upstream batch under a fresh counter key
///
/// Reopening an existing store continues after its largest key, so keys
/// are never reused. Each batch is committed as one transaction.
pub struct StoreSink {
    config: StoreConfig,
    conn: Option<SqliteConnection>,
    next_key: u64,
}

impl StoreSink {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            conn: None,
            next_key: 0,
        }
    }

    /// Build a sink stage; a store is written by exactly one worker
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        config: StoreConfig,
    ) -> Result<Stage> {
        config.validate()?;
        if stage.workers != 1 {
            debug!(requested = stage.workers, "Store sink runs a single worker");
        }
        Stage::configure(name, stage.with_workers(1), move |_| {
            StoreSink::new(config.clone())
        })
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn.as_mut().ok_or_else(|| HighwayError::Internal {
            message: "store sink used before setup".to_string(),
        })
    }
}

#[async_trait]
impl StageWorker for StoreSink {
    async fn setup(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        let mut conn = record::connect(&self.config.path, true).await?;
        sqlx::query(record::CREATE_TABLE).execute(&mut conn).await?;

        let last = sqlx::query(record::LAST_KEY).fetch_optional(&mut conn).await?;
        self.next_key = match last {
            Some(row) => parse_key(row.try_get::<&str, _>("key")?)? + 1,
            None => 0,
        };

        info!(
            path = %self.config.path.display(),
            next_key = self.next_key,
            "Store opened for writing"
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        let batch = ctx.dequeue().await?;
        let size = batch.batch_size()?;

        let mut records = Vec::with_capacity(size);
        for index in 0..size {
            records.push(codec::encode_sample(&batch.sample(index)?)?);
        }

        let first = self.next_key;
        let conn = self.conn()?;
        let mut tx = conn.begin().await?;
        for (offset, value) in records.iter().enumerate() {
            sqlx::query(record::INSERT)
                .bind(record_key(first + offset as u64))
                .bind(&value[..])
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.next_key = first + size as u64;
        standard::RECORDS_WRITTEN.inc_by(size as u64);
        Ok(())
    }

    async fn close(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);").execute(&mut conn).await?;
            conn.close().await?;
        }
        info!(
            path = %self.config.path.display(),
            records = self.next_key,
            "Store closed"
        );
        Ok(())
    }
}
