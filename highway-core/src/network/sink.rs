//! Network sink: forwards upstream batches to a remote source

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::frame::write_frame;
use super::{Endpoint, NetworkConfig};
use crate::codec;
use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::Result;
use crate::metrics::standard;

/// Push side of a link
///
/// A failed send drops the batch in flight and replaces the connection;
/// nothing is retried.
pub struct NetworkSink {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
}

impl NetworkSink {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config),
            stream: None,
        }
    }

    /// Build a sink stage; a link carries exactly one worker
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        config: NetworkConfig,
    ) -> Result<Stage> {
        config.validate()?;
        if stage.workers != 1 {
            debug!(requested = stage.workers, "Network sink runs a single worker");
        }
        Stage::configure(name, stage.with_workers(1), move |_| {
            NetworkSink::new(config.clone())
        })
    }
}

#[async_trait]
impl StageWorker for NetworkSink {
    async fn setup(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        self.endpoint.open().await
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.endpoint.establish(ctx).await?,
        };

        let batch = match ctx.dequeue().await {
            Ok(batch) => batch,
            Err(e) => {
                self.stream = Some(stream);
                return Err(e);
            }
        };
        let payload = codec::encode_batch(&batch)?;

        match write_frame(&mut stream, &payload, ctx.timeout(), ctx.stop_token()).await {
            Ok(()) => {
                standard::BYTES_SENT.inc_by(payload.len() as u64);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) if e.is_stopped() => Err(e),
            Err(e) => {
                warn!(
                    address = self.endpoint.address(),
                    error = %e,
                    "Send failed, dropping batch and reconnecting"
                );
                standard::BATCHES_DROPPED.inc();
                Ok(())
            }
        }
    }

    async fn close(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        self.stream = None;
        debug!(address = self.endpoint.address(), "Network sink closed");
        Ok(())
    }
}
