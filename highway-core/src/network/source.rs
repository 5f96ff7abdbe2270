//! Network source: receives batches from a remote sink

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::frame::{FrameRead, FrameReader};
use super::{Endpoint, NetworkConfig};
use crate::codec;
use crate::engine::{Stage, StageConfig, StageWorker, WorkerContext};
use crate::error::Result;
use crate::metrics::standard;

/// Pull side of a link
///
/// A payload that fails to decode ends the worker: it means the peers
/// disagree on the wire format.
pub struct NetworkSource {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    reader: FrameReader,
}

impl NetworkSource {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            reader: FrameReader::new(config.max_frame_bytes),
            endpoint: Endpoint::new(config),
            stream: None,
        }
    }

    /// Build a source stage; a link carries exactly one worker
    pub fn stage(
        name: impl Into<String>,
        stage: StageConfig,
        config: NetworkConfig,
    ) -> Result<Stage> {
        config.validate()?;
        if stage.workers != 1 {
            debug!(requested = stage.workers, "Network source runs a single worker");
        }
        Stage::configure(name, stage.with_workers(1), move |_| {
            NetworkSource::new(config.clone())
        })
    }

    fn disconnect(&mut self, reason: &str) {
        if self.reader.buffered() > 0 {
            warn!(
                address = self.endpoint.address(),
                bytes = self.reader.buffered(),
                "Discarding partial frame"
            );
        }
        info!(address = self.endpoint.address(), reason, "Peer disconnected");
        self.stream = None;
        self.reader.reset();
    }
}

#[async_trait]
impl StageWorker for NetworkSource {
    async fn setup(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        self.endpoint.open().await
    }

    async fn step(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        if self.stream.is_none() {
            self.stream = Some(self.endpoint.establish(ctx).await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        match self.reader.read_frame(stream, ctx.timeout()).await {
            Ok(FrameRead::Frame(payload)) => {
                standard::BYTES_RECEIVED.inc_by(payload.len() as u64);
                let batch = codec::decode_batch(payload)?;
                ctx.enqueue(batch).await
            }
            Ok(FrameRead::Timeout) => ctx.stop_token().check(),
            Ok(FrameRead::Eof) => {
                self.disconnect("end of stream");
                Ok(())
            }
            Err(e) if e.is_corruption() => Err(e),
            Err(e) => {
                self.disconnect(&e.to_string());
                Ok(())
            }
        }
    }

    async fn close(&mut self, _ctx: &mut WorkerContext) -> Result<()> {
        self.stream = None;
        debug!(address = self.endpoint.address(), "Network source closed");
        Ok(())
    }
}
