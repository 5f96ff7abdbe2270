//! Push/pull transport between processes
//!
//! A [`NetworkSink`] stage forwards every upstream batch over TCP; a
//! [`NetworkSource`] stage on the other end decodes them into its own
//! channel. Either side may bind; the other connects. Delivery is
//! at-most-once and FIFO within one connection.

pub mod frame;
pub mod sink;
pub mod source;

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::engine::WorkerContext;
use crate::error::{HighwayError, Result};

pub use frame::{FrameRead, FrameReader, DEFAULT_MAX_FRAME};
pub use sink::NetworkSink;
pub use source::NetworkSource;

/// One end of a push/pull link
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` to bind or connect to
    pub address: String,
    /// Listen on `address` instead of connecting to it
    pub bind: bool,
    /// Largest accepted payload in bytes
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5555".to_string(),
            bind: false,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl NetworkConfig {
    pub fn bind(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            bind: true,
            ..Self::default()
        }
    }

    pub fn connect(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            bind: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(HighwayError::config("network address must not be empty"));
        }
        if self.max_frame_bytes == 0 {
            return Err(HighwayError::config("max frame size must be positive"));
        }
        Ok(())
    }
}

/// Connection management shared by sink and source
///
/// The binding side serves one peer at a time and goes back to accepting
/// after that peer disconnects. The connecting side retries at the stage
/// timeout.
struct Endpoint {
    config: NetworkConfig,
    listener: Option<TcpListener>,
}

impl Endpoint {
    fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
        }
    }

    fn address(&self) -> &str {
        &self.config.address
    }

    /// Bind the listener if this side binds
    async fn open(&mut self) -> Result<()> {
        if self.config.bind {
            let listener = TcpListener::bind(&self.config.address)
                .await
                .map_err(|e| HighwayError::ConnectionFailed {
                    endpoint: self.config.address.clone(),
                    reason: e.to_string(),
                })?;
            info!(address = %self.config.address, "Listening");
            self.listener = Some(listener);
        }
        Ok(())
    }

    /// Wait for a peer, checking stop after every timeout
    async fn establish(&mut self, ctx: &WorkerContext) -> Result<TcpStream> {
        loop {
            let attempt = match &self.listener {
                Some(listener) => {
                    tokio::time::timeout(ctx.timeout(), async {
                        listener.accept().await.map(|(stream, peer)| {
                            info!(address = %self.config.address, peer = %peer, "Peer connected");
                            stream
                        })
                    })
                    .await
                }
                None => {
                    let connect = TcpStream::connect(&self.config.address);
                    tokio::time::timeout(ctx.timeout(), connect).await
                }
            };

            match attempt {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Could not disable Nagle");
                    }
                    if self.listener.is_none() {
                        info!(address = %self.config.address, "Connected");
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    let err = HighwayError::ConnectionFailed {
                        endpoint: self.config.address.clone(),
                        reason: e.to_string(),
                    };
                    if self.listener.is_some() {
                        warn!(error = %err, "Accept failed");
                    } else {
                        debug!(error = %err, "Connect failed, retrying");
                    }
                    // refused connects return at once; wait before retrying
                    tokio::time::sleep(ctx.timeout()).await;
                    ctx.stop_token().check()?;
                }
                Err(_) => ctx.stop_token().check()?,
            }
        }
    }
}
