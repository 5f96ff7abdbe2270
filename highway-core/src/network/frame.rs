//! Length-delimited framing
//!
//! A frame is a `u32` little-endian payload length followed by the payload.
//! [`FrameReader`] keeps partial frames across timeouts, so a receive that
//! gives up half way never desynchronizes the stream.

use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::engine::StopToken;
use crate::error::{HighwayError, Result};

/// Default upper bound on a single payload (1 GiB)
pub const DEFAULT_MAX_FRAME: usize = 1 << 30;

const HEADER_LEN: usize = 4;

/// Outcome of one bounded read
#[derive(Debug)]
pub enum FrameRead {
    /// A complete payload
    Frame(Bytes),
    /// Nothing complete before the timeout; partial data is kept
    Timeout,
    /// The peer closed the connection
    Eof,
}

/// Incremental frame decoder over an async byte stream
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_frame: usize,
}

impl FrameReader {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame,
        }
    }

    /// Split off one complete payload if the buffer holds it
    pub fn try_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = (&self.buf[..HEADER_LEN]).get_u32_le() as usize;
        if len > self.max_frame {
            return Err(HighwayError::message(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes held from an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Forget any partial frame (after the connection is replaced)
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Read until a frame completes, the timeout expires or the peer closes
    pub async fn read_frame<R>(&mut self, reader: &mut R, timeout: Duration) -> Result<FrameRead>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(FrameRead::Frame(frame));
            }
            // read_buf is cancel-safe: a timeout loses no bytes
            match tokio::time::timeout_at(deadline, reader.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => return Ok(FrameRead::Eof),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(FrameRead::Timeout),
            }
        }
    }
}

/// Write `data` fully, waiting at most `timeout` per chunk and checking
/// `stop` whenever a wait expires
pub async fn write_all_until_stopped<W>(
    writer: &mut W,
    mut data: &[u8],
    timeout: Duration,
    stop: &StopToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !data.is_empty() {
        match tokio::time::timeout(timeout, writer.write(data)).await {
            Ok(Ok(0)) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => stop.check()?,
        }
    }
    Ok(())
}

/// Send one payload as a frame
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    timeout: Duration,
    stop: &StopToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        HighwayError::message(format!(
            "payload of {} bytes is too large to frame",
            payload.len()
        ))
    })?;
    write_all_until_stopped(writer, &len.to_le_bytes(), timeout, stop).await?;
    write_all_until_stopped(writer, payload, timeout, stop).await?;
    writer.flush().await?;
    Ok(())
}
