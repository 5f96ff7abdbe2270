//! Bounded batch channel between two stages
//!
//! Capacity-limited FIFO. Every wait is bounded by a timeout; the
//! stop-aware [`Channel::enqueue`] / [`Channel::dequeue`] retry after each
//! timeout until the caller's [`StopToken`] is set.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::shutdown::StopToken;
use crate::error::{HighwayError, Result};
use crate::metrics::standard;
use crate::tensor::Batch;

/// Failure of a single bounded push
#[derive(Debug)]
pub enum PushError {
    /// No room before the timeout; the batch is handed back
    Full(Batch),
    /// The receiving side is gone
    Closed(Batch),
}

/// Failure of a single bounded pop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived before the timeout
    Empty,
    /// Every sender is gone and the buffer is drained
    Closed,
}

/// Bounded FIFO of batches
///
/// Clones share the same queue. The owning stage writes; the single
/// downstream stage reads (its workers take turns on the receiver).
#[derive(Clone)]
pub struct Channel {
    sender: mpsc::Sender<Batch>,
    receiver: Arc<Mutex<mpsc::Receiver<Batch>>>,
    capacity: usize,
}

impl Channel {
    /// Create a channel holding at most `capacity` batches
    pub fn bounded(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(HighwayError::config("channel capacity must be at least 1"));
        }
        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches currently buffered
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push once, waiting at most `timeout` for room
    pub async fn push_timeout(
        &self,
        batch: Batch,
        timeout: Duration,
    ) -> std::result::Result<(), PushError> {
        match tokio::time::timeout(timeout, self.sender.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(batch);
                standard::BATCHES_ENQUEUED.inc();
                Ok(())
            }
            Ok(Err(_)) => Err(PushError::Closed(batch)),
            Err(_) => Err(PushError::Full(batch)),
        }
    }

    /// Pop once, waiting at most `timeout` for a batch
    pub async fn pop_timeout(&self, timeout: Duration) -> std::result::Result<Batch, PopError> {
        let received = tokio::time::timeout(timeout, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await;

        match received {
            Ok(Some(batch)) => {
                standard::BATCHES_DEQUEUED.inc();
                Ok(batch)
            }
            Ok(None) => Err(PopError::Closed),
            Err(_) => Err(PopError::Empty),
        }
    }

    /// Push, retrying after every timeout until `stop` is set
    pub async fn enqueue(&self, batch: Batch, timeout: Duration, stop: &StopToken) -> Result<()> {
        let mut batch = batch;
        loop {
            match self.push_timeout(batch, timeout).await {
                Ok(()) => return Ok(()),
                Err(PushError::Full(returned)) => {
                    stop.check()?;
                    batch = returned;
                }
                Err(PushError::Closed(_)) => return Err(HighwayError::ChannelClosed),
            }
        }
    }

    /// Pop, retrying after every timeout until `stop` is set
    pub async fn dequeue(&self, timeout: Duration, stop: &StopToken) -> Result<Batch> {
        loop {
            match self.pop_timeout(timeout).await {
                Ok(batch) => return Ok(batch),
                Err(PopError::Empty) => stop.check()?,
                Err(PopError::Closed) => return Err(HighwayError::ChannelClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Tensor, IMAGES};

    fn batch(value: i64) -> Batch {
        Batch::new().with(IMAGES, Tensor::full(vec![1], value))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let channel = Channel::bounded(8).unwrap();
        for i in 0..8 {
            channel.push_timeout(batch(i), Duration::from_millis(10)).await.unwrap();
        }
        assert_eq!(channel.len(), 8);
        for i in 0..8 {
            let b = channel.pop_timeout(Duration::from_millis(10)).await.unwrap();
            assert_eq!(b, batch(i));
        }
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        assert!(Channel::bounded(0).is_err());
    }

    #[tokio::test]
    async fn test_enqueue_aborts_when_stopped() {
        let channel = Channel::bounded(1).unwrap();
        let stop = StopToken::new();
        channel.enqueue(batch(0), Duration::from_millis(5), &stop).await.unwrap();

        stop.stop();
        let err = channel
            .enqueue(batch(1), Duration::from_millis(5), &stop)
            .await
            .unwrap_err();
        assert!(err.is_stopped());
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_retries_until_data_arrives() {
        let channel = Channel::bounded(1).unwrap();
        let stop = StopToken::new();
        let producer = channel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.push_timeout(batch(5), Duration::from_millis(10)).await.unwrap();
        });

        let b = channel.dequeue(Duration::from_millis(5), &stop).await.unwrap();
        assert_eq!(b, batch(5));
    }
}
