//! Cooperative stop signalling
//!
//! A [`StopToken`] is a shared flag. Workers never get interrupted: they
//! look at the flag only when a bounded wait expires, so a transform that is
//! already running always finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{HighwayError, Result};

/// Shared stop flag for every worker of one stage
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    /// Create a token in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop; returns immediately
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Stopped)` once stop has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(HighwayError::Stopped)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_token() {
        let token = StopToken::new();
        let observer = token.clone();

        let handle = tokio::spawn(async move {
            while !observer.is_stopped() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            42
        });

        assert!(token.check().is_ok());
        token.stop();

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
        assert!(matches!(token.check(), Err(HighwayError::Stopped)));
    }
}
