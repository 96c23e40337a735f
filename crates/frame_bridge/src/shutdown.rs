//! Shutdown coordination.
//!
//! The bridge stops dispatching inbound messages as soon as shutdown is
//! initiated; completion is flagged once pending state has been flushed.

use crate::error::BridgeError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared shutdown flags, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true once no new messages should be dispatched.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Fails with [`BridgeError::ShuttingDown`] once shutdown has begun.
    pub fn ensure_running(&self) -> Result<(), BridgeError> {
        if self.is_shutdown_initiated() {
            Err(BridgeError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    pub fn initiate_shutdown(&self) {
        self.shutdown_initiated.store(true, Ordering::Release);
        info!("🛑 Shutdown initiated - inbound frame messages will be dropped");
    }

    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        info!("✅ Bridge state flushed - ready for final cleanup");
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flags() {
        let state = ShutdownState::new();
        let observer = state.clone();
        assert!(observer.ensure_running().is_ok());

        state.initiate_shutdown();
        assert!(observer.is_shutdown_initiated());
        assert!(matches!(observer.ensure_running(), Err(BridgeError::ShuttingDown)));
        assert!(!observer.is_shutdown_complete());

        state.complete_shutdown();
        assert!(observer.is_shutdown_complete());
    }
}
