/// Statistics tracking for the bridge
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the bridge's counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Number of registered request handlers
    pub registered_handlers: usize,
    /// Number of frames with a live transport
    pub connected_frames: usize,
    /// Channel waiters not yet released
    pub pending_waiters: usize,
    /// Requests that matched a handler
    pub requests_dispatched: u64,
    /// Replies successfully handed to a transport
    pub replies_sent: u64,
    /// Handlers that returned an error or panicked
    pub handler_failures: u64,
    /// Messages no layer claimed (malformed or unknown tag)
    pub ignored_messages: u64,
    /// Publish operations, including ones with no waiters
    pub notifications_published: u64,
    /// Waiters released by publishes
    pub waiters_released: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub requests_dispatched: AtomicU64,
    pub replies_sent: AtomicU64,
    pub handler_failures: AtomicU64,
    pub ignored_messages: AtomicU64,
    pub notifications_published: AtomicU64,
    pub waiters_released: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, handlers: usize, frames: usize, waiters: usize) -> BridgeStats {
        BridgeStats {
            registered_handlers: handlers,
            connected_frames: frames,
            pending_waiters: waiters,
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            ignored_messages: self.ignored_messages.load(Ordering::Relaxed),
            notifications_published: self.notifications_published.load(Ordering::Relaxed),
            waiters_released: self.waiters_released.load(Ordering::Relaxed),
        }
    }
}
