//! # Notification Channels
//!
//! Named rendezvous points. A waiter registers interest in a channel; the
//! next publish to that channel releases every waiter registered so far and
//! forgets them. Nothing is buffered: a publish with no waiters is dropped.
//!
//! The waiter table is a multimap from channel name to destinations. A frame
//! that waits twice on the same channel holds two independent entries and is
//! released twice by one publish.
//!
//! [`ChannelHub`] only owns the table. Delivery to frames needs a transport
//! and lives on [`crate::HostBridge::publish`].

use crate::transport::FrameId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Where a released waiter's data goes.
#[derive(Debug)]
pub enum Waiter {
    /// A child frame; released by posting an `iframe_notify_callback`.
    Frame(FrameId),
    /// Host-side code awaiting the channel directly.
    Local(oneshot::Sender<Vec<Value>>),
}

/// The channel → waiters multimap.
#[derive(Debug, Default)]
pub struct ChannelHub {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a frame as waiting on `channel`.
    pub fn wait_frame(&self, channel: &str, frame: FrameId) {
        debug!("Frame {} waiting on channel '{}'", frame, channel);
        self.push(channel, Waiter::Frame(frame));
    }

    /// Registers a host-side waiter and returns the receiving half.
    pub fn wait_local(&self, channel: &str) -> oneshot::Receiver<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        self.push(channel, Waiter::Local(tx));
        rx
    }

    /// Removes and returns every waiter currently registered on `channel`.
    ///
    /// Taking is a single critical section: a waiter registered after this
    /// returns belongs to the next publish.
    pub fn take(&self, channel: &str) -> Vec<Waiter> {
        self.lock().remove(channel).unwrap_or_default()
    }

    /// Drops every entry owned by `frame`. Returns how many were removed.
    pub fn drop_frame(&self, frame: &FrameId) -> usize {
        let mut table = self.lock();
        let mut removed = 0;
        table.retain(|_, waiters| {
            let before = waiters.len();
            waiters.retain(|waiter| !matches!(waiter, Waiter::Frame(owner) if owner == frame));
            removed += before - waiters.len();
            !waiters.is_empty()
        });
        removed
    }

    pub fn waiter_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map(Vec::len).unwrap_or(0)
    }

    pub fn total_waiters(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Forgets every waiter. Local waiters observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut table = self.lock();
        let count = table.values().map(Vec::len).sum();
        table.clear();
        count
    }

    fn push(&self, channel: &str, waiter: Waiter) {
        self.lock().entry(channel.to_string()).or_default().push(waiter);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Waiter>>> {
        // The table holds no invariants a panicking holder could break halfway.
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_flushes_channel() {
        let hub = ChannelHub::new();
        hub.wait_frame("ready", FrameId::from("a"));
        hub.wait_frame("ready", FrameId::from("b"));
        hub.wait_frame("other", FrameId::from("a"));

        assert_eq!(hub.take("ready").len(), 2);
        assert_eq!(hub.waiter_count("ready"), 0);
        assert_eq!(hub.waiter_count("other"), 1);
        assert!(hub.take("ready").is_empty());
    }

    #[test]
    fn test_repeated_waits_are_independent_entries() {
        let hub = ChannelHub::new();
        hub.wait_frame("ready", FrameId::from("a"));
        hub.wait_frame("ready", FrameId::from("a"));
        assert_eq!(hub.waiter_count("ready"), 2);
    }

    #[test]
    fn test_drop_frame_removes_only_its_entries() {
        let hub = ChannelHub::new();
        let doomed = FrameId::from("doomed");
        hub.wait_frame("x", doomed.clone());
        hub.wait_frame("y", doomed.clone());
        hub.wait_frame("y", FrameId::from("survivor"));
        let _local = hub.wait_local("x");

        assert_eq!(hub.drop_frame(&doomed), 2);
        assert_eq!(hub.waiter_count("x"), 1);
        assert_eq!(hub.waiter_count("y"), 1);
        assert_eq!(hub.total_waiters(), 2);
    }

    #[tokio::test]
    async fn test_cleared_local_waiter_sees_closed_channel() {
        let hub = ChannelHub::new();
        let rx = hub.wait_local("never");
        assert_eq!(hub.clear(), 1);
        assert!(rx.await.is_err());
    }
}
