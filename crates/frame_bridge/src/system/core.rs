/// Core HostBridge implementation
use super::frame_events::FrameListeners;
use super::handlers::RequestHandler;
use super::stats::{BridgeStats, StatsCounters};
use crate::channel::ChannelHub;
use crate::events::HostEvents;
use crate::notify::{LogNotifier, Notifier};
use crate::shutdown::ShutdownState;
use crate::transport::{FrameId, Transport};
use compact_str::CompactString;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// The host side of the bridge.
///
/// Owns the request handler table, the connected frames' transports, the
/// notification channel waiters and the statistics. Every inbound frame
/// message ends up in [`HostBridge::handle_message`], which routes it to the
/// channel layer or to the request dispatcher.
///
/// All tables are concurrent maps, so the bridge can be shared behind an
/// `Arc` and messages dispatched from independent tasks. Handlers therefore
/// interleave at their await points; nothing serializes one request's
/// read-modify-write against another's.
pub struct HostBridge {
    /// Request tag → handler
    pub(super) handlers: DashMap<CompactString, Arc<dyn RequestHandler>>,
    /// Frame → transport posting back into that frame
    pub(super) frames: DashMap<FrameId, Arc<dyn Transport>>,
    /// Notification channel waiters
    pub(super) channels: ChannelHub,
    /// Host-level event emitter shared with the variable store and scripts
    pub(super) events: Arc<HostEvents>,
    /// Host event listeners registered on behalf of frames
    pub(super) frame_listeners: Arc<FrameListeners>,
    /// Where handler failures are surfaced
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) stats: StatsCounters,
    pub(super) shutdown: ShutdownState,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("handlers", &self.handlers.len())
            .field("frames", &self.frames.len())
            .field("waiters", &self.channels.total_waiters())
            .field("frame_listeners", &self.frame_listeners.total())
            .field("shutdown", &self.shutdown.is_shutdown_initiated())
            .finish()
    }
}

impl HostBridge {
    pub fn new(events: Arc<HostEvents>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            handlers: DashMap::new(),
            frames: DashMap::new(),
            channels: ChannelHub::new(),
            events,
            frame_listeners: Arc::new(FrameListeners::default()),
            notifier,
            stats: StatsCounters::default(),
            shutdown: ShutdownState::new(),
        }
    }

    /// A bridge with its own event emitter that reports failures to the log.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(HostEvents::new()), Arc::new(LogNotifier))
    }

    pub fn events(&self) -> &Arc<HostEvents> {
        &self.events
    }

    pub fn channels(&self) -> &ChannelHub {
        &self.channels
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.snapshot(
            self.handlers.len(),
            self.frames.len(),
            self.channels.total_waiters(),
        )
    }

    /// Stops accepting messages and releases every per-frame resource.
    ///
    /// Channel waiters are dropped (host-side waiters observe
    /// [`crate::BridgeError::Closed`]), host event listeners held for frames
    /// are removed, frame transports are released so their pumps wind down,
    /// and the handler table is emptied.
    pub fn shutdown(&self) {
        if self.shutdown.is_shutdown_initiated() {
            return;
        }
        self.shutdown.initiate_shutdown();

        let waiters = self.channels.clear();
        let listeners = self.drop_all_frame_listeners();
        let frames = self.frames.len();
        self.frames.clear();
        self.clear_handlers();

        info!(
            "🔌 Bridge shut down: released {} frame(s), {} channel waiter(s) and {} event listener(s)",
            frames, waiters, listeners
        );
        self.shutdown.complete_shutdown();
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::with_defaults()
    }
}
