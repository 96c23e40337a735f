/// Frame registry: which frames are connected and how to reach them
use super::core::HostBridge;
use super::dispatch::FrameDispatch;
use crate::client::FrameClient;
use crate::error::BridgeError;
use crate::transport::{duplex, FrameId, Transport};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of a transport, comparable without keeping it alive.
fn transport_addr(transport: &Arc<dyn Transport>) -> usize {
    Arc::as_ptr(transport) as *const () as usize
}

impl HostBridge {
    /// Registers the transport that posts back into `frame`.
    ///
    /// Reconnecting a frame replaces its transport; the previous one is
    /// returned.
    pub fn connect_frame(&self, frame: FrameId, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        info!("🔗 Frame {} connected", frame);
        self.frames.insert(frame, transport)
    }

    /// Tears down everything the host holds for `frame`: its transport, every
    /// channel waiter it registered and its host event listeners.
    ///
    /// Returns false if the frame was not connected. Dropping the transport
    /// closes in-process frames, which fails their pending calls.
    pub fn disconnect_frame(&self, frame: &FrameId) -> bool {
        let removed = self.frames.remove(frame).is_some();
        let waiters = self.channels.drop_frame(frame);
        let listeners = self.drop_frame_listeners(frame);
        if removed || waiters > 0 || listeners > 0 {
            info!(
                "🔌 Frame {} disconnected ({} channel waiter(s), {} event listener(s) dropped)",
                frame, waiters, listeners
            );
        }
        removed
    }

    /// Alias of [`HostBridge::disconnect_frame`] for frames created through
    /// [`HostBridge::attach_frame`].
    pub fn detach_frame(&self, frame: &FrameId) -> bool {
        self.disconnect_frame(frame)
    }

    pub fn is_connected(&self, frame: &FrameId) -> bool {
        self.frames.contains_key(frame)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Connected frames, sorted by name.
    pub fn connected_frames(&self) -> Vec<FrameId> {
        let mut frames: Vec<FrameId> = self.frames.iter().map(|entry| entry.key().clone()).collect();
        frames.sort();
        frames
    }

    /// Posts a message into `frame`.
    pub async fn post_to(&self, frame: &FrameId, message: Value) -> Result<(), BridgeError> {
        // Clone out of the map so no shard lock is held across the await.
        let transport = self
            .frames
            .get(frame)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::UnknownFrame(frame.clone()))?;
        transport.post(message).await
    }

    /// Creates an in-process frame wired to this bridge and returns its client.
    ///
    /// Two pumps are spawned: the host side handles the frame's messages in
    /// the order they were posted, and the client side resolves
    /// replies and channel notifications. When the client is dropped the host
    /// pump disconnects the frame; when the frame is detached the client's
    /// pending calls fail with [`BridgeError::Closed`].
    pub fn attach_frame(self: &Arc<Self>, frame: FrameId) -> Result<FrameClient, BridgeError> {
        self.shutdown.ensure_running()?;

        let (host_port, frame_port) = duplex();
        let host_sink: Arc<dyn Transport> = Arc::new(host_port.sender);
        let sink_addr = transport_addr(&host_sink);
        self.connect_frame(frame.clone(), host_sink);

        let weak = Arc::downgrade(self);
        let mut inbox = host_port.inbox;
        let pump_frame = frame.clone();
        tokio::spawn(async move {
            let mut dispatch = FrameDispatch::new();
            loop {
                tokio::select! {
                    Some(_) = dispatch.next_finished(), if dispatch.in_flight() > 0 => {}
                    message = inbox.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        let Some(bridge) = weak.upgrade() else {
                            break;
                        };
                        dispatch.start(bridge, pump_frame.clone(), message).await;
                    }
                }
            }

            debug!("Host pump for frame {} finished", pump_frame);
            if let Some(bridge) = weak.upgrade() {
                // Only tear down if the frame was not reconnected meanwhile.
                let current = bridge
                    .frames
                    .remove_if(&pump_frame, |_, transport| transport_addr(transport) == sink_addr);
                if current.is_some() {
                    bridge.channels.drop_frame(&pump_frame);
                    bridge.drop_frame_listeners(&pump_frame);
                    info!("🔌 Frame {} closed its end, disconnected", pump_frame);
                }
            }
            dispatch.finish().await;
        });

        let client = FrameClient::new(frame, Arc::new(frame_port.sender));
        client.spawn_pump(frame_port.inbox);
        Ok(client)
    }
}
