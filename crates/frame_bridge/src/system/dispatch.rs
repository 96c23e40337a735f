/// Inbound message routing: request dispatch and channel publish/wait
use super::core::HostBridge;
use super::handlers::RequestContext;
use super::stats::StatsCounters;
use crate::error::BridgeError;
use crate::message::{ChannelMessage, ReplyMessage, RequestMessage};
use crate::transport::FrameId;
use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::Poll;
use tracing::{debug, error, info, trace, warn};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not addressed to any layer of this bridge (malformed, unknown tag,
    /// or the bridge is shutting down)
    Ignored,
    /// A handler ran and its reply was handed to the source frame
    Replied,
    /// A handler ran but the reply could not be delivered
    ReplyFailed,
    /// Consumed by the notification channel layer
    Channel,
}

/// The messages of one frame that are being handled.
///
/// Each message is started in arrival order and runs until it first
/// suspends before the next one is started. From then on they make progress
/// together, so a slow handler only holds back its own reply. Transport
/// pumps own one of these per frame and keep polling
/// [`FrameDispatch::next_finished`] while they wait for the next message.
#[derive(Default)]
pub struct FrameDispatch {
    in_flight: FuturesUnordered<BoxFuture<'static, DispatchOutcome>>,
}

impl fmt::Debug for FrameDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDispatch")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl FrameDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts handling `message` from `source`. Returns the outcome if it
    /// finished without suspending.
    pub async fn start(
        &mut self,
        bridge: Arc<HostBridge>,
        source: FrameId,
        message: Value,
    ) -> Option<DispatchOutcome> {
        let mut handling: BoxFuture<'static, DispatchOutcome> =
            Box::pin(async move { bridge.handle_message(&source, message).await });
        match futures::poll!(&mut handling) {
            Poll::Ready(outcome) => Some(outcome),
            Poll::Pending => {
                self.in_flight.push(handling);
                None
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Drives the messages in flight and yields the next outcome. `None` once
    /// nothing is in flight.
    pub async fn next_finished(&mut self) -> Option<DispatchOutcome> {
        self.in_flight.next().await
    }

    /// Waits for everything in flight. Returns how many messages finished.
    pub async fn finish(mut self) -> usize {
        let mut finished = 0;
        while self.in_flight.next().await.is_some() {
            finished += 1;
        }
        finished
    }
}

/// Prefix identifying the originating frame in logs and notifications.
pub(crate) fn log_prefix(frame: &FrameId) -> String {
    format!("[frame {}] ", frame)
}

impl HostBridge {
    /// Entry point for every message a frame posts to the host.
    ///
    /// Channel messages go to the channel layer, everything else to
    /// [`HostBridge::dispatch`]. Neither layer claims the other's tags, so
    /// they coexist on one transport.
    ///
    /// Callers feed one frame's messages through here one at a time, in
    /// arrival order: a frame that publishes and then waits on the same
    /// channel must not be released by its own publish. Different frames
    /// are handled concurrently.
    pub async fn handle_message(&self, source: &FrameId, message: Value) -> DispatchOutcome {
        if self.shutdown.is_shutdown_initiated() {
            trace!("Dropping message from {} during shutdown", source);
            return DispatchOutcome::Ignored;
        }

        if let Some(channel_message) = ChannelMessage::from_value(&message) {
            self.handle_channel_message(source, channel_message).await;
            return DispatchOutcome::Channel;
        }

        self.dispatch(source, message).await
    }

    /// Runs the handler registered for a correlated request and replies.
    ///
    /// - Malformed message or unknown tag: ignored, no reply.
    /// - Known tag: exactly one reply to `source`, carrying the request's uid,
    ///   whether the handler succeeded, failed, or panicked. Failures are
    ///   logged and shown through the notifier; their reply has no result.
    pub async fn dispatch(&self, source: &FrameId, message: Value) -> DispatchOutcome {
        let Some(request) = RequestMessage::from_value(&message) else {
            StatsCounters::bump(&self.stats.ignored_messages);
            trace!("Ignoring non-request message from {}", source);
            return DispatchOutcome::Ignored;
        };

        let Some(handler) = self
            .handlers
            .get(request.request.as_str())
            .map(|entry| Arc::clone(entry.value()))
        else {
            StatsCounters::bump(&self.stats.ignored_messages);
            trace!("No handler for '{}' from {}", request.request, source);
            return DispatchOutcome::Ignored;
        };

        StatsCounters::bump(&self.stats.requests_dispatched);
        debug!(
            "📨 Dispatching '{}' (uid {}) from {} to {}",
            request.request,
            request.uid,
            source,
            handler.handler_name()
        );

        let tag = request.request.clone();
        let callback = request.callback_name();
        let uid = request.uid;
        let ctx = RequestContext {
            frame: source.clone(),
            uid,
        };

        let result = match AssertUnwindSafe(handler.handle(ctx, request)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.report_failure(source, &tag, &format!("{}: {}", e.kind(), e));
                None
            }
            Err(panic) => {
                self.report_failure(source, &tag, &format!("Panic: {}", panic_message(&*panic)));
                None
            }
        };

        let reply = ReplyMessage {
            request: callback,
            uid,
            result,
        };
        let delivered = match serde_json::to_value(&reply) {
            Ok(value) => self.post_to(source, value).await,
            Err(e) => Err(BridgeError::Serialization(e)),
        };

        match delivered {
            Ok(()) => {
                StatsCounters::bump(&self.stats.replies_sent);
                DispatchOutcome::Replied
            }
            Err(e) => {
                warn!("{}Reply to '{}' (uid {}) was not delivered: {}", log_prefix(source), tag, uid, e);
                DispatchOutcome::ReplyFailed
            }
        }
    }

    /// Releases every waiter on `channel` with `data`.
    ///
    /// Returns how many waiters were reached. With no waiters this is a
    /// no-op; the data is not kept for later waiters.
    pub async fn publish(&self, channel: &str, data: Vec<Value>) -> usize {
        StatsCounters::bump(&self.stats.notifications_published);
        let waiters = self.channels.take(channel);
        if waiters.is_empty() {
            debug!("Publish to '{}' had no waiters", channel);
            return 0;
        }

        let message = match serde_json::to_value(ChannelMessage::NotifyCallback {
            channel: channel.to_string(),
            data: data.clone(),
        }) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode notification for channel '{}': {}", channel, e);
                return 0;
            }
        };

        let deliveries = waiters.into_iter().map(|waiter| {
            let message = message.clone();
            let data = data.clone();
            async move {
                match waiter {
                    crate::channel::Waiter::Frame(frame) => match self.post_to(&frame, message).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Waiter {} on '{}' not reachable: {}", frame, channel, e);
                            false
                        }
                    },
                    crate::channel::Waiter::Local(tx) => tx.send(data).is_ok(),
                }
            }
        });
        let released = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();

        self.stats
            .waiters_released
            .fetch_add(released as u64, std::sync::atomic::Ordering::Relaxed);
        released
    }

    /// Host-side publish with the `/notify-all` argument convention: a list
    /// is spread into the data, any other value is sent as a single element,
    /// and no value sends nothing.
    pub async fn notify_all(&self, channel: &str, data: Option<Value>) -> usize {
        let data = match data {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(value) => vec![value],
        };
        self.publish(channel, data).await
    }

    /// Waits host-side for the next publish on `channel`.
    pub async fn wait(&self, channel: &str) -> Result<Vec<Value>, BridgeError> {
        self.channels
            .wait_local(channel)
            .await
            .map_err(|_| BridgeError::Closed)
    }

    async fn handle_channel_message(&self, source: &FrameId, message: ChannelMessage) {
        match message {
            ChannelMessage::NotifyAll { channel, data } => {
                let released = self.publish(&channel, data).await;
                info!(
                    "{}Published to channel '{}', released {} waiter(s)",
                    log_prefix(source),
                    channel,
                    released
                );
            }
            ChannelMessage::Wait { channel } => {
                self.channels.wait_frame(&channel, source.clone());
            }
            ChannelMessage::NotifyCallback { channel, .. } => {
                trace!("Ignoring notify callback for '{}' sent to the host by {}", channel, source);
            }
        }
    }

    fn report_failure(&self, source: &FrameId, request: &str, message: &str) {
        StatsCounters::bump(&self.stats.handler_failures);
        let prefix = log_prefix(source);
        error!("{}Handler for '{}' failed: {}", prefix, request, message);
        self.notifier.error(&prefix, message);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
