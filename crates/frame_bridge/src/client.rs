//! # Frame Client
//!
//! The frame side of the protocol. [`FrameClient::send_correlated`] is the
//! correlation primitive: it stamps an outbound request with a fresh
//! [`Uid`], parks a one-shot slot under that uid, posts the request, and
//! resolves with the `result` of the first reply whose uid *and* tag match.
//!
//! There is no timeout. A request whose reply never arrives stays pending
//! until the client shuts down or its inbound channel closes, at which point
//! it fails with [`BridgeError::Closed`]. [`FrameClient::call_timeout`] is
//! the explicit opt-in for callers that cannot wait forever.
//!
//! The client also speaks the notification channel protocol:
//! [`FrameClient::notify_all`] publishes and [`FrameClient::wait`] parks until
//! the host relays the next publish on a channel.
//!
//! Host events a frame subscribed to arrive as `iframe_event_callback`
//! messages; [`FrameClient::event_callbacks`] hands them to the frame.

use crate::error::BridgeError;
use crate::message::{callback_name, ChannelMessage, Command, EventCallback, RequestMessage, Uid, UidGenerator};
use crate::transport::{FrameId, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct PendingCall {
    reply_name: String,
    tx: oneshot::Sender<Option<Value>>,
}

type ChannelWaits = HashMap<String, VecDeque<oneshot::Sender<Vec<Value>>>>;

#[derive(Debug)]
struct ClientInner {
    frame: FrameId,
    transport: Arc<dyn Transport>,
    uids: UidGenerator,
    pending: DashMap<Uid, PendingCall>,
    waits: Mutex<ChannelWaits>,
    events: Mutex<Option<mpsc::UnboundedSender<EventCallback>>>,
    closed: AtomicBool,
}

impl ClientInner {
    fn lock_waits(&self) -> std::sync::MutexGuard<'_, ChannelWaits> {
        self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders fails every parked call and wait with Closed.
        let calls = self.pending.len();
        self.pending.clear();
        let mut waits = self.lock_waits();
        let parked: usize = waits.values().map(VecDeque::len).sum();
        waits.clear();
        drop(waits);
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        calls + parked
    }
}

struct PendingSlot<'a> {
    inner: &'a ClientInner,
    uid: Uid,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.uid);
    }
}

/// A frame's handle on the host. Cheap to clone; clones share pending calls.
#[derive(Debug, Clone)]
pub struct FrameClient {
    inner: Arc<ClientInner>,
}

impl FrameClient {
    pub fn new(frame: FrameId, transport: Arc<dyn Transport>) -> Self {
        Self::with_uid_generator(frame, transport, UidGenerator::new())
    }

    pub fn with_uid_generator(frame: FrameId, transport: Arc<dyn Transport>, uids: UidGenerator) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                frame,
                transport,
                uids,
                pending: DashMap::new(),
                waits: Mutex::new(HashMap::new()),
                events: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn frame(&self) -> &FrameId {
        &self.inner.frame
    }

    /// Feeds everything arriving in `inbox` to [`FrameClient::receive`].
    ///
    /// The pump only holds a weak reference, so it ends once every clone of
    /// the client is dropped. When the inbox closes the client is shut down.
    pub fn spawn_pump(&self, mut inbox: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                FrameClient { inner }.receive(message);
            }
            if let Some(inner) = weak.upgrade() {
                let dropped = inner.close();
                debug!("Inbox of frame {} closed, failed {} pending operation(s)", inner.frame, dropped);
            }
        })
    }

    /// Handles one inbound message. Returns true if it resolved a pending
    /// call or channel wait.
    ///
    /// A reply only resolves the call whose uid it carries, and only if its
    /// tag is that call's callback name. Everything else is left for other
    /// listeners on the same transport.
    pub fn receive(&self, message: Value) -> bool {
        if let Some(ChannelMessage::NotifyCallback { channel, data }) = ChannelMessage::from_value(&message) {
            return self.release_wait(&channel, data);
        }
        if let Some(callback) = EventCallback::from_value(&message) {
            return self.deliver_event(callback);
        }

        let Some(reply) = RequestMessage::from_value(&message) else {
            return false;
        };
        let Some((_, call)) = self
            .inner
            .pending
            .remove_if(&reply.uid, |_, call| call.reply_name == reply.request)
        else {
            trace!("Frame {} ignoring '{}' (uid {})", self.inner.frame, reply.request, reply.uid);
            return false;
        };

        let result = reply.payload.get("result").cloned();
        // The caller may have stopped waiting; that is not an error here.
        call.tx.send(result).is_ok()
    }

    /// Sends `request` with a fresh uid and waits for its reply's `result`.
    ///
    /// `Ok(None)` means the reply carried no result: the handler returned
    /// nothing, or it failed and the host reported the failure out of band.
    pub async fn send_correlated(
        &self,
        request: &str,
        payload: Map<String, Value>,
    ) -> Result<Option<Value>, BridgeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Closed);
        }

        let uid = self.inner.uids.next_uid();
        let (tx, rx) = oneshot::channel();
        match self.inner.pending.entry(uid) {
            Entry::Occupied(_) => {
                warn!("Frame {} generated uid {} twice", self.inner.frame, uid);
                return Err(BridgeError::UidCollision(uid));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    reply_name: callback_name(request),
                    tx,
                });
            }
        }
        // Removes the slot if this future is dropped or fails before the reply.
        let _slot = PendingSlot {
            inner: &self.inner,
            uid,
        };

        let message = serde_json::to_value(RequestMessage::new(request, uid, payload))?;
        self.inner.transport.post(message).await?;
        trace!("Frame {} sent '{}' (uid {})", self.inner.frame, request, uid);

        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Sends a typed command and decodes its result.
    pub async fn call<C: Command>(&self, command: &C) -> Result<Option<C::Output>, BridgeError> {
        let payload = match serde_json::to_value(command)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        match self.send_correlated(C::TAG, payload).await? {
            None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// [`FrameClient::call`] bounded by `limit`. On timeout the pending slot
    /// is released, so a late reply is ignored.
    pub async fn call_timeout<C: Command>(
        &self,
        command: &C,
        limit: Duration,
    ) -> Result<Option<C::Output>, BridgeError> {
        tokio::time::timeout(limit, self.call(command))
            .await
            .map_err(|_| BridgeError::Timeout(C::TAG.to_string()))?
    }

    /// Publishes `data` on `channel` through the host. Fire-and-forget.
    pub async fn notify_all(&self, channel: &str, data: Vec<Value>) -> Result<(), BridgeError> {
        let message = serde_json::to_value(ChannelMessage::NotifyAll {
            channel: channel.to_string(),
            data,
        })?;
        self.inner.transport.post(message).await
    }

    /// Waits for the next publish on `channel` and returns its data.
    pub async fn wait(&self, channel: &str) -> Result<Vec<Value>, BridgeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .lock_waits()
            .entry(channel.to_string())
            .or_default()
            .push_back(tx);

        let message = serde_json::to_value(ChannelMessage::Wait {
            channel: channel.to_string(),
        })?;
        if let Err(e) = self.inner.transport.post(message).await {
            // Our entry is the newest one for this channel.
            if let Some(queue) = self.inner.lock_waits().get_mut(channel) {
                queue.pop_back();
            }
            return Err(e);
        }

        rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Correlated calls still waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Channel waits still parked.
    pub fn pending_waits(&self) -> usize {
        self.inner.lock_waits().values().map(VecDeque::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fails every pending call and wait with [`BridgeError::Closed`] and
    /// refuses new ones.
    pub fn shutdown(&self) {
        let dropped = self.inner.close();
        debug!("Frame client {} shut down, {} pending operation(s) failed", self.inner.frame, dropped);
    }

    /// Starts collecting the host events this frame subscribed to. Calling it
    /// again replaces the previous receiver. Callbacks arriving while nobody
    /// collects are dropped.
    pub fn event_callbacks(&self) -> mpsc::UnboundedReceiver<EventCallback> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        rx
    }

    fn deliver_event(&self, callback: EventCallback) -> bool {
        let sink = self.inner.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        match sink {
            Some(tx) => tx.send(callback).is_ok(),
            None => {
                trace!(
                    "Frame {} dropping '{}' for listener {}",
                    self.inner.frame,
                    callback.event_type,
                    callback.listener_uid
                );
                false
            }
        }
    }

    fn release_wait(&self, channel: &str, data: Vec<Value>) -> bool {
        let waiter = {
            let mut waits = self.inner.lock_waits();
            let waiter = waits.get_mut(channel).and_then(VecDeque::pop_front);
            if waits.get(channel).is_some_and(VecDeque::is_empty) {
                waits.remove(channel);
            }
            waiter
        };
        match waiter {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    fn recording_client() -> (FrameClient, RecordingTransport) {
        let transport = RecordingTransport::default();
        let client = FrameClient::new(FrameId::from("test"), Arc::new(transport.clone()));
        (client, transport)
    }

    async fn sent_uid(transport: &RecordingTransport, index: usize) -> u64 {
        for _ in 0..50 {
            if let Some(message) = transport.messages().get(index) {
                return message["uid"].as_u64().unwrap();
            }
            tokio::task::yield_now().await;
        }
        panic!("message {index} was never sent");
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_call() {
        let (client, transport) = recording_client();
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.send_correlated("getX", Map::new()).await });

        let uid = sent_uid(&transport, 0).await;
        assert_eq!(transport.messages()[0]["request"], "getX");

        assert!(client.receive(json!({"request": "getX_callback", "uid": uid, "result": 5})));
        assert_eq!(call.await.unwrap().unwrap(), Some(json!(5)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_reply_with_wrong_tag_is_ignored() {
        let (client, transport) = recording_client();
        let caller = client.clone();
        let _call = tokio::spawn(async move { caller.send_correlated("getX", Map::new()).await });

        let uid = sent_uid(&transport, 0).await;
        assert!(!client.receive(json!({"request": "getY_callback", "uid": uid, "result": 1})));
        assert_eq!(client.pending_calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_calls_resolve_independently() {
        let (client, transport) = recording_client();
        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.send_correlated("op", Map::new()).await })
        };
        let uid_a = sent_uid(&transport, 0).await;
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.send_correlated("op", Map::new()).await })
        };
        let uid_b = sent_uid(&transport, 1).await;
        assert_ne!(uid_a, uid_b);

        client.receive(json!({"request": "op_callback", "uid": uid_b, "result": "b"}));
        assert_eq!(second.await.unwrap().unwrap(), Some(json!("b")));
        assert_eq!(client.pending_calls(), 1);
        assert!(!first.is_finished());

        client.receive(json!({"request": "op_callback", "uid": uid_a, "result": "a"}));
        assert_eq!(first.await.unwrap().unwrap(), Some(json!("a")));
    }

    #[tokio::test]
    async fn test_reply_without_result_is_none() {
        let (client, transport) = recording_client();
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.send_correlated("doThing", Map::new()).await });

        let uid = sent_uid(&transport, 0).await;
        client.receive(json!({"request": "doThing_callback", "uid": uid}));
        assert_eq!(call.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_calls() {
        let (client, transport) = recording_client();
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.send_correlated("never", Map::new()).await });
        sent_uid(&transport, 0).await;

        client.shutdown();
        assert!(matches!(call.await.unwrap(), Err(BridgeError::Closed)));
        assert!(matches!(
            client.send_correlated("again", Map::new()).await,
            Err(BridgeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_uid_collision_is_an_error() {
        let transport = RecordingTransport::default();
        let client = FrameClient::with_uid_generator(
            FrameId::from("a"),
            Arc::new(transport.clone()),
            UidGenerator::starting_at(100),
        );
        let (tx, _rx) = oneshot::channel();
        client.inner.pending.insert(
            Uid(100),
            PendingCall {
                reply_name: "op_callback".to_string(),
                tx,
            },
        );

        assert!(matches!(
            client.send_correlated("op", Map::new()).await,
            Err(BridgeError::UidCollision(Uid(100)))
        ));
        // The colliding request is never posted and the original slot survives.
        assert!(transport.messages().is_empty());
        assert_eq!(client.pending_calls(), 1);
    }

    #[tokio::test]
    async fn test_notify_callback_releases_waits_in_order() {
        let (client, transport) = recording_client();
        let a = {
            let client = client.clone();
            tokio::spawn(async move { client.wait("ready").await })
        };
        while transport.messages().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.messages()[0], json!({"request": "iframe_wait", "channel": "ready"}));
        assert_eq!(client.pending_waits(), 1);

        assert!(client.receive(json!({"request": "iframe_notify_callback", "channel": "ready", "data": ["go"]})));
        assert_eq!(a.await.unwrap().unwrap(), vec![json!("go")]);
        assert!(!client.receive(json!({"request": "iframe_notify_callback", "channel": "ready", "data": []})));
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Command for Add {
        const TAG: &'static str = "add";
        type Output = i64;
    }

    #[tokio::test]
    async fn test_typed_call_encodes_payload_fields() {
        let (client, transport) = recording_client();
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call(&Add { a: 2, b: 3 }).await });

        let uid = sent_uid(&transport, 0).await;
        let sent = &transport.messages()[0];
        assert_eq!(sent["request"], "add");
        assert_eq!(sent["a"], 2);
        assert_eq!(sent["b"], 3);

        client.receive(json!({"request": "add_callback", "uid": uid, "result": 5}));
        assert_eq!(call.await.unwrap().unwrap(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_releases_pending_slot() {
        let (client, transport) = recording_client();
        let result = client.call_timeout(&Add { a: 1, b: 1 }, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(BridgeError::Timeout(tag)) if tag == "add"));
        assert_eq!(client.pending_calls(), 0);

        let uid = transport.messages()[0]["uid"].as_u64().unwrap();
        assert!(!client.receive(json!({"request": "add_callback", "uid": uid, "result": 2})));
    }

    #[tokio::test]
    async fn test_event_callbacks_reach_the_collector() {
        let (client, _transport) = recording_client();
        let callback = json!({
            "request": "iframe_event_callback",
            "event_type": "chat_changed",
            "listener_uid": 4,
            "listener_string": "f",
            "args": ["b"],
        });
        assert!(!client.receive(callback.clone()));

        let mut events = client.event_callbacks();
        assert!(client.receive(callback));
        let received = events.recv().await.unwrap();
        assert_eq!(received.listener_uid, 4);
        assert_eq!(received.args, vec![json!("b")]);

        client.shutdown();
        assert!(events.recv().await.is_none());
    }
}
