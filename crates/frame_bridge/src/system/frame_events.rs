//! Frame event listeners
//!
//! A frame subscribes one of its functions, named by `listener_uid`, to a
//! host event. The host keeps one [`HostEvents`] registration per frame,
//! listener uid and event type, and forwards every delivery into the frame
//! as an `iframe_event_callback` message. Each frame has one forwarding task,
//! so a frame sees its callbacks in emission order.
//!
//! Subscriptions die with the frame: disconnecting or detaching it, the
//! frame closing its end, and bridge shutdown all remove them.

use super::core::HostBridge;
use crate::error::HandlerError;
use crate::events::ListenerId;
use crate::message::{Command, EventCallback};
use crate::transport::FrameId;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One frame function listening to one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub event_type: String,
    pub listener_uid: u64,
    /// Source of the listener; echoed back in callbacks and shown in logs
    #[serde(default)]
    pub listener_string: String,
}

impl ListenerEntry {
    pub fn new(event_type: impl Into<String>, listener_uid: u64, listener_string: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            listener_uid,
            listener_string: listener_string.into(),
        }
    }
}

/// `iframe_event_on`: listen to every emission. Ignored if already listening.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventOn(pub ListenerEntry);

impl Command for EventOn {
    const TAG: &'static str = "iframe_event_on";
    type Output = ();
}

/// `iframe_event_once`: listen to the next emission only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventOnce(pub ListenerEntry);

impl Command for EventOnce {
    const TAG: &'static str = "iframe_event_once";
    type Output = ();
}

/// `iframe_event_make_first`: listen, or move an existing listener, ahead of
/// every other listener of the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMakeFirst(pub ListenerEntry);

impl Command for EventMakeFirst {
    const TAG: &'static str = "iframe_event_make_first";
    type Output = ();
}

/// `iframe_event_make_last`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMakeLast(pub ListenerEntry);

impl Command for EventMakeLast {
    const TAG: &'static str = "iframe_event_make_last";
    type Output = ();
}

/// `iframe_event_remove_listener`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRemoveListener(pub ListenerEntry);

impl Command for EventRemoveListener {
    const TAG: &'static str = "iframe_event_remove_listener";
    type Output = ();
}

/// `iframe_event_emit`: emits `event_type` on the host with `data` as the
/// argument list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventEmit {
    pub event_type: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl Command for EventEmit {
    const TAG: &'static str = "iframe_event_emit";
    type Output = ();
}

/// `iframe_event_clear_event`: drops this frame's listeners of one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventClearEvent {
    pub event_type: String,
}

impl Command for EventClearEvent {
    const TAG: &'static str = "iframe_event_clear_event";
    type Output = ();
}

/// `iframe_event_clear_listener`: drops every event one listener listens to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventClearListener {
    pub listener_uid: u64,
    #[serde(default)]
    pub listener_string: String,
}

impl Command for EventClearListener {
    const TAG: &'static str = "iframe_event_clear_listener";
    type Output = ();
}

/// `iframe_event_clear_all`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventClearAll {}

impl Command for EventClearAll {
    const TAG: &'static str = "iframe_event_clear_all";
    type Output = ();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Append,
    Once,
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListenerKey {
    uid: u64,
    event: CompactString,
}

impl ListenerKey {
    fn new(uid: u64, event: &str) -> Self {
        Self {
            uid,
            event: CompactString::new(event),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    id: ListenerId,
    /// Tells a once-listener's own entry apart from a later one under the same key
    token: u64,
}

struct FrameSubscriptions {
    outbox: mpsc::UnboundedSender<Value>,
    listeners: HashMap<ListenerKey, Subscription>,
}

impl FrameSubscriptions {
    /// Spawns the task posting this frame's callbacks in order. The entry
    /// stays until the frame's listeners are dropped as a whole; the task
    /// ends once it and every registered listener are gone.
    fn spawn(bridge: Weak<HostBridge>, frame: FrameId) -> Self {
        let (outbox, mut queue) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let Some(bridge) = bridge.upgrade() else {
                    break;
                };
                if let Err(e) = bridge.post_to(&frame, message).await {
                    debug!("Event callback for frame {} not delivered: {}", frame, e);
                }
            }
            debug!("Event forwarder for frame {} finished", frame);
        });
        Self {
            outbox,
            listeners: HashMap::new(),
        }
    }
}

/// Host event subscriptions held on behalf of frames.
#[derive(Default)]
pub(crate) struct FrameListeners {
    frames: DashMap<FrameId, FrameSubscriptions>,
    next_token: AtomicU64,
}

impl FrameListeners {
    pub(crate) fn total(&self) -> usize {
        self.frames.iter().map(|entry| entry.listeners.len()).sum()
    }

    /// Drops a fired once-listener's entry unless it was replaced meanwhile.
    fn forget(&self, frame: &FrameId, key: &ListenerKey, token: u64) {
        if let Some(mut subscriptions) = self.frames.get_mut(frame) {
            if subscriptions.listeners.get(key).is_some_and(|sub| sub.token == token) {
                subscriptions.listeners.remove(key);
            }
        }
    }

    /// Removes the frame's subscriptions matching `filter` and returns them.
    fn take_where<F>(&self, frame: &FrameId, filter: F) -> Vec<(ListenerKey, Subscription)>
    where
        F: Fn(&ListenerKey) -> bool,
    {
        let Some(mut subscriptions) = self.frames.get_mut(frame) else {
            return Vec::new();
        };
        let keys: Vec<ListenerKey> = subscriptions.listeners.keys().filter(|key| filter(key)).cloned().collect();
        let mut taken = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(sub) = subscriptions.listeners.remove(&key) {
                taken.push((key, sub));
            }
        }
        taken
    }
}

impl std::fmt::Debug for FrameListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameListeners")
            .field("frames", &self.frames.len())
            .field("listeners", &self.total())
            .finish()
    }
}

/// Callback arguments for an emitted payload.
fn event_args(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// First line of a listener's source, for logs.
fn listener_name(listener_string: &str) -> &str {
    listener_string.lines().next().unwrap_or_default()
}

type Handled = Ready<Result<(), HandlerError>>;

impl HostBridge {
    /// Registers the `iframe_event_*` request handlers.
    pub fn register_event_handlers(self: &Arc<Self>) {
        self.register_frame_op(|bridge, frame, EventOn(entry)| bridge.listen(frame, entry, Placement::Append));
        self.register_frame_op(|bridge, frame, EventOnce(entry)| bridge.listen(frame, entry, Placement::Once));
        self.register_frame_op(|bridge, frame, EventMakeFirst(entry)| bridge.listen(frame, entry, Placement::First));
        self.register_frame_op(|bridge, frame, EventMakeLast(entry)| bridge.listen(frame, entry, Placement::Last));
        self.register_frame_op(|bridge, frame, EventRemoveListener(entry)| {
            bridge.remove_frame_listener(frame, &entry)
        });
        self.register_frame_op(|bridge, frame, command: EventEmit| {
            let delivered = bridge.events.emit_value(&command.event_type, &Value::Array(command.data));
            info!(
                "📣 [frame {}] Emitted '{}' to {} listener(s)",
                frame, command.event_type, delivered
            );
        });
        self.register_frame_op(|bridge, frame, command: EventClearEvent| {
            let removed = bridge.unsubscribe(frame, |key| key.event == command.event_type.as_str());
            info!(
                "🧹 [frame {}] Cleared {} listener(s) of '{}'",
                frame, removed, command.event_type
            );
        });
        self.register_frame_op(|bridge, frame, command: EventClearListener| {
            let removed = bridge.unsubscribe(frame, |key| key.uid == command.listener_uid);
            info!(
                "🧹 [frame {}] Listener stopped listening to {} event(s): {}",
                frame,
                removed,
                listener_name(&command.listener_string)
            );
        });
        self.register_frame_op(|bridge, frame, _: EventClearAll| {
            let removed = bridge.drop_frame_listeners(frame);
            info!("🧹 [frame {}] Cleared all {} event listener(s)", frame, removed);
        });
    }

    /// Number of host event listeners `frame` holds.
    pub fn frame_listener_count(&self, frame: &FrameId) -> usize {
        self.frame_listeners
            .frames
            .get(frame)
            .map(|subscriptions| subscriptions.listeners.len())
            .unwrap_or(0)
    }

    /// Removes every host event listener `frame` holds. Returns how many.
    pub fn drop_frame_listeners(&self, frame: &FrameId) -> usize {
        let Some((_, subscriptions)) = self.frame_listeners.frames.remove(frame) else {
            return 0;
        };
        for (key, sub) in &subscriptions.listeners {
            self.events.off(&key.event, sub.id);
        }
        subscriptions.listeners.len()
    }

    pub(super) fn drop_all_frame_listeners(&self) -> usize {
        let frames: Vec<FrameId> = self
            .frame_listeners
            .frames
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        frames.iter().map(|frame| self.drop_frame_listeners(frame)).sum()
    }

    /// Registers a synchronous request handler acting for the requesting frame.
    fn register_frame_op<C, F>(self: &Arc<Self>, op: F)
    where
        C: Command<Output = ()>,
        F: Fn(&Arc<HostBridge>, &FrameId, C) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        self.register_command::<C, _, Handled>(move |ctx, command| {
            if let Some(bridge) = weak.upgrade() {
                op(&bridge, &ctx.frame, command);
            }
            ready(Ok(()))
        });
    }

    fn listen(self: &Arc<Self>, frame: &FrameId, entry: ListenerEntry, placement: Placement) {
        let key = ListenerKey::new(entry.listener_uid, &entry.event_type);
        let name = listener_name(&entry.listener_string);

        let mut subscriptions = self
            .frame_listeners
            .frames
            .entry(frame.clone())
            .or_insert_with(|| FrameSubscriptions::spawn(Arc::downgrade(self), frame.clone()));

        if let Some(existing) = subscriptions.listeners.get(&key) {
            match placement {
                Placement::Append | Placement::Once => {
                    warn!(
                        "🟡 [frame {}] Listener already listens to '{}', ignored: {}",
                        frame, entry.event_type, name
                    );
                }
                Placement::First => {
                    self.events.make_first(&entry.event_type, existing.id);
                    info!("[frame {}] Listener now runs first on '{}': {}", frame, entry.event_type, name);
                }
                Placement::Last => {
                    self.events.make_last(&entry.event_type, existing.id);
                    info!("[frame {}] Listener now runs last on '{}': {}", frame, entry.event_type, name);
                }
            }
            return;
        }

        let token = self.frame_listeners.next_token.fetch_add(1, Ordering::Relaxed);
        let once = placement == Placement::Once;
        let outbox = subscriptions.outbox.clone();
        let table = Arc::downgrade(&self.frame_listeners);
        let owner = frame.clone();
        let forget_key = key.clone();
        let event_type = entry.event_type.clone();
        let listener_uid = entry.listener_uid;
        let listener_string = entry.listener_string.clone();
        let deliver = move |payload: &Value| {
            if once {
                if let Some(table) = table.upgrade() {
                    table.forget(&owner, &forget_key, token);
                }
            }
            let callback = EventCallback {
                event_type: event_type.clone(),
                listener_uid,
                listener_string: listener_string.clone(),
                args: event_args(payload),
            };
            // The forwarder is gone only once the frame's listeners are dropped.
            let _ = outbox.send(callback.to_value());
        };

        let id = if once {
            self.events.once_raw(&entry.event_type, deliver)
        } else {
            self.events.on_raw(&entry.event_type, deliver)
        };
        if placement == Placement::First {
            self.events.make_first(&entry.event_type, id);
        }
        subscriptions.listeners.insert(key, Subscription { id, token });
        drop(subscriptions);

        info!(
            "👂 [frame {}] Listening to '{}' ({:?}): {}",
            frame, entry.event_type, placement, name
        );
    }

    fn remove_frame_listener(&self, frame: &FrameId, entry: &ListenerEntry) {
        let removed = self.unsubscribe(frame, |key| {
            key.uid == entry.listener_uid && key.event == entry.event_type.as_str()
        });
        if removed == 0 {
            warn!(
                "🟡 [frame {}] Listener does not listen to '{}', ignored: {}",
                frame,
                entry.event_type,
                listener_name(&entry.listener_string)
            );
        } else {
            info!(
                "[frame {}] Listener stopped listening to '{}': {}",
                frame,
                entry.event_type,
                listener_name(&entry.listener_string)
            );
        }
    }

    fn unsubscribe<F>(&self, frame: &FrameId, filter: F) -> usize
    where
        F: Fn(&ListenerKey) -> bool,
    {
        let taken = self.frame_listeners.take_where(frame, filter);
        for (key, sub) in &taken {
            self.events.off(&key.event, sub.id);
        }
        taken.len()
    }
}
