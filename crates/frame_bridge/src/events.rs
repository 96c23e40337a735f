//! # Host Events
//!
//! A typed, named event emitter living in the host document. Variable scopes
//! announce their changes here, script buttons fire their click events here,
//! and the sync engine binds and unbinds its listeners here.
//!
//! Listeners are plain synchronous closures. A listener that needs to do
//! async work spawns it. Listeners run on the emitting task, after the
//! emitter has released its own table lock, so a listener may register or
//! remove other listeners freely.

use crate::error::BridgeError;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Fired when global variables (stored in host settings) were written.
pub const SETTINGS_UPDATED: &str = "settings_updated";
/// Fired with `{ variables }` when the active character's variables change.
pub const CHARACTER_VARIABLES_CHANGED: &str = "character_variables_changed";
/// Fired with `{ message_id, variables }` when a floor's active page data changes.
pub const MESSAGE_VARIABLES_CHANGED: &str = "message_variables_changed";
/// Fired with `{ character_id }` when the active character switches.
pub const CHARACTER_CHANGED: &str = "character_changed";
/// Fired with `{ character_id }` when a character record is deleted.
pub const CHARACTER_DELETED: &str = "character_deleted";
/// Fired when a different chat is opened.
pub const CHAT_CHANGED: &str = "chat_changed";

/// Handle returned by registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

/// Named event emitter with `on` / `once` / `off` / `emit`.
pub struct HostEvents {
    listeners: DashMap<CompactString, Vec<Registration>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HostEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEvents")
            .field("events", &self.listeners.len())
            .finish()
    }
}

impl HostEvents {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener receiving the raw JSON payload.
    pub fn on_raw<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, false, Arc::new(listener))
    }

    /// Registers a raw listener that is removed after its first delivery.
    pub fn once_raw<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, true, Arc::new(listener))
    }

    /// Registers a listener receiving a typed payload.
    ///
    /// Payloads that do not decode into `T` are skipped with a warning; the
    /// listener is not removed.
    pub fn on<T, F>(&self, event: &str, listener: F) -> ListenerId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(event, false, typed(event, listener))
    }

    /// Registers a typed listener that is removed after its first delivery.
    pub fn once<T, F>(&self, event: &str, listener: F) -> ListenerId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(event, true, typed(event, listener))
    }

    /// Removes a listener. Returns false if it was not registered (or a
    /// `once` listener already fired).
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut entry) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|registration| registration.id != id);
        let removed = entry.len() != before;
        let now_empty = entry.is_empty();
        drop(entry);

        if now_empty {
            self.listeners.remove_if(event, |_, list| list.is_empty());
        }
        removed
    }

    /// Moves a registered listener ahead of every other listener of `event`.
    pub fn make_first(&self, event: &str, id: ListenerId) -> bool {
        self.reposition(event, id, true)
    }

    /// Moves a registered listener behind every other listener of `event`.
    pub fn make_last(&self, event: &str, id: ListenerId) -> bool {
        self.reposition(event, id, false)
    }

    /// Serializes `payload` and delivers it to every listener of `event`.
    ///
    /// Returns how many listeners were invoked.
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<usize, BridgeError> {
        let value = serde_json::to_value(payload)?;
        Ok(self.emit_value(event, &value))
    }

    /// Delivers an already-built JSON payload.
    pub fn emit_value(&self, event: &str, payload: &Value) -> usize {
        let snapshot = {
            let Some(mut entry) = self.listeners.get_mut(event) else {
                trace!("No listeners for host event '{}'", event);
                return 0;
            };
            let snapshot = entry.clone();
            entry.retain(|registration| !registration.once);
            snapshot
        };

        for registration in &snapshot {
            (registration.listener)(payload);
        }
        trace!("Host event '{}' delivered to {} listener(s)", event, snapshot.len());
        snapshot.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|list| list.len()).unwrap_or(0)
    }

    fn reposition(&self, event: &str, id: ListenerId, first: bool) -> bool {
        let Some(mut entry) = self.listeners.get_mut(event) else {
            return false;
        };
        let Some(index) = entry.iter().position(|registration| registration.id == id) else {
            return false;
        };
        let registration = entry.remove(index);
        if first {
            entry.insert(0, registration);
        } else {
            entry.push(registration);
        }
        true
    }

    fn register(&self, event: &str, once: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(CompactString::new(event))
            .or_default()
            .push(Registration { id, once, listener });
        id
    }
}

impl Default for HostEvents {
    fn default() -> Self {
        Self::new()
    }
}

fn typed<T, F>(event: &str, listener: F) -> Listener
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let event = event.to_string();
    Arc::new(move |payload: &Value| match T::deserialize(payload) {
        Ok(decoded) => listener(decoded),
        Err(e) => warn!(
            "🟡 Listener for host event '{}' (expects '{}') skipped undecodable payload: {}",
            event,
            std::any::type_name::<T>(),
            e
        ),
    })
}
