//! # Variable Sync
//!
//! Keeps an observer in step with one variable scope. The service holds a
//! snapshot of the scope as last observed; on every change signal it diffs
//! the snapshot against the current value, reports each changed key to the
//! observer, and only then replaces the snapshot.
//!
//! ## Change signals per scope
//!
//! - `global`: `settings_updated`, then a re-read of the store
//! - `character`: `character_variables_changed` carries the new mapping and
//!   is used as-is; `character_changed` triggers a re-read
//! - `chat`: no event exists, so the service polls on a fixed interval
//! - `message`: `message_variables_changed` carries the floor and its
//!   mapping; snapshots are kept per floor and an unseen floor diffs against
//!   an empty mapping. `chat_changed` reseeds every floor.
//!
//! ## States
//!
//! ```text
//! Inactive --set_scope--> Bound(scope) --set_scope(other)--> Inactive --> Bound(other)
//!                              |
//!                          deactivate
//!                              v
//!                           Inactive
//! ```
//!
//! The new scope's snapshot is seeded before its listeners are bound, so the
//! first signal after a switch never reports the whole scope as added.
//!
//! All signals are processed one at a time by a single task that owns the
//! snapshots. Observers run on that task and may write variables back; the
//! resulting signal is queued behind the current one.

use super::diff::diff;
use super::scope::VariableScope;
use super::store::VariableStore;
use super::Variables;
use crate::events::{self, HostEvents, ListenerId};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// One changed key.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableChange {
    pub scope: VariableScope,
    pub key: String,
    /// New value; for a removed key, the value it had
    pub value: Value,
    /// Value before an update
    pub previous: Option<Value>,
    /// Floor of a `message` scope change
    pub message_id: Option<usize>,
}

/// Receives the changes of the bound scope. Every method defaults to doing
/// nothing.
pub trait VariableObserver: Send + Sync {
    fn added(&self, _change: &VariableChange) {}
    fn removed(&self, _change: &VariableChange) {}
    fn updated(&self, _change: &VariableChange) {}
}

/// Where the service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Inactive,
    Bound(VariableScope),
}

#[derive(Debug)]
enum ChangeSource {
    /// Read the scope from the store
    Reread,
    /// The event carried the active character's new mapping
    Character(Variables),
    /// The event carried one floor's new mapping
    Message { floor: usize, variables: Variables },
    /// Floors belong to another chat now
    ChatSwitched,
}

#[derive(Debug)]
enum Signal {
    Bind {
        scope: VariableScope,
        done: oneshot::Sender<()>,
    },
    Unbind {
        done: oneshot::Sender<()>,
    },
    Changed {
        generation: u64,
        source: ChangeSource,
    },
    /// Re-read the bound scope now
    Poll {
        done: oneshot::Sender<()>,
    },
    /// Acknowledged once every earlier signal has been processed
    Flush {
        done: oneshot::Sender<()>,
    },
}

#[derive(Deserialize)]
struct CharacterPayload {
    #[serde(default)]
    variables: Variables,
}

#[derive(Deserialize)]
struct MessagePayload {
    message_id: usize,
    #[serde(default)]
    variables: Variables,
}

/// Diff-driven observer of one variable scope at a time.
///
/// Several services may run side by side to observe several scopes.
pub struct VariableSyncService {
    tx: mpsc::UnboundedSender<Signal>,
    state: watch::Receiver<SyncState>,
    last_scope: std::sync::Mutex<Option<VariableScope>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for VariableSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableSyncService")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl VariableSyncService {
    /// Starts the service's task, inactive.
    pub fn new(store: Arc<VariableStore>, observer: Arc<dyn VariableObserver>, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SyncState::Inactive);
        let worker = SyncWorker {
            events: Arc::clone(store.events()),
            store,
            observer,
            poll_interval,
            signals: tx.downgrade(),
            state: state_tx,
            scope: None,
            generation: 0,
            snapshot: Variables::new(),
            floors: BTreeMap::new(),
            bindings: Vec::new(),
        };
        let task = tokio::spawn(worker.run(rx));

        Self {
            tx,
            state,
            last_scope: std::sync::Mutex::new(None),
            task,
        }
    }

    /// Binds the `global` scope.
    pub async fn init(&self) {
        self.set_scope(VariableScope::Global).await;
    }

    /// Switches observation to `scope`. Binding the already-bound scope is a
    /// no-op.
    pub async fn set_scope(&self, scope: VariableScope) {
        *self.lock_last_scope() = Some(scope);
        self.request(|done| Signal::Bind { scope, done }).await;
    }

    /// Rebinds the last scope with a freshly seeded snapshot.
    pub async fn reactivate(&self) {
        let scope = *self.lock_last_scope();
        let Some(scope) = scope else {
            return;
        };
        self.request(|done| Signal::Unbind { done }).await;
        self.request(|done| Signal::Bind { scope, done }).await;
    }

    /// Unbinds every listener and stops polling. The last scope is kept for
    /// [`VariableSyncService::reactivate`].
    pub async fn deactivate(&self) {
        self.request(|done| Signal::Unbind { done }).await;
    }

    /// Diffs the bound scope against the store right now.
    pub async fn poll_now(&self) {
        self.request(|done| Signal::Poll { done }).await;
    }

    /// Waits until every change signal queued so far has been processed.
    pub async fn flush(&self) {
        self.request(|done| Signal::Flush { done }).await;
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Unbinds and stops the service's task.
    pub async fn cleanup(self) {
        self.request(|done| Signal::Unbind { done }).await;
        let Self { tx, task, .. } = self;
        drop(tx);
        if let Err(e) = task.await {
            warn!("Variable sync task ended abnormally: {}", e);
        }
    }

    async fn request(&self, signal: impl FnOnce(oneshot::Sender<()>) -> Signal) {
        let (done, ack) = oneshot::channel();
        if self.tx.send(signal(done)).is_err() {
            return;
        }
        // The worker only drops `done` when it is gone; nothing to wait for then.
        let _ = ack.await;
    }

    fn lock_last_scope(&self) -> std::sync::MutexGuard<'_, Option<VariableScope>> {
        self.last_scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct SyncWorker {
    store: Arc<VariableStore>,
    events: Arc<HostEvents>,
    observer: Arc<dyn VariableObserver>,
    poll_interval: Duration,
    /// Handed to listeners; weak so the channel closes with the service
    signals: mpsc::WeakUnboundedSender<Signal>,
    state: watch::Sender<SyncState>,
    scope: Option<VariableScope>,
    /// Bumped on every bind; signals from older bindings are discarded
    generation: u64,
    snapshot: Variables,
    floors: BTreeMap<usize, Variables>,
    bindings: Vec<(&'static str, ListenerId)>,
}

impl SyncWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Signal>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let polling = self.scope == Some(VariableScope::Chat);
            tokio::select! {
                signal = rx.recv() => match signal {
                    Some(signal) => self.handle(signal, &mut ticker),
                    None => break,
                },
                _ = ticker.tick(), if polling => {
                    trace!("Polling chat variables");
                    self.apply(ChangeSource::Reread);
                }
            }
        }

        self.unbind();
        debug!("Variable sync task finished");
    }

    fn handle(&mut self, signal: Signal, ticker: &mut tokio::time::Interval) {
        match signal {
            Signal::Bind { scope, done } => {
                if self.scope != Some(scope) {
                    self.unbind();
                    self.bind(scope);
                    // First tick fires one full interval after binding.
                    ticker.reset();
                }
                let _ = done.send(());
            }
            Signal::Unbind { done } => {
                self.unbind();
                let _ = done.send(());
            }
            Signal::Changed { generation, source } => {
                if generation == self.generation && self.scope.is_some() {
                    self.apply(source);
                } else {
                    trace!("Dropping change signal from a previous binding");
                }
            }
            Signal::Poll { done } => {
                if self.scope.is_some() {
                    self.apply(ChangeSource::Reread);
                }
                let _ = done.send(());
            }
            Signal::Flush { done } => {
                let _ = done.send(());
            }
        }
    }

    fn bind(&mut self, scope: VariableScope) {
        self.generation += 1;
        self.seed(scope);

        let generation = self.generation;
        match scope {
            VariableScope::Global => {
                self.listen(events::SETTINGS_UPDATED, generation, |_| Some(ChangeSource::Reread));
            }
            VariableScope::Character => {
                self.listen(events::CHARACTER_VARIABLES_CHANGED, generation, |payload| {
                    serde_json::from_value::<CharacterPayload>(payload.clone())
                        .ok()
                        .map(|payload| ChangeSource::Character(payload.variables))
                });
                self.listen(events::CHARACTER_CHANGED, generation, |_| Some(ChangeSource::Reread));
            }
            VariableScope::Chat => {
                // Polled from `run`; also re-read at once when the chat switches.
                self.listen(events::CHAT_CHANGED, generation, |_| Some(ChangeSource::Reread));
            }
            VariableScope::Message => {
                self.listen(events::MESSAGE_VARIABLES_CHANGED, generation, |payload| {
                    serde_json::from_value::<MessagePayload>(payload.clone())
                        .ok()
                        .map(|payload| ChangeSource::Message {
                            floor: payload.message_id,
                            variables: payload.variables,
                        })
                });
                self.listen(events::CHAT_CHANGED, generation, |_| Some(ChangeSource::ChatSwitched));
            }
        }

        self.scope = Some(scope);
        self.state.send_replace(SyncState::Bound(scope));
        info!("🔄 Variable sync bound to {} scope", scope);
    }

    fn unbind(&mut self) {
        for (event, id) in self.bindings.drain(..) {
            self.events.off(event, id);
        }
        if let Some(scope) = self.scope.take() {
            debug!("Variable sync unbound from {} scope", scope);
        }
        self.snapshot.clear();
        self.floors.clear();
        self.state.send_replace(SyncState::Inactive);
    }

    /// Seeds the snapshots of `scope` from the store without notifying.
    fn seed(&mut self, scope: VariableScope) {
        self.floors.clear();
        self.snapshot.clear();
        if scope == VariableScope::Message {
            self.floors = self.store.message_pages().into_iter().enumerate().collect();
        } else {
            self.snapshot = self.read(scope);
        }
    }

    fn listen<F>(&mut self, event: &'static str, generation: u64, decode: F)
    where
        F: Fn(&Value) -> Option<ChangeSource> + Send + Sync + 'static,
    {
        let signals = self.signals.clone();
        let id = self.events.on_raw(event, move |payload| {
            let Some(source) = decode(payload) else {
                warn!("Ignoring malformed '{}' payload", event);
                return;
            };
            if let Some(tx) = signals.upgrade() {
                let _ = tx.send(Signal::Changed { generation, source });
            }
        });
        self.bindings.push((event, id));
    }

    fn read(&self, scope: VariableScope) -> Variables {
        self.store
            .read(&super::VariableOption::scope(scope))
            .unwrap_or_default()
    }

    fn apply(&mut self, source: ChangeSource) {
        let Some(scope) = self.scope else {
            return;
        };

        match (scope, source) {
            (VariableScope::Message, ChangeSource::Message { floor, variables }) => {
                let previous = self.floors.remove(&floor).unwrap_or_default();
                self.notify(scope, Some(floor), &previous, &variables);
                self.floors.insert(floor, variables);
            }
            (VariableScope::Message, ChangeSource::ChatSwitched) => {
                self.seed(scope);
            }
            (VariableScope::Message, ChangeSource::Reread) => {
                for (floor, variables) in self.store.message_pages().into_iter().enumerate() {
                    let previous = self.floors.remove(&floor).unwrap_or_default();
                    self.notify(scope, Some(floor), &previous, &variables);
                    self.floors.insert(floor, variables);
                }
            }
            (VariableScope::Character, ChangeSource::Character(variables)) => {
                self.replace_snapshot(scope, variables);
            }
            (_, ChangeSource::Reread) => {
                let current = self.read(scope);
                self.replace_snapshot(scope, current);
            }
            (scope, source) => {
                trace!("Signal {:?} does not apply to {} scope", source, scope);
            }
        }
    }

    fn replace_snapshot(&mut self, scope: VariableScope, current: Variables) {
        let previous = std::mem::take(&mut self.snapshot);
        self.notify(scope, None, &previous, &current);
        self.snapshot = current;
    }

    fn notify(&self, scope: VariableScope, message_id: Option<usize>, previous: &Variables, current: &Variables) {
        let changes = diff(previous, current);
        if changes.is_empty() {
            return;
        }
        debug!(
            "{} scope changed: +{} -{} ~{}",
            scope,
            changes.added.len(),
            changes.removed.len(),
            changes.updated.len()
        );

        let change = |key: &String, value: &Value, previous: Option<&Value>| VariableChange {
            scope,
            key: key.clone(),
            value: value.clone(),
            previous: previous.cloned(),
            message_id,
        };
        for key in &changes.added {
            if let Some(value) = current.get(key) {
                self.observer.added(&change(key, value, None));
            }
        }
        for key in &changes.removed {
            if let Some(value) = previous.get(key) {
                self.observer.removed(&change(key, value, None));
            }
        }
        for key in &changes.updated {
            if let (Some(value), Some(old)) = (current.get(key), previous.get(key)) {
                self.observer.updated(&change(key, value, Some(old)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::scope::{MessageId, VariableOption};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(&'static str, String, Value, Option<usize>)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(&'static str, String, Value, Option<usize>)> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    impl VariableObserver for Recorder {
        fn added(&self, change: &VariableChange) {
            self.seen
                .lock()
                .unwrap()
                .push(("added", change.key.clone(), change.value.clone(), change.message_id));
        }
        fn removed(&self, change: &VariableChange) {
            self.seen
                .lock()
                .unwrap()
                .push(("removed", change.key.clone(), change.value.clone(), change.message_id));
        }
        fn updated(&self, change: &VariableChange) {
            self.seen
                .lock()
                .unwrap()
                .push(("updated", change.key.clone(), change.value.clone(), change.message_id));
        }
    }

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (Arc<VariableStore>, Arc<Recorder>, VariableSyncService) {
        let store = Arc::new(VariableStore::new(Arc::new(HostEvents::new())));
        let recorder = Arc::new(Recorder::default());
        let service = VariableSyncService::new(
            Arc::clone(&store),
            Arc::clone(&recorder) as Arc<dyn VariableObserver>,
            Duration::from_secs(2),
        );
        (store, recorder, service)
    }

    #[tokio::test]
    async fn test_global_changes_reported_after_seeding() {
        let (store, recorder, service) = setup();
        let global = VariableOption::scope(VariableScope::Global);
        store.replace(&global, vars(json!({"a": 1, "b": 2}))).unwrap();

        service.init().await;
        assert_eq!(service.state(), SyncState::Bound(VariableScope::Global));

        store.replace(&global, vars(json!({"a": 1, "b": 3, "c": 4}))).unwrap();
        service.flush().await;

        assert_eq!(
            recorder.take(),
            vec![
                ("added", "c".to_string(), json!(4), None),
                ("updated", "b".to_string(), json!(3), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_character_event_value_used_directly() {
        let (store, recorder, service) = setup();
        store.set_active_character(Some("alice"));
        service.set_scope(VariableScope::Character).await;

        // Only the event fires; the store is never written.
        store.events().emit_value(
            events::CHARACTER_VARIABLES_CHANGED,
            &json!({"character_id": "alice", "variables": {"mood": "happy"}}),
        );
        service.flush().await;

        assert_eq!(recorder.take(), vec![("added", "mood".to_string(), json!("happy"), None)]);
        assert!(store.read(&VariableOption::scope(VariableScope::Character)).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_scope_is_polled() {
        let (store, recorder, service) = setup();
        let chat = VariableOption::scope(VariableScope::Chat);
        service.set_scope(VariableScope::Chat).await;

        store.replace(&chat, vars(json!({"turn": 1}))).unwrap();
        service.flush().await;
        assert!(recorder.take().is_empty());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        service.flush().await;
        assert_eq!(recorder.take(), vec![("added", "turn".to_string(), json!(1), None)]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        service.flush().await;
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_chat_switch_reports_difference_between_chats() {
        let (store, recorder, service) = setup();
        let chat = VariableOption::scope(VariableScope::Chat);
        store.open_chat("b");
        store.replace(&chat, vars(json!({"y": 2, "shared": 2}))).unwrap();
        store.open_chat("a");
        store.replace(&chat, vars(json!({"x": 1, "shared": 1}))).unwrap();
        service.set_scope(VariableScope::Chat).await;

        // Switching chats re-reads at once; the two chats are diffed against each other.
        store.open_chat("b");
        service.flush().await;
        assert_eq!(
            recorder.take(),
            vec![
                ("added", "y".to_string(), json!(2), None),
                ("removed", "x".to_string(), json!(1), None),
                ("updated", "shared".to_string(), json!(2), None),
            ]
        );

        store.open_chat("a");
        service.flush().await;
        assert_eq!(
            recorder.take(),
            vec![
                ("added", "x".to_string(), json!(1), None),
                ("removed", "y".to_string(), json!(2), None),
                ("updated", "shared".to_string(), json!(1), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_message_floors_tracked_separately() {
        let (store, recorder, service) = setup();
        store.push_floor(vars(json!({"hp": 10})));
        service.set_scope(VariableScope::Message).await;

        store
            .replace(&VariableOption::message(MessageId::Index(0)), vars(json!({"hp": 7})))
            .unwrap();
        store.push_floor(vars(json!({"hp": 7, "mp": 1})));
        service.flush().await;

        assert_eq!(
            recorder.take(),
            vec![
                ("updated", "hp".to_string(), json!(7), Some(0)),
                ("added", "hp".to_string(), json!(7), Some(1)),
                ("added", "mp".to_string(), json!(1), Some(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_switching_scope_unbinds_previous() {
        let (store, recorder, service) = setup();
        let global = VariableOption::scope(VariableScope::Global);
        service.init().await;
        assert_eq!(store.events().listener_count(events::SETTINGS_UPDATED), 1);

        service.set_scope(VariableScope::Message).await;
        assert_eq!(store.events().listener_count(events::SETTINGS_UPDATED), 0);

        store.replace(&global, vars(json!({"ignored": true}))).unwrap();
        service.flush().await;
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_removed_keys_carry_last_value() {
        let (store, recorder, service) = setup();
        let global = VariableOption::scope(VariableScope::Global);
        store.replace(&global, vars(json!({"gone": "soon"}))).unwrap();
        service.init().await;

        store.replace(&global, Variables::new()).unwrap();
        service.flush().await;
        assert_eq!(recorder.take(), vec![("removed", "gone".to_string(), json!("soon"), None)]);
    }

    #[tokio::test]
    async fn test_deactivate_and_reactivate_reseed() {
        let (store, recorder, service) = setup();
        let global = VariableOption::scope(VariableScope::Global);
        service.init().await;

        service.deactivate().await;
        assert_eq!(service.state(), SyncState::Inactive);
        store.replace(&global, vars(json!({"while_away": 1}))).unwrap();

        service.reactivate().await;
        service.flush().await;
        assert_eq!(service.state(), SyncState::Bound(VariableScope::Global));
        assert!(recorder.take().is_empty());

        service.cleanup().await;
        assert_eq!(store.events().listener_count(events::SETTINGS_UPDATED), 0);
    }

    #[tokio::test]
    async fn test_observer_may_write_back() {
        struct Doubler {
            store: Arc<VariableStore>,
        }
        impl VariableObserver for Doubler {
            fn added(&self, change: &VariableChange) {
                if change.key == "x" {
                    let global = VariableOption::scope(VariableScope::Global);
                    let _ = self.store.update(&global, |variables| {
                        variables.insert("doubled".to_string(), json!(change.value.as_i64().unwrap() * 2));
                    });
                }
            }
        }

        let store = Arc::new(VariableStore::new(Arc::new(HostEvents::new())));
        let service = VariableSyncService::new(
            Arc::clone(&store),
            Arc::new(Doubler { store: Arc::clone(&store) }),
            Duration::from_secs(2),
        );
        service.init().await;

        let global = VariableOption::scope(VariableScope::Global);
        store.replace(&global, vars(json!({"x": 21}))).unwrap();
        service.flush().await;
        service.flush().await;

        assert_eq!(store.read(&global).unwrap()["doubled"], 42);
    }
}
