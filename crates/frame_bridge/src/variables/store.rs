//! Host-resident backing storage for the four variable scopes.
//!
//! Reads return deep copies and writes replace whole mappings. Each write
//! fires the scope's host change event once the store lock has been
//! released, then requests a debounced save.

use super::scope::{MessageId, VariableOption, VariableScope};
use super::{VariableError, Variables};
use crate::events::{self, HostEvents};
use crate::persistence::Debouncer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Chat opened before any explicit [`VariableStore::open_chat`].
pub const DEFAULT_CHAT: &str = "default";

/// One position in the chat history, with its alternate pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub pages: Vec<Variables>,
    pub active_page: usize,
}

impl Floor {
    pub fn new(variables: Variables) -> Self {
        Self {
            pages: vec![variables],
            active_page: 0,
        }
    }

    pub fn active(&self) -> &Variables {
        &self.pages[self.active_page]
    }

    fn active_mut(&mut self) -> &mut Variables {
        &mut self.pages[self.active_page]
    }
}

/// A chat session: its variables and its floors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub floors: Vec<Floor>,
}

/// Everything the store holds, in its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub global: Variables,
    #[serde(default)]
    pub characters: BTreeMap<String, Variables>,
    #[serde(default)]
    pub active_character: Option<String>,
    #[serde(default)]
    pub chats: BTreeMap<String, ChatRecord>,
    #[serde(default = "default_chat")]
    pub active_chat: String,
}

fn default_chat() -> String {
    DEFAULT_CHAT.to_string()
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            global: Variables::new(),
            characters: BTreeMap::new(),
            active_character: None,
            chats: BTreeMap::new(),
            active_chat: default_chat(),
        }
    }
}

impl StoreSnapshot {
    fn chat(&self) -> Option<&ChatRecord> {
        self.chats.get(&self.active_chat)
    }

    fn chat_mut(&mut self) -> &mut ChatRecord {
        self.chats.entry(self.active_chat.clone()).or_default()
    }

    fn floor_count(&self) -> usize {
        self.chat().map(|chat| chat.floors.len()).unwrap_or(0)
    }

    /// Resolves a message id against the open chat.
    fn resolve_floor(&self, message_id: MessageId) -> Result<usize, VariableError> {
        let count = self.floor_count();
        match message_id {
            MessageId::Latest if count == 0 => Err(VariableError::EmptyChat),
            MessageId::Latest => Ok(count - 1),
            MessageId::Index(index) => {
                let resolved = if index < 0 { count as i64 + index } else { index };
                if resolved < 0 || resolved >= count as i64 {
                    Err(VariableError::FloorOutOfRange(index, count))
                } else {
                    Ok(resolved as usize)
                }
            }
        }
    }
}

/// A change event to fire once the write lock is gone.
struct PendingEvent {
    name: &'static str,
    payload: Value,
}

/// The variable scopes' backing storage.
#[derive(Debug)]
pub struct VariableStore {
    state: RwLock<StoreSnapshot>,
    events: Arc<HostEvents>,
    saver: Debouncer,
}

impl VariableStore {
    pub fn new(events: Arc<HostEvents>) -> Self {
        Self::with_saver(events, Debouncer::disabled())
    }

    pub fn with_saver(events: Arc<HostEvents>, saver: Debouncer) -> Self {
        Self {
            state: RwLock::new(StoreSnapshot::default()),
            events,
            saver,
        }
    }

    pub fn events(&self) -> &Arc<HostEvents> {
        &self.events
    }

    /// Deep copy of the variables `option` addresses.
    pub fn read(&self, option: &VariableOption) -> Result<Variables, VariableError> {
        read_from(&self.read_state(), option)
    }

    /// Replaces the whole mapping `option` addresses.
    ///
    /// `character` writes the active character and fails without one;
    /// `message` writes the active page of the resolved floor.
    pub fn replace(&self, option: &VariableOption, variables: Variables) -> Result<(), VariableError> {
        let event = write_into(&mut self.write_state(), option, variables)?;
        debug!("Replaced {} variables", option.scope);
        self.after_write(event);
        Ok(())
    }

    /// Reads, applies `f`, replaces, and returns what was written.
    ///
    /// The whole read-modify-write holds the write lock, so concurrent
    /// updates of the same scope never lose each other's changes. `f` must
    /// not call back into the store.
    pub fn update<F>(&self, option: &VariableOption, f: F) -> Result<Variables, VariableError>
    where
        F: FnOnce(&mut Variables),
    {
        let (variables, event) = {
            let mut state = self.write_state();
            let mut variables = read_from(&state, option)?;
            f(&mut variables);
            let event = write_into(&mut state, option, variables.clone())?;
            (variables, event)
        };
        debug!("Updated {} variables", option.scope);
        self.after_write(event);
        Ok(variables)
    }

    /// Writes the variables of a character that need not be active.
    pub fn replace_character(&self, character_id: &str, variables: Variables) {
        let active = {
            let mut state = self.write_state();
            state.characters.insert(character_id.to_string(), variables.clone());
            state.active_character.as_deref() == Some(character_id)
        };
        let event = active.then(|| PendingEvent {
            name: events::CHARACTER_VARIABLES_CHANGED,
            payload: json!({ "character_id": character_id, "variables": variables }),
        });
        self.after_write(event);
    }

    /// Makes `character_id` the active character (or none).
    pub fn set_active_character(&self, character_id: Option<&str>) {
        {
            let mut state = self.write_state();
            if state.active_character.as_deref() == character_id {
                return;
            }
            state.active_character = character_id.map(str::to_string);
            if let Some(id) = character_id {
                state.characters.entry(id.to_string()).or_default();
            }
        }
        info!("🎭 Active character is now {:?}", character_id);
        self.after_write(Some(PendingEvent {
            name: events::CHARACTER_CHANGED,
            payload: json!({ "character_id": character_id }),
        }));
    }

    pub fn active_character(&self) -> Option<String> {
        self.read_state().active_character.clone()
    }

    pub fn character_ids(&self) -> Vec<String> {
        self.read_state().characters.keys().cloned().collect()
    }

    /// Deletes a character record and its variables.
    ///
    /// Returns false if it did not exist. Emits `character_deleted`, which is
    /// what cascades into the script manager.
    pub fn delete_character(&self, character_id: &str) -> bool {
        let existed = {
            let mut state = self.write_state();
            let existed = state.characters.remove(character_id).is_some();
            if state.active_character.as_deref() == Some(character_id) {
                state.active_character = None;
            }
            existed
        };
        if !existed {
            return false;
        }

        info!("🗑️ Deleted character '{}'", character_id);
        self.after_write(Some(PendingEvent {
            name: events::CHARACTER_DELETED,
            payload: json!({ "character_id": character_id }),
        }));
        true
    }

    /// Switches to another chat, creating it if unknown.
    pub fn open_chat(&self, chat_id: &str) {
        {
            let mut state = self.write_state();
            state.active_chat = chat_id.to_string();
            state.chat_mut();
        }
        info!("💬 Opened chat '{}'", chat_id);
        self.after_write(Some(PendingEvent {
            name: events::CHAT_CHANGED,
            payload: json!({ "chat_id": chat_id }),
        }));
    }

    pub fn active_chat(&self) -> String {
        self.read_state().active_chat.clone()
    }

    /// Appends a floor whose first page carries `variables`. Returns its index.
    pub fn push_floor(&self, variables: Variables) -> usize {
        let floor = {
            let mut state = self.write_state();
            let chat = state.chat_mut();
            chat.floors.push(Floor::new(variables.clone()));
            chat.floors.len() - 1
        };
        self.after_write(Some(message_event(floor, variables)));
        floor
    }

    /// Adds an alternate page to a floor and makes it active. Returns the
    /// page index.
    pub fn add_page(&self, message_id: MessageId, variables: Variables) -> Result<usize, VariableError> {
        let (floor, page) = {
            let mut state = self.write_state();
            let floor = state.resolve_floor(message_id)?;
            let record = &mut state.chat_mut().floors[floor];
            record.pages.push(variables.clone());
            record.active_page = record.pages.len() - 1;
            (floor, record.active_page)
        };
        self.after_write(Some(message_event(floor, variables)));
        Ok(page)
    }

    /// Makes another existing page of a floor active.
    pub fn select_page(&self, message_id: MessageId, page: usize) -> Result<(), VariableError> {
        let (floor, variables) = {
            let mut state = self.write_state();
            let floor = state.resolve_floor(message_id)?;
            let record = &mut state.chat_mut().floors[floor];
            if page >= record.pages.len() {
                return Err(VariableError::PageOutOfRange { floor, page });
            }
            record.active_page = page;
            (floor, record.active().clone())
        };
        self.after_write(Some(message_event(floor, variables)));
        Ok(())
    }

    pub fn floor_count(&self) -> usize {
        self.read_state().floor_count()
    }

    /// Active page of every floor of the open chat, by floor index.
    pub fn message_pages(&self) -> Vec<Variables> {
        self.read_state()
            .chat()
            .map(|chat| chat.floors.iter().map(|floor| floor.active().clone()).collect())
            .unwrap_or_default()
    }

    /// Legacy write: stages `variables` for the newest floor only.
    ///
    /// Keys whose value differs from the chat variables are merged into the
    /// chat's `tempVariables` mapping. Writes addressed to any other floor are
    /// dropped and `false` is returned.
    pub fn stage_latest(&self, message_id: i64, mut variables: Variables) -> bool {
        {
            let mut state = self.write_state();
            let latest = state.floor_count() as i64 - 1;
            if message_id != latest {
                warn!(
                    "Dropping staged variables for floor {} (latest is {})",
                    message_id, latest
                );
                return false;
            }

            variables.remove("tempVariables");
            let chat = &mut state.chat_mut().variables;
            let mut staged = match chat.remove("tempVariables") {
                Some(Value::Object(staged)) => staged,
                _ => Variables::new(),
            };
            for (key, value) in variables {
                if chat.get(&key) != Some(&value) {
                    staged.insert(key, value);
                }
            }
            chat.insert("tempVariables".to_string(), Value::Object(staged));
        }
        self.saver.request();
        true
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.read_state().clone()
    }

    /// Replaces the whole store. Fires no change events.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        *self.write_state() = snapshot;
    }

    fn after_write(&self, event: Option<PendingEvent>) {
        if let Some(event) = event {
            self.events.emit_value(event.name, &event.payload);
        }
        self.saver.request();
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreSnapshot> {
        // Writers never leave the snapshot half-updated across a panic point.
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreSnapshot> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_from(state: &StoreSnapshot, option: &VariableOption) -> Result<Variables, VariableError> {
    match option.scope {
        VariableScope::Global => Ok(state.global.clone()),
        VariableScope::Character => Ok(state
            .active_character
            .as_ref()
            .and_then(|id| state.characters.get(id))
            .cloned()
            .unwrap_or_default()),
        VariableScope::Chat => Ok(state.chat().map(|chat| chat.variables.clone()).unwrap_or_default()),
        VariableScope::Message => {
            let floor = state.resolve_floor(option.message_id)?;
            Ok(state.chat().map(|chat| chat.floors[floor].active().clone()).unwrap_or_default())
        }
    }
}

/// Writes `variables` where `option` points and returns the event announcing it.
fn write_into(
    state: &mut StoreSnapshot,
    option: &VariableOption,
    variables: Variables,
) -> Result<Option<PendingEvent>, VariableError> {
    match option.scope {
        VariableScope::Global => {
            state.global = variables;
            Ok(Some(PendingEvent {
                name: events::SETTINGS_UPDATED,
                payload: Value::Null,
            }))
        }
        VariableScope::Character => {
            let id = state.active_character.clone().ok_or(VariableError::NoActiveCharacter)?;
            state.characters.insert(id.clone(), variables.clone());
            Ok(Some(PendingEvent {
                name: events::CHARACTER_VARIABLES_CHANGED,
                payload: json!({ "character_id": id, "variables": variables }),
            }))
        }
        VariableScope::Chat => {
            state.chat_mut().variables = variables;
            Ok(None)
        }
        VariableScope::Message => {
            let floor = state.resolve_floor(option.message_id)?;
            *state.chat_mut().floors[floor].active_mut() = variables.clone();
            Ok(Some(message_event(floor, variables)))
        }
    }
}

fn message_event(floor: usize, variables: Variables) -> PendingEvent {
    PendingEvent {
        name: events::MESSAGE_VARIABLES_CHANGED,
        payload: json!({ "message_id": floor, "variables": variables }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap()
    }

    fn store() -> (VariableStore, Arc<HostEvents>) {
        let events = Arc::new(HostEvents::new());
        (VariableStore::new(Arc::clone(&events)), events)
    }

    fn capture(events: &HostEvents, name: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.on_raw(name, move |payload| sink.lock().unwrap().push(payload.clone()));
        seen
    }

    #[test]
    fn test_reads_are_deep_copies() {
        let (store, _) = store();
        let global = VariableOption::scope(VariableScope::Global);
        store.replace(&global, vars(json!({"nested": {"n": 1}}))).unwrap();

        let mut copy = store.read(&global).unwrap();
        copy.insert("nested".to_string(), json!({"n": 2}));
        assert_eq!(store.read(&global).unwrap(), vars(json!({"nested": {"n": 1}})));
    }

    #[test]
    fn test_character_scope_needs_active_character() {
        let (store, events) = store();
        let option = VariableOption::scope(VariableScope::Character);
        let changes = capture(&events, events::CHARACTER_VARIABLES_CHANGED);

        assert_eq!(
            store.replace(&option, vars(json!({"a": 1}))),
            Err(VariableError::NoActiveCharacter)
        );
        assert!(store.read(&option).unwrap().is_empty());

        store.set_active_character(Some("alice"));
        store.replace(&option, vars(json!({"a": 1}))).unwrap();
        assert_eq!(store.read(&option).unwrap(), vars(json!({"a": 1})));
        assert_eq!(
            changes.lock().unwrap()[0],
            json!({"character_id": "alice", "variables": {"a": 1}})
        );
    }

    #[test]
    fn test_message_ids_resolve_against_floors() {
        let (store, _) = store();
        let latest = VariableOption::message(MessageId::Latest);
        assert_eq!(store.read(&latest), Err(VariableError::EmptyChat));

        store.push_floor(vars(json!({"floor": 0})));
        store.push_floor(vars(json!({"floor": 1})));

        assert_eq!(store.read(&latest).unwrap()["floor"], 1);
        assert_eq!(store.read(&VariableOption::message(MessageId::Index(-2))).unwrap()["floor"], 0);
        assert_eq!(store.read(&VariableOption::message(MessageId::Index(0))).unwrap()["floor"], 0);
        assert_eq!(
            store.read(&VariableOption::message(MessageId::Index(2))),
            Err(VariableError::FloorOutOfRange(2, 2))
        );
        assert_eq!(
            store.read(&VariableOption::message(MessageId::Index(-3))),
            Err(VariableError::FloorOutOfRange(-3, 2))
        );
    }

    #[test]
    fn test_message_writes_target_active_page() {
        let (store, events) = store();
        let changes = capture(&events, events::MESSAGE_VARIABLES_CHANGED);
        let floor = store.push_floor(vars(json!({"page": 0})));
        store.add_page(MessageId::Index(floor as i64), vars(json!({"page": 1}))).unwrap();

        let option = VariableOption::message(MessageId::Latest);
        store.replace(&option, vars(json!({"page": "edited"}))).unwrap();
        store.select_page(MessageId::Latest, 0).unwrap();
        assert_eq!(store.read(&option).unwrap(), vars(json!({"page": 0})));

        store.select_page(MessageId::Latest, 1).unwrap();
        assert_eq!(store.read(&option).unwrap(), vars(json!({"page": "edited"})));
        assert_eq!(
            store.select_page(MessageId::Latest, 5),
            Err(VariableError::PageOutOfRange { floor: 0, page: 5 })
        );

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 5);
        assert_eq!(changes[2], json!({"message_id": 0, "variables": {"page": "edited"}}));
    }

    #[test]
    fn test_chat_scope_emits_nothing_and_follows_open_chat() {
        let (store, events) = store();
        let chat = VariableOption::scope(VariableScope::Chat);
        let settings = capture(&events, events::SETTINGS_UPDATED);

        store.replace(&chat, vars(json!({"x": 1}))).unwrap();
        assert!(settings.lock().unwrap().is_empty());

        store.open_chat("second");
        assert!(store.read(&chat).unwrap().is_empty());
        store.open_chat(DEFAULT_CHAT);
        assert_eq!(store.read(&chat).unwrap(), vars(json!({"x": 1})));
    }

    #[test]
    fn test_update_is_read_modify_replace() {
        let (store, events) = store();
        let settings = capture(&events, events::SETTINGS_UPDATED);
        let global = VariableOption::scope(VariableScope::Global);

        let written = store
            .update(&global, |variables| {
                variables.insert("count".to_string(), json!(1));
            })
            .unwrap();
        assert_eq!(written, vars(json!({"count": 1})));
        assert_eq!(settings.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let (store, _) = store();
        let store = Arc::new(store);
        let global = VariableOption::scope(VariableScope::Global);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let global = global.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .update(&global, |variables| {
                                let n = variables.get("n").and_then(Value::as_i64).unwrap_or(0);
                                variables.insert("n".to_string(), json!(n + 1));
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(store.read(&global).unwrap()["n"], json!(800));
    }

    #[test]
    fn test_delete_character_clears_active_and_emits() {
        let (store, events) = store();
        let deleted = capture(&events, events::CHARACTER_DELETED);
        store.set_active_character(Some("bob"));

        assert!(store.delete_character("bob"));
        assert!(!store.delete_character("bob"));
        assert_eq!(store.active_character(), None);
        assert_eq!(deleted.lock().unwrap().as_slice(), &[json!({"character_id": "bob"})]);
    }

    #[test]
    fn test_stage_latest_only_touches_newest_floor() {
        let (store, _) = store();
        let chat = VariableOption::scope(VariableScope::Chat);
        store.replace(&chat, vars(json!({"hp": 10}))).unwrap();
        store.push_floor(Variables::new());
        store.push_floor(Variables::new());

        assert!(!store.stage_latest(0, vars(json!({"hp": 5}))));
        assert!(store.stage_latest(1, vars(json!({"hp": 5, "mp": 3, "tempVariables": {}}))));
        assert!(store.stage_latest(1, vars(json!({"hp": 10}))));

        assert_eq!(
            store.read(&chat).unwrap(),
            vars(json!({"hp": 10, "tempVariables": {"hp": 5, "mp": 3}}))
        );
    }

    #[test]
    fn test_snapshot_restore() {
        let (store, _) = store();
        store.set_active_character(Some("alice"));
        store.push_floor(vars(json!({"a": 1})));
        let snapshot = store.snapshot();

        let (fresh, _) = self::store();
        fresh.restore(snapshot.clone());
        assert_eq!(fresh.snapshot(), snapshot);
        assert_eq!(fresh.floor_count(), 1);
    }
}
