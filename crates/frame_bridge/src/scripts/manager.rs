//! Script lifecycle: which scripts run, in which frame, with which buttons.

use super::buttons::{button_event_name, ButtonContainer, ButtonManager};
use super::model::{fresh_id, Script, ScriptButton, ScriptDraft, ScriptOwner, ScriptRepository, ScriptType};
use super::ScriptError;
use crate::client::FrameClient;
use crate::events::{self, HostEvents, ListenerId};
use crate::persistence::Debouncer;
use crate::system::HostBridge;
use crate::transport::FrameId;
use crate::variables::{VariableStore, Variables};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

/// Starts and stops the frame a script runs in.
#[async_trait]
pub trait FrameLauncher: Send + Sync + fmt::Debug {
    async fn launch(&self, frame: &FrameId, script: &Script) -> Result<(), ScriptError>;

    async fn stop(&self, frame: &FrameId) -> Result<(), ScriptError>;
}

/// Launcher for hosts whose frames connect on their own (e.g. over stdio):
/// it only records the lifecycle in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLauncher;

#[async_trait]
impl FrameLauncher for LoggingLauncher {
    async fn launch(&self, frame: &FrameId, script: &Script) -> Result<(), ScriptError> {
        info!("🚀 Script '{}' assigned to frame {}", script.name, frame);
        Ok(())
    }

    async fn stop(&self, frame: &FrameId) -> Result<(), ScriptError> {
        info!("🛑 Frame {} released", frame);
        Ok(())
    }
}

/// Attaches each script frame to the bridge in-process and keeps its client,
/// so the host (or a test) can act as the script.
#[derive(Debug)]
pub struct InProcessLauncher {
    bridge: Arc<HostBridge>,
    clients: DashMap<FrameId, FrameClient>,
}

impl InProcessLauncher {
    pub fn new(bridge: Arc<HostBridge>) -> Self {
        Self {
            bridge,
            clients: DashMap::new(),
        }
    }

    /// Client of a launched frame.
    pub fn client(&self, frame: &FrameId) -> Option<FrameClient> {
        self.clients.get(frame).map(|entry| entry.value().clone())
    }

    pub fn launched(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl FrameLauncher for InProcessLauncher {
    async fn launch(&self, frame: &FrameId, script: &Script) -> Result<(), ScriptError> {
        let client = self
            .bridge
            .attach_frame(frame.clone())
            .map_err(|e| ScriptError::Launch(e.to_string()))?;
        debug!("Attached frame {} for script '{}'", frame, script.name);
        if let Some(previous) = self.clients.insert(frame.clone(), client) {
            previous.shutdown();
        }
        Ok(())
    }

    async fn stop(&self, frame: &FrameId) -> Result<(), ScriptError> {
        self.bridge.detach_frame(frame);
        if let Some((_, client)) = self.clients.remove(frame) {
            client.shutdown();
        }
        Ok(())
    }
}

/// A reserved or running script frame. The ticket tells a launch apart from
/// a later one of the same script.
#[derive(Debug, Clone)]
struct RunSlot {
    frame: FrameId,
    ticket: u64,
}

#[derive(Debug, Deserialize)]
struct CharacterPayload {
    character_id: Option<String>,
}

/// Owns the script repository and runs the scripts it allows.
///
/// A script runs while it is enabled and its owner may run: the global master
/// switch for global scripts, the active character being allow-listed for
/// character scripts. Running scripts are bound to the frame
/// [`FrameId::for_script`] names, so requests from that frame resolve back to
/// their script.
pub struct ScriptManager {
    repo: RwLock<ScriptRepository>,
    bridge: Arc<HostBridge>,
    store: Arc<VariableStore>,
    launcher: Arc<dyn FrameLauncher>,
    buttons: ButtonManager,
    /// Script id → frame it runs in, reserved before the launch starts
    running: DashMap<String, RunSlot>,
    /// Frame → script id
    frames: DashMap<FrameId, String>,
    next_ticket: AtomicU64,
    saver: Debouncer,
}

impl fmt::Debug for ScriptManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptManager")
            .field("running", &self.running.len())
            .field("launcher", &self.launcher)
            .finish()
    }
}

impl ScriptManager {
    pub fn new(bridge: Arc<HostBridge>, store: Arc<VariableStore>, launcher: Arc<dyn FrameLauncher>) -> Self {
        Self::with_saver(bridge, store, launcher, Debouncer::disabled())
    }

    pub fn with_saver(
        bridge: Arc<HostBridge>,
        store: Arc<VariableStore>,
        launcher: Arc<dyn FrameLauncher>,
        saver: Debouncer,
    ) -> Self {
        Self {
            repo: RwLock::new(ScriptRepository::default()),
            bridge,
            store,
            launcher,
            buttons: ButtonManager::new(),
            running: DashMap::new(),
            frames: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            saver,
        }
    }

    fn events(&self) -> &Arc<HostEvents> {
        self.bridge.events()
    }

    /// Follows character switches and deletions on the host event emitter.
    ///
    /// The listeners hold a weak reference; once the manager is dropped they
    /// do nothing.
    pub fn bind_host_events(self: &Arc<Self>) -> Vec<ListenerId> {
        let weak = Arc::downgrade(self);
        let changed = self.events().on(events::CHARACTER_CHANGED, move |payload: CharacterPayload| {
            spawn_with(&weak, move |manager| async move {
                manager.on_character_changed(payload.character_id.as_deref()).await;
            });
        });

        let weak = Arc::downgrade(self);
        let deleted = self.events().on(events::CHARACTER_DELETED, move |payload: CharacterPayload| {
            let Some(character_id) = payload.character_id else {
                return;
            };
            spawn_with(&weak, move |manager| async move {
                manager.on_character_deleted(&character_id).await;
            });
        });

        vec![changed, deleted]
    }

    // Repository access

    pub fn snapshot(&self) -> ScriptRepository {
        self.read_repo().clone()
    }

    /// Replaces the repository. Running scripts are not touched; call
    /// [`ScriptManager::start`] afterwards.
    pub fn restore(&self, repo: ScriptRepository) {
        *self.write_repo() = repo;
    }

    pub fn script(&self, id: &str) -> Option<Script> {
        self.read_repo().find(id).map(|(_, script)| script.clone())
    }

    /// Scripts of one kind. Character scripts are those of the active
    /// character.
    pub fn scripts(&self, script_type: ScriptType) -> Vec<Script> {
        let owner = match script_type {
            ScriptType::Global => ScriptOwner::Global,
            ScriptType::Character => match self.store.active_character() {
                Some(id) => ScriptOwner::Character(id),
                None => return Vec::new(),
            },
        };
        self.read_repo().scripts_of(&owner).to_vec()
    }

    /// Adds a script. Character scripts go to the active character. A blank
    /// or already-used id is replaced by a fresh one; the final id is
    /// returned. An enabled script starts right away if its owner may run.
    pub async fn add_script(&self, script_type: ScriptType, mut script: Script) -> Result<String, ScriptError> {
        let owner = self.owner_for(script_type)?;
        let id = {
            let mut repo = self.write_repo();
            if script.id.trim().is_empty() || repo.contains(&script.id) {
                let fresh = fresh_id();
                debug!("Script id '{}' unusable, assigned '{}'", script.id, fresh);
                script.id = fresh;
            }
            let id = script.id.clone();
            info!("📜 Added {} script '{}' ({})", script_type, script.name, id);
            repo.insert(&owner, script);
            id
        };
        self.saver.request();
        self.run_script(&id).await?;
        Ok(id)
    }

    /// Imports a script from its serialized form.
    pub async fn import_script(&self, script_type: ScriptType, draft: ScriptDraft) -> Result<String, ScriptError> {
        let script = draft.into_script()?;
        self.add_script(script_type, script).await
    }

    /// Adds a global script unless one with the same id exists. Nothing is
    /// started.
    pub fn provision_builtin(&self, script: Script) -> bool {
        let mut repo = self.write_repo();
        if repo.contains(&script.id) {
            return false;
        }
        debug!("Provisioned built-in script '{}'", script.id);
        repo.insert(&ScriptOwner::Global, script);
        drop(repo);
        self.saver.request();
        true
    }

    /// Edits a script in place. A running script is restarted so the edit
    /// takes effect; one that became ineligible stays stopped.
    pub async fn edit_script<F>(&self, id: &str, edit: F) -> Result<(), ScriptError>
    where
        F: FnOnce(&mut Script),
    {
        {
            let mut repo = self.write_repo();
            let script = repo
                .find_mut(id)
                .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
            edit(script);
            // The id is the repository key.
            script.id = id.to_string();
        }
        self.saver.request();

        if self.stop_script(id).await? {
            self.run_script(id).await?;
        }
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ScriptError> {
        {
            let mut repo = self.write_repo();
            let script = repo
                .find_mut(id)
                .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
            if script.enabled == enabled {
                return Ok(());
            }
            script.enabled = enabled;
        }
        self.saver.request();

        if enabled {
            self.run_script(id).await?;
        } else {
            self.stop_script(id).await?;
        }
        Ok(())
    }

    /// Stops and removes a script.
    pub async fn delete_script(&self, id: &str) -> Result<Script, ScriptError> {
        if !self.read_repo().contains(id) {
            return Err(ScriptError::UnknownScript(id.to_string()));
        }
        self.stop_script(id).await?;

        let (_, script) = self
            .write_repo()
            .remove(id)
            .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
        self.saver.request();
        info!("🗑️ Deleted script '{}' ({})", script.name, id);
        Ok(script)
    }

    /// Moves a script between global and the active character, restarting
    /// it under its new owner if eligible. Returns the new type.
    pub async fn move_script(&self, id: &str) -> Result<ScriptType, ScriptError> {
        let current = self
            .read_repo()
            .find(id)
            .map(|(owner, _)| owner)
            .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
        let target_type = current.script_type().opposite();
        let target = self.owner_for(target_type)?;

        self.stop_script(id).await?;
        {
            let mut repo = self.write_repo();
            let (_, script) = repo
                .remove(id)
                .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
            repo.insert(&target, script);
        }
        self.saver.request();
        info!("📦 Moved script {} to {}", id, target_type);

        self.run_script(id).await?;
        Ok(target_type)
    }

    /// Flips the master switch of global scripts.
    pub async fn set_global_enabled(&self, enabled: bool) -> Result<(), ScriptError> {
        let ids: Vec<String> = {
            let mut repo = self.write_repo();
            if repo.global_script_enabled == enabled {
                return Ok(());
            }
            repo.global_script_enabled = enabled;
            repo.global.iter().map(|script| script.id.clone()).collect()
        };
        self.saver.request();
        info!("🌐 Global scripts {}", if enabled { "enabled" } else { "disabled" });

        for id in ids {
            if enabled {
                self.run_script(&id).await?;
            } else {
                self.stop_script(&id).await?;
            }
        }
        Ok(())
    }

    /// Adds or removes a character from the allow-list. If it is the active
    /// character, its scripts start or stop accordingly.
    pub async fn allow_character(&self, character_id: &str, allowed: bool) -> Result<(), ScriptError> {
        let ids: Vec<String> = {
            let mut repo = self.write_repo();
            if repo.is_character_allowed(character_id) == allowed {
                return Ok(());
            }
            if allowed {
                repo.characters_with_scripts.push(character_id.to_string());
            } else {
                repo.characters_with_scripts.retain(|id| id != character_id);
            }
            repo.scripts_of(&ScriptOwner::Character(character_id.to_string()))
                .iter()
                .map(|script| script.id.clone())
                .collect()
        };
        self.saver.request();

        if self.store.active_character().as_deref() != Some(character_id) {
            return Ok(());
        }
        for id in ids {
            if allowed {
                self.run_script(&id).await?;
            } else {
                self.stop_script(&id).await?;
            }
        }
        Ok(())
    }

    /// Stops every running character script, then starts those of the new
    /// active character.
    pub async fn on_character_changed(&self, character_id: Option<&str>) {
        debug!("Switching character scripts to {:?}", character_id);
        for id in self.running_of_type(ScriptType::Character) {
            if let Err(e) = self.stop_script(&id).await {
                warn!("Failed to stop script {}: {}", id, e);
            }
        }

        let Some(character_id) = character_id else {
            return;
        };
        let ids: Vec<String> = self
            .read_repo()
            .scripts_of(&ScriptOwner::Character(character_id.to_string()))
            .iter()
            .map(|script| script.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.run_script(&id).await {
                warn!("Failed to start script {}: {}", id, e);
            }
        }
    }

    /// Purges a deleted character: its scripts are stopped and removed, and
    /// it leaves the allow-list. Returns how many scripts were removed.
    pub async fn on_character_deleted(&self, character_id: &str) -> usize {
        let owner = ScriptOwner::Character(character_id.to_string());
        let ids: Vec<String> = self
            .read_repo()
            .scripts_of(&owner)
            .iter()
            .map(|script| script.id.clone())
            .collect();
        for id in &ids {
            if let Err(e) = self.stop_script(id).await {
                warn!("Failed to stop script {}: {}", id, e);
            }
        }

        let (removed, was_listed) = {
            let mut repo = self.write_repo();
            let removed = repo.characters.remove(character_id).map(|scripts| scripts.len()).unwrap_or(0);
            let before = repo.characters_with_scripts.len();
            repo.characters_with_scripts.retain(|id| id != character_id);
            (removed, repo.characters_with_scripts.len() != before)
        };
        if removed > 0 || was_listed {
            self.saver.request();
            info!("🧹 Purged {} script(s) of deleted character '{}'", removed, character_id);
        }
        removed
    }

    // Lifecycle

    /// Starts every eligible script.
    pub async fn start(&self) -> Result<usize, ScriptError> {
        let ids: Vec<String> = {
            let repo = self.read_repo();
            let mut ids: Vec<String> = repo.global.iter().map(|script| script.id.clone()).collect();
            if let Some(character) = self.store.active_character() {
                ids.extend(
                    repo.scripts_of(&ScriptOwner::Character(character))
                        .iter()
                        .map(|script| script.id.clone()),
                );
            }
            ids
        };

        let mut started = 0;
        for id in ids {
            if self.run_script(&id).await? {
                started += 1;
            }
        }
        info!("📜 Started {} script(s)", started);
        Ok(started)
    }

    /// Starts a script if it is eligible and not already running. Returns
    /// whether it was started.
    ///
    /// The slot is reserved before the launcher is awaited, so overlapping
    /// calls launch the script once. A stop that lands while the launch is
    /// in flight wins: the freshly launched frame is released again.
    pub async fn run_script(&self, id: &str) -> Result<bool, ScriptError> {
        let script = {
            let repo = self.read_repo();
            let (owner, script) = repo
                .find(id)
                .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
            let active = self.store.active_character();
            if !script.enabled || !repo.owner_may_run(&owner, active.as_deref()) {
                return Ok(false);
            }
            script.clone()
        };

        let frame = FrameId::for_script(id);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        match self.running.entry(id.to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(RunSlot {
                    frame: frame.clone(),
                    ticket,
                });
            }
        }

        if let Err(e) = self.launcher.launch(&frame, &script).await {
            self.running.remove_if(id, |_, slot| slot.ticket == ticket);
            return Err(e);
        }

        let current = self.running.get(id).map(|slot| slot.ticket);
        if current != Some(ticket) {
            debug!("Script {} was stopped while launching", id);
            if current.is_none() {
                self.bridge.detach_frame(&frame);
                self.launcher.stop(&frame).await?;
            }
            return Ok(false);
        }

        self.frames.insert(frame.clone(), id.to_string());
        self.buttons.render(&script);
        info!("▶️ Script '{}' running in frame {}", script.name, frame);
        Ok(true)
    }

    /// Stops a running script: removes its buttons, releases its frame and
    /// every channel waiter the frame owned. Returns whether it was running.
    pub async fn stop_script(&self, id: &str) -> Result<bool, ScriptError> {
        let Some((_, slot)) = self.running.remove(id) else {
            return Ok(false);
        };
        let frame = slot.frame;
        self.frames.remove(&frame);
        self.buttons.remove(id);
        self.bridge.detach_frame(&frame);
        self.launcher.stop(&frame).await?;
        info!("⏹️ Script {} stopped", id);
        Ok(true)
    }

    /// Stops every running script.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.running.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_script(&id).await {
                warn!("Failed to stop script {} during shutdown: {}", id, e);
            }
        }
        self.buttons.clear();
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains_key(id)
    }

    pub fn running_scripts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn script_for_frame(&self, frame: &FrameId) -> Option<String> {
        self.frames.get(frame).map(|entry| entry.value().clone())
    }

    /// The script a request addresses: the explicit id if given, otherwise
    /// the script running in the requesting frame.
    pub fn resolve_script(&self, frame: &FrameId, script_id: Option<String>) -> Result<String, ScriptError> {
        match script_id {
            Some(id) => Ok(id),
            None => self
                .script_for_frame(frame)
                .ok_or_else(|| ScriptError::UnknownFrame(frame.clone())),
        }
    }

    // Buttons

    pub fn buttons(&self, id: &str) -> Result<Vec<ScriptButton>, ScriptError> {
        self.with_script(id, |script| script.buttons.clone())
    }

    pub fn button_containers(&self) -> Vec<ButtonContainer> {
        self.buttons.containers()
    }

    /// Replaces a script's buttons, re-rendering them if it runs.
    pub fn replace_buttons(&self, id: &str, buttons: Vec<ScriptButton>) -> Result<(), ScriptError> {
        self.update_script(id, |script| script.buttons = buttons)
    }

    /// Appends buttons whose names the script does not have yet. Returns how
    /// many were added.
    pub fn append_buttons(&self, id: &str, buttons: Vec<ScriptButton>) -> Result<usize, ScriptError> {
        let mut added = 0;
        self.update_script(id, |script| {
            for button in buttons {
                if script.buttons.iter().all(|existing| existing.name != button.name) {
                    script.buttons.push(button);
                    added += 1;
                }
            }
        })?;
        Ok(added)
    }

    /// Clicks a rendered button: fires `{script_id}_{name}` on the host
    /// emitter and publishes it on the notification channel of the same
    /// name. Returns how many listeners and waiters were reached.
    pub async fn click_button(&self, id: &str, name: &str) -> Result<usize, ScriptError> {
        if !self.buttons.is_rendered(id, name) {
            return Err(ScriptError::UnknownButton {
                script_id: id.to_string(),
                name: name.to_string(),
            });
        }

        let event = button_event_name(id, name);
        debug!("Button '{}' clicked", event);
        let listeners = self
            .events()
            .emit_value(&event, &json!({ "script_id": id, "button": name }));
        let waiters = self.bridge.publish(&event, Vec::new()).await;
        Ok(listeners + waiters)
    }

    // Script data

    pub fn script_data(&self, id: &str) -> Result<Variables, ScriptError> {
        self.with_script(id, |script| script.data.clone())
    }

    pub fn replace_script_data(&self, id: &str, data: Variables) -> Result<(), ScriptError> {
        self.update_script(id, |script| script.data = data)
    }

    fn with_script<T>(&self, id: &str, f: impl FnOnce(&Script) -> T) -> Result<T, ScriptError> {
        self.read_repo()
            .find(id)
            .map(|(_, script)| f(script))
            .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))
    }

    /// Mutates a script without restarting it; buttons are re-rendered if
    /// it runs.
    fn update_script(&self, id: &str, f: impl FnOnce(&mut Script)) -> Result<(), ScriptError> {
        let script = {
            let mut repo = self.write_repo();
            let script = repo
                .find_mut(id)
                .ok_or_else(|| ScriptError::UnknownScript(id.to_string()))?;
            f(script);
            script.clone()
        };
        self.saver.request();
        if self.running.contains_key(id) {
            self.buttons.render(&script);
        }
        Ok(())
    }

    fn owner_for(&self, script_type: ScriptType) -> Result<ScriptOwner, ScriptError> {
        match script_type {
            ScriptType::Global => Ok(ScriptOwner::Global),
            ScriptType::Character => self
                .store
                .active_character()
                .map(ScriptOwner::Character)
                .ok_or(ScriptError::NoActiveCharacter),
        }
    }

    fn running_of_type(&self, script_type: ScriptType) -> Vec<String> {
        let repo = self.read_repo();
        self.running
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| {
                repo.find(id)
                    .map(|(owner, _)| owner.script_type() == script_type)
                    .unwrap_or(true)
            })
            .collect()
    }

    fn read_repo(&self) -> RwLockReadGuard<'_, ScriptRepository> {
        self.repo.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_repo(&self) -> RwLockWriteGuard<'_, ScriptRepository> {
        self.repo.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs `f` on a spawned task if the manager is still alive and a runtime
/// is available.
fn spawn_with<F, Fut>(weak: &Weak<ScriptManager>, f: F)
where
    F: FnOnce(Arc<ScriptManager>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let Some(manager) = weak.upgrade() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(f(manager));
        }
        Err(_) => warn!("No runtime to follow character events on"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{VariableOption, VariableScope};
    use std::time::Duration;

    struct Fixture {
        bridge: Arc<HostBridge>,
        store: Arc<VariableStore>,
        launcher: Arc<InProcessLauncher>,
        manager: Arc<ScriptManager>,
    }

    fn fixture() -> Fixture {
        let bridge = Arc::new(HostBridge::with_defaults());
        let store = Arc::new(VariableStore::new(Arc::clone(bridge.events())));
        let launcher = Arc::new(InProcessLauncher::new(Arc::clone(&bridge)));
        let manager = Arc::new(ScriptManager::new(
            Arc::clone(&bridge),
            Arc::clone(&store),
            launcher.clone() as Arc<dyn FrameLauncher>,
        ));
        Fixture {
            bridge,
            store,
            launcher,
            manager,
        }
    }

    fn button_script(id: &str) -> Script {
        Script::new(id, "")
            .with_id(id)
            .enabled(true)
            .with_buttons(vec![ScriptButton::new("Go")])
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_enabled_global_script_runs_with_buttons() {
        let fx = fixture();
        let id = fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();

        assert_eq!(id, "g");
        assert!(fx.manager.is_running("g"));
        assert!(fx.bridge.is_connected(&FrameId::for_script("g")));
        assert_eq!(fx.manager.script_for_frame(&FrameId::for_script("g")).as_deref(), Some("g"));
        assert_eq!(fx.manager.button_containers()[0].id, "script_container_g");
    }

    #[tokio::test]
    async fn test_toggling_enabled_adds_and_removes_buttons() {
        let fx = fixture();
        fx.manager
            .add_script(ScriptType::Global, button_script("g").enabled(false))
            .await
            .unwrap();
        assert!(fx.manager.button_containers().is_empty());

        fx.manager.set_enabled("g", true).await.unwrap();
        assert_eq!(fx.manager.button_containers().len(), 1);

        fx.manager.set_enabled("g", false).await.unwrap();
        assert!(fx.manager.button_containers().is_empty());
        assert!(!fx.bridge.is_connected(&FrameId::for_script("g")));
        assert_eq!(fx.launcher.launched(), 0);
    }

    #[tokio::test]
    async fn test_colliding_id_gets_fresh_one() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();
        let second = fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();

        assert_ne!(second, "g");
        assert_eq!(fx.manager.scripts(ScriptType::Global).len(), 2);
    }

    #[tokio::test]
    async fn test_character_script_needs_active_character() {
        let fx = fixture();
        let result = fx.manager.add_script(ScriptType::Character, button_script("c")).await;
        assert_eq!(result, Err(ScriptError::NoActiveCharacter));
    }

    #[tokio::test]
    async fn test_character_scripts_follow_allow_list_and_switches() {
        let fx = fixture();
        fx.store.set_active_character(Some("alice"));
        fx.manager.add_script(ScriptType::Character, button_script("c")).await.unwrap();
        assert!(!fx.manager.is_running("c"));

        fx.manager.allow_character("alice", true).await.unwrap();
        assert!(fx.manager.is_running("c"));

        fx.manager.on_character_changed(Some("bob")).await;
        assert!(!fx.manager.is_running("c"));

        fx.manager.on_character_changed(Some("alice")).await;
        assert!(fx.manager.is_running("c"));
    }

    #[tokio::test]
    async fn test_global_master_switch() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();

        fx.manager.set_global_enabled(false).await.unwrap();
        assert!(fx.manager.running_scripts().is_empty());
        fx.manager.set_global_enabled(true).await.unwrap();
        assert_eq!(fx.manager.running_scripts(), vec!["g"]);
    }

    #[tokio::test]
    async fn test_deleted_character_cascades_through_host_events() {
        let fx = fixture();
        fx.manager.bind_host_events();
        fx.store.set_active_character(Some("alice"));
        fx.manager.allow_character("alice", true).await.unwrap();
        fx.manager.add_script(ScriptType::Character, button_script("c")).await.unwrap();
        assert!(fx.manager.is_running("c"));

        fx.store.delete_character("alice");
        let manager = Arc::clone(&fx.manager);
        settle(move || manager.script("c").is_none()).await;

        assert!(fx.manager.script("c").is_none());
        assert!(!fx.manager.is_running("c"));
        assert!(fx.manager.snapshot().characters_with_scripts.is_empty());
        assert!(fx.manager.button_containers().is_empty());
    }

    #[tokio::test]
    async fn test_move_script_between_owners() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();
        assert_eq!(fx.manager.move_script("g").await, Err(ScriptError::NoActiveCharacter));
        assert!(fx.manager.is_running("g"));

        fx.store.set_active_character(Some("alice"));
        assert_eq!(fx.manager.move_script("g").await.unwrap(), ScriptType::Character);
        // Not allow-listed, so it stays stopped under its new owner.
        assert!(!fx.manager.is_running("g"));
        assert_eq!(fx.manager.scripts(ScriptType::Character).len(), 1);
    }

    #[tokio::test]
    async fn test_append_only_adds_new_names() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();

        let added = fx
            .manager
            .append_buttons("g", vec![ScriptButton::new("Go"), ScriptButton::new("Stop")])
            .unwrap();
        assert_eq!(added, 1);
        let names: Vec<String> = fx.manager.buttons("g").unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["Go", "Stop"]);
        assert_eq!(fx.manager.button_containers()[0].buttons.len(), 2);
    }

    #[tokio::test]
    async fn test_click_reaches_listener_and_script_frame() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();
        let client = fx.launcher.client(&FrameId::for_script("g")).unwrap();

        let waiting = tokio::spawn(async move { client.wait("g_Go").await });
        let bridge = Arc::clone(&fx.bridge);
        settle(move || bridge.channels().waiter_count("g_Go") == 1).await;

        let clicks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&clicks);
        fx.bridge.events().on_raw("g_Go", move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        assert_eq!(fx.manager.click_button("g", "Go").await.unwrap(), 2);
        assert_eq!(waiting.await.unwrap().unwrap(), Vec::<serde_json::Value>::new());
        assert_eq!(clicks.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert!(matches!(
            fx.manager.click_button("g", "Nope").await,
            Err(ScriptError::UnknownButton { .. })
        ));
    }

    #[tokio::test]
    async fn test_stopping_releases_frame_waiters() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();
        let client = fx.launcher.client(&FrameId::for_script("g")).unwrap();
        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.wait("tick").await }
        });
        let bridge = Arc::clone(&fx.bridge);
        settle(move || bridge.channels().waiter_count("tick") == 1).await;

        fx.manager.delete_script("g").await.unwrap();
        assert_eq!(fx.bridge.channels().waiter_count("tick"), 0);
        assert!(waiting.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_edit_restarts_running_script() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();
        fx.manager
            .edit_script("g", |script| {
                script.content = "updated".to_string();
                script.id = "renamed".to_string();
            })
            .await
            .unwrap();

        assert_eq!(fx.manager.script("g").unwrap().content, "updated");
        assert!(fx.manager.is_running("g"));
    }

    #[tokio::test]
    async fn test_script_data_is_separate_from_variable_scopes() {
        let fx = fixture();
        fx.manager.add_script(ScriptType::Global, button_script("g")).await.unwrap();
        let data = json!({"count": 1}).as_object().cloned().unwrap();
        fx.manager.replace_script_data("g", data.clone()).unwrap();

        assert_eq!(fx.manager.script_data("g").unwrap(), data);
        assert!(fx
            .store
            .read(&VariableOption::scope(VariableScope::Global))
            .unwrap()
            .is_empty());
    }

    /// Launcher whose launches take a while, counting what it was asked to do.
    #[derive(Debug, Default)]
    struct SlowLauncher {
        launches: std::sync::atomic::AtomicUsize,
        stops: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl FrameLauncher for SlowLauncher {
        async fn launch(&self, _frame: &FrameId, _script: &Script) -> Result<(), ScriptError> {
            self.launches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }

        async fn stop(&self, _frame: &FrameId) -> Result<(), ScriptError> {
            self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn slow_manager() -> (Arc<SlowLauncher>, ScriptManager) {
        let bridge = Arc::new(HostBridge::with_defaults());
        let store = Arc::new(VariableStore::new(Arc::clone(bridge.events())));
        let launcher = Arc::new(SlowLauncher::default());
        let manager = ScriptManager::new(bridge, store, launcher.clone() as Arc<dyn FrameLauncher>);
        manager.provision_builtin(Script::new("a", "").with_id("a").enabled(true));
        (launcher, manager)
    }

    #[tokio::test]
    async fn test_overlapping_runs_launch_once() {
        let (launcher, manager) = slow_manager();

        let (first, second) = tokio::join!(manager.run_script("a"), manager.run_script("a"));
        let started = [first.unwrap(), second.unwrap()];

        assert_eq!(started.iter().filter(|started| **started).count(), 1);
        assert_eq!(launcher.launches.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.running_scripts(), vec!["a"]);
        assert_eq!(manager.script_for_frame(&FrameId::for_script("a")).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_stop_during_launch_releases_the_frame() {
        let (launcher, manager) = slow_manager();

        let (started, stopped) = tokio::join!(manager.run_script("a"), async {
            tokio::task::yield_now().await;
            manager.stop_script("a").await
        });

        assert!(!started.unwrap());
        assert!(stopped.unwrap());
        assert!(!manager.is_running("a"));
        assert!(manager.script_for_frame(&FrameId::for_script("a")).is_none());
        // Once for the stop itself, once for the frame the launch brought up.
        assert_eq!(launcher.stops.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
