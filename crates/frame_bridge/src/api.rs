//! High-level API for composing a complete host.

use crate::error::BridgeError;
use crate::events::HostEvents;
use crate::notify::{LogNotifier, Notifier};
use crate::persistence::{DebounceQueue, Debouncer, HostSnapshot, NoopPersistence, Persistence, PersistenceError};
use crate::scripts::{register_script_handlers, FrameLauncher, LoggingLauncher, Script, ScriptManager};
use crate::system::HostBridge;
use crate::variables::{register_variable_handlers, VariableStore};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Knobs of a [`HostRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Quiet period before pending state changes are saved
    pub persist_debounce: Duration,
    /// Global scripts provisioned at start unless their id is taken
    pub builtin_scripts: Vec<Script>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_millis(1000),
            builtin_scripts: Vec::new(),
        }
    }
}

/// A host with every service wired together: the bridge, the variable store,
/// the script manager and debounced persistence of the latter two.
pub struct HostRuntime {
    bridge: Arc<HostBridge>,
    store: Arc<VariableStore>,
    scripts: Arc<ScriptManager>,
    persistence: Arc<dyn Persistence>,
    options: RuntimeOptions,
    queue: Mutex<Option<DebounceQueue>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("bridge", &self.bridge)
            .field("scripts", &self.scripts)
            .field("persistence", &self.persistence)
            .finish()
    }
}

/// Creates a runtime with the given collaborators.
///
/// `launcher` receives the bridge so in-process launchers can attach frames
/// to it.
///
/// ```rust,no_run
/// use frame_bridge::{create_host_runtime, InProcessLauncher, JsonFilePersistence, LogNotifier, RuntimeOptions};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runtime = create_host_runtime(
///         Arc::new(LogNotifier),
///         Arc::new(JsonFilePersistence::new("state.json")),
///         |bridge| Arc::new(InProcessLauncher::new(Arc::clone(bridge))),
///         RuntimeOptions::default(),
///     );
///     runtime.start().await?;
///     runtime.shutdown().await;
///     Ok(())
/// }
/// ```
pub fn create_host_runtime<L>(
    notifier: Arc<dyn Notifier>,
    persistence: Arc<dyn Persistence>,
    launcher: L,
    options: RuntimeOptions,
) -> HostRuntime
where
    L: FnOnce(&Arc<HostBridge>) -> Arc<dyn FrameLauncher>,
{
    let events = Arc::new(HostEvents::new());
    let bridge = Arc::new(HostBridge::new(Arc::clone(&events), notifier));
    let (saver, queue) = Debouncer::channel();

    let store = Arc::new(VariableStore::with_saver(events, saver.clone()));
    let launcher = launcher(&bridge);
    let scripts = Arc::new(ScriptManager::with_saver(
        Arc::clone(&bridge),
        Arc::clone(&store),
        launcher,
        saver,
    ));

    HostRuntime {
        bridge,
        store,
        scripts,
        persistence,
        options,
        queue: Mutex::new(Some(queue)),
        flusher: Mutex::new(None),
    }
}

impl HostRuntime {
    /// A runtime that keeps no state and only logs script frames.
    pub fn with_defaults() -> Self {
        create_host_runtime(
            Arc::new(LogNotifier),
            Arc::new(NoopPersistence),
            |_| Arc::new(LoggingLauncher),
            RuntimeOptions::default(),
        )
    }

    pub fn bridge(&self) -> &Arc<HostBridge> {
        &self.bridge
    }

    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    pub fn scripts(&self) -> &Arc<ScriptManager> {
        &self.scripts
    }

    /// Loads saved state, registers the request handlers, provisions the
    /// built-in scripts, starts eligible scripts and the persistence task.
    pub async fn start(&self) -> Result<(), PersistenceError> {
        if let Some(snapshot) = self.persistence.load().await? {
            self.store.restore(snapshot.variables);
            self.scripts.restore(snapshot.scripts);
        }

        register_variable_handlers(&self.bridge, Arc::clone(&self.store));
        register_script_handlers(&self.bridge, Arc::clone(&self.scripts));
        self.bridge.register_event_handlers();
        self.scripts.bind_host_events();

        for script in &self.options.builtin_scripts {
            self.scripts.provision_builtin(script.clone());
        }
        if let Err(e) = self.scripts.start().await {
            error!("Failed to start scripts: {}", e);
        }

        let queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(queue) = queue {
            let store = Arc::downgrade(&self.store);
            let scripts = Arc::downgrade(&self.scripts);
            let persistence = Arc::clone(&self.persistence);
            let handle = queue.spawn(self.options.persist_debounce, move || {
                let store = store.clone();
                let scripts = scripts.clone();
                let persistence = Arc::clone(&persistence);
                async move {
                    save_from(&store, &scripts, persistence.as_ref()).await;
                }
            });
            *self.flusher.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        }

        info!(
            "🚀 Host runtime started with {} handler(s) and {} running script(s)",
            self.bridge.handler_count(),
            self.scripts.running_scripts().len()
        );
        Ok(())
    }

    /// The state that would be persisted right now.
    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            variables: self.store.snapshot(),
            scripts: self.scripts.snapshot(),
        }
    }

    /// Saves immediately, bypassing the debounce.
    pub async fn save_now(&self) -> Result<(), PersistenceError> {
        self.persistence.save(&self.snapshot()).await
    }

    /// Stops every script, shuts the bridge down and writes a final save.
    pub async fn shutdown(&self) {
        self.scripts.shutdown().await;
        self.bridge.shutdown();

        let flusher = self.flusher.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(handle) = flusher {
            handle.abort();
        }
        match self.save_now().await {
            Ok(()) => info!("💾 Final state saved"),
            Err(e) => error!("Failed to save state on shutdown: {}", e),
        }
    }

    /// Fails if the runtime has been shut down.
    pub fn ensure_running(&self) -> Result<(), BridgeError> {
        self.bridge.shutdown_state().ensure_running()
    }
}

async fn save_from(store: &Weak<VariableStore>, scripts: &Weak<ScriptManager>, persistence: &dyn Persistence) {
    let (Some(store), Some(scripts)) = (store.upgrade(), scripts.upgrade()) else {
        return;
    };
    let snapshot = HostSnapshot {
        variables: store.snapshot(),
        scripts: scripts.snapshot(),
    };
    if let Err(e) = persistence.save(&snapshot).await {
        error!("Failed to save state: {}", e);
    }
}
