//! # Persistence
//!
//! The bridge does not own durability. It hands a [`HostSnapshot`] to a
//! [`Persistence`] collaborator, and writes are coalesced through a
//! [`Debouncer`]: every mutation requests a save, and the save runs once the
//! requests have been quiet for the configured delay.

use crate::scripts::ScriptRepository;
use crate::variables::StoreSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Everything the host persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    #[serde(default)]
    pub variables: StoreSnapshot,
    #[serde(default)]
    pub scripts: ScriptRepository,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable storage for the host's state.
#[async_trait]
pub trait Persistence: Send + Sync + fmt::Debug {
    /// Loads the last saved state, or `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<HostSnapshot>, PersistenceError>;

    async fn save(&self, snapshot: &HostSnapshot) -> Result<(), PersistenceError>;
}

/// Keeps nothing. State lives only as long as the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl Persistence for NoopPersistence {
    async fn load(&self) -> Result<Option<HostSnapshot>, PersistenceError> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &HostSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Stores the snapshot as pretty-printed JSON in one file.
///
/// Saves write a sibling temporary file and rename it over the target, so a
/// crash mid-save leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn load(&self) -> Result<Option<HostSnapshot>, PersistenceError> {
        if !tokio::fs::try_exists(&self.path).await? {
            info!("📂 No saved state at {}, starting fresh", self.path.display());
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let snapshot = serde_json::from_str(&content)?;
        info!("📂 Loaded saved state from {}", self.path.display());
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &HostSnapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("💾 Saved state to {}", self.path.display());
        Ok(())
    }
}

/// Requests a debounced save. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Debouncer {
    tx: Option<mpsc::UnboundedSender<()>>,
}

/// Receiving half of a [`Debouncer`], turned into a task by
/// [`DebounceQueue::spawn`].
#[derive(Debug)]
pub struct DebounceQueue {
    rx: mpsc::UnboundedReceiver<()>,
}

impl Debouncer {
    pub fn channel() -> (Debouncer, DebounceQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Debouncer { tx: Some(tx) }, DebounceQueue { rx })
    }

    /// A debouncer whose requests go nowhere.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn request(&self) {
        if let Some(tx) = &self.tx {
            // A closed queue means nobody persists anymore.
            let _ = tx.send(());
        }
    }
}

impl DebounceQueue {
    /// Runs `flush` after every burst of requests, once `delay` has passed
    /// without a new request.
    ///
    /// When every [`Debouncer`] is dropped, a pending burst is flushed
    /// immediately and the task ends.
    pub fn spawn<F, Fut>(mut self, delay: Duration, flush: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            while self.rx.recv().await.is_some() {
                let mut requests = 1usize;
                let closed = loop {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => break false,
                        next = self.rx.recv() => match next {
                            Some(()) => requests += 1,
                            None => break true,
                        },
                    }
                };

                trace!("Flushing after {} save request(s)", requests);
                flush().await;
                if closed {
                    break;
                }
            }
        })
    }
}
