//! # Variables
//!
//! Four independently scoped variable mappings shared between the host and
//! its frames, and the engine that keeps observers in step with them.
//!
//! | scope       | backing                           | change signal                         |
//! |-------------|-----------------------------------|---------------------------------------|
//! | `global`    | host settings                     | `settings_updated`                    |
//! | `character` | one mapping per character record  | `character_variables_changed`         |
//! | `chat`      | the open chat's metadata          | none; observers poll                  |
//! | `message`   | active page of one floor          | `message_variables_changed`           |
//!
//! ## Module Organization
//!
//! - [`scope`] - scope names and the request-level [`VariableOption`]
//! - [`store`] - [`VariableStore`], the host-resident backing storage
//! - [`diff`] - added/removed/updated classification between two snapshots
//! - [`sync`] - [`VariableSyncService`], diff-driven observer notifications
//! - [`handlers`] - the `iframe_*_variables` request handlers
//! - [`api`] - the frame-side helpers built on read and replace
//!
//! On the host, [`VariableStore::update`] is one critical section. The
//! frame-side `update_variables_with` is a read request followed by a
//! replace request: two frames updating the same scope concurrently race,
//! and the later replace wins.

pub mod api;
pub mod diff;
pub mod handlers;
pub mod scope;
pub mod store;
pub mod sync;

pub use diff::{diff, VariableDiff};
pub use handlers::{register_variable_handlers, GetVariables, ReplaceVariables, SetVariablesLegacy};
pub use scope::{MessageId, VariableOption, VariableScope};
pub use store::{Floor, StoreSnapshot, VariableStore};
pub use sync::{SyncState, VariableChange, VariableObserver, VariableSyncService};

/// A JSON object of variables.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Failures of the variable store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
    /// A message id that names no floor of the open chat
    #[error("Message floor {0} is out of range (chat has {1} floor(s))")]
    FloorOutOfRange(i64, usize),
    /// `latest` was requested but the chat has no floors
    #[error("The chat has no messages")]
    EmptyChat,
    /// Character variables need an active character
    #[error("No character is selected")]
    NoActiveCharacter,
    /// The character id is not known to the store
    #[error("Unknown character '{0}'")]
    UnknownCharacter(String),
    /// A page index outside the floor's alternates
    #[error("Floor {floor} has no page {page}")]
    PageOutOfRange { floor: usize, page: usize },
}
