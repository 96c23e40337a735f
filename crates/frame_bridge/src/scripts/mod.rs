//! # Scripts
//!
//! User scripts, each running in its own frame.
//!
//! A script is either global or belongs to one character. Global scripts
//! run while the global master switch is on; a character's scripts run while
//! that character is active and allowed to run scripts. Either kind also
//! needs its own `enabled` flag.
//!
//! ## Module Organization
//!
//! - [`model`] - [`Script`], [`ScriptButton`], [`ScriptRepository`]
//! - [`buttons`] - the per-script button containers and click routing
//! - [`manager`] - [`ScriptManager`], the lifecycle of running scripts
//! - [`handlers`] - the `iframe_*_script_*` request handlers

pub mod buttons;
pub mod handlers;
pub mod manager;
pub mod model;

pub use buttons::{button_event_name, container_id, ButtonContainer, ButtonManager, RenderedButton};
pub use handlers::{
    register_script_handlers, AppendScriptButtons, GetScriptButtons, GetScriptVariables, ReplaceScriptButtons,
    ReplaceScriptVariables,
};
pub use manager::{FrameLauncher, InProcessLauncher, LoggingLauncher, ScriptManager};
pub use model::{Script, ScriptButton, ScriptDraft, ScriptRepository, ScriptType};

use crate::transport::FrameId;

/// Failures of script management.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Unknown script '{0}'")]
    UnknownScript(String),
    /// The frame is not running any script
    #[error("Frame {0} is not bound to a script")]
    UnknownFrame(FrameId),
    /// Character scripts need an active character
    #[error("No character is selected")]
    NoActiveCharacter,
    #[error("Invalid script: {0}")]
    Invalid(String),
    /// The frame launcher failed to start or stop a script frame
    #[error("Failed to launch script frame: {0}")]
    Launch(String),
    /// The clicked button is not rendered
    #[error("Script '{script_id}' has no visible button '{name}'")]
    UnknownButton { script_id: String, name: String },
}
