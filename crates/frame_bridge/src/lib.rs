//! # Frame Bridge
//!
//! Request/response correlation, notification channels and variable sync
//! between a host document and the script frames it embeds.
//!
//! ## Core Features
//!
//! - **Correlated calls**: a frame sends `{request, uid, ...}` and awaits the
//!   `{request}_callback` reply carrying the same uid
//! - **Typed commands**: payloads and results decode into Rust types through
//!   the [`Command`] trait
//! - **Notification channel**: `iframe_notify_all` releases every frame
//!   currently parked in `iframe_wait` on the same channel
//! - **Scoped variables**: global, character, chat and per-floor message
//!   variables with change events and a diffing sync engine
//! - **Frame events**: frames subscribe to host events and receive each
//!   emission as an `iframe_event_callback` message
//! - **Scripts**: per-script frames, buttons, and bound data, following the
//!   active character
//!
//! ## Architecture Overview
//!
//! The host side is a [`HostBridge`]: a handler table keyed by request tag,
//! the registry of connected frames and the channel waiters. Frames talk to
//! it through a [`Transport`]; in-process frames get a [`FrameClient`] from
//! [`HostBridge::attach_frame`]. [`create_host_runtime`] wires the bridge,
//! the [`VariableStore`], the [`ScriptManager`] and persistence together.
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use frame_bridge::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = Arc::new(HostBridge::with_defaults());
//!     bridge.register("getX", |_ctx, _request| async move { Ok(Some(json!(5))) });
//!
//!     let frame = bridge.attach_frame(FrameId::new("demo"))?;
//!     let reply = frame.send_correlated("getX", Default::default()).await?;
//!     assert_eq!(reply, Some(json!(5)));
//!     Ok(())
//! }
//! ```

// tests
#[cfg(test)]
mod test_integration;

// Core modules
pub mod api;
pub mod channel;
pub mod client;
pub mod error;
pub mod events;
pub mod message;
pub mod notify;
pub mod persistence;
pub mod scripts;
pub mod shutdown;
pub mod system;
pub mod transport;
pub mod utils;
pub mod variables;

// Re-export commonly used items for convenience
pub use api::{create_host_runtime, HostRuntime, RuntimeOptions};
pub use client::FrameClient;
pub use error::{BridgeError, HandlerError};
pub use events::{HostEvents, ListenerId};
pub use message::{
    callback_name, ChannelMessage, Command, EventCallback, ReplyMessage, RequestMessage, Uid, UidGenerator,
};
pub use notify::{LogNotifier, Notifier};
pub use persistence::{HostSnapshot, JsonFilePersistence, NoopPersistence, Persistence, PersistenceError};
pub use shutdown::ShutdownState;
pub use system::{
    BridgeStats, CommandHandler, DispatchOutcome, EventClearAll, EventClearEvent, EventClearListener, EventEmit,
    EventMakeFirst, EventMakeLast, EventOn, EventOnce, EventRemoveListener, FnHandler, FrameDispatch, HandlerResult,
    HostBridge, ListenerEntry, RequestContext, RequestHandler,
};
pub use transport::{duplex, DuplexPort, DuplexSender, FrameId, Transport};
pub use utils::{current_timestamp, current_timestamp_millis};

pub use scripts::{
    FrameLauncher, InProcessLauncher, LoggingLauncher, Script, ScriptButton, ScriptError, ScriptManager,
    ScriptRepository, ScriptType,
};
pub use variables::{
    MessageId, SyncState, VariableChange, VariableError, VariableObserver, VariableOption, VariableScope,
    VariableStore, VariableSyncService, Variables,
};

// External dependencies that embedders commonly need
pub use async_trait::async_trait;
pub use serde_json;
