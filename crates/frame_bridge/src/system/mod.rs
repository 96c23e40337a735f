//! # Host Bridge
//!
//! The composed host-side service: handler registry, dispatcher, frame
//! registry, notification channel delivery and statistics, with an explicit
//! shutdown that releases everything tied to the connected frames.
//!
//! ## Module Organization
//!
//! - `core` - the [`HostBridge`] struct and its lifecycle
//! - `handlers` - handler trait, closure/command adapters, registration
//! - `dispatch` - inbound routing, per-frame ordering, reply production,
//!   publish/wait
//! - `frames` - frame registry and in-process attachment
//! - `frame_events` - host event listeners held for frames (`iframe_event_*`)
//! - `stats` - counters and the [`BridgeStats`] snapshot

mod core;
mod dispatch;
mod frame_events;
mod frames;
mod handlers;
mod stats;


pub use self::core::HostBridge;
pub use dispatch::{DispatchOutcome, FrameDispatch};
pub use frame_events::{
    EventClearAll, EventClearEvent, EventClearListener, EventEmit, EventMakeFirst, EventMakeLast, EventOn, EventOnce,
    EventRemoveListener, ListenerEntry,
};
pub use handlers::{CommandHandler, FnHandler, HandlerResult, RequestContext, RequestHandler};
pub use stats::BridgeStats;
