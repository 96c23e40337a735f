//! # Error Types
//!
//! Two layers of failure exist in the bridge:
//!
//! - [`BridgeError`]: plumbing failures (transport, correlation, shutdown).
//!   These are returned to the caller of a bridge operation.
//! - [`HandlerError`]: what a request handler may fail with. These never cross
//!   the reply boundary; the dispatcher downgrades them to a user notification
//!   plus an undefined result.

use crate::message::Uid;
use crate::scripts::ScriptError;
use crate::transport::FrameId;
use crate::variables::VariableError;

/// Errors produced by the bridge itself.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A message could not be converted to or from its wire form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The underlying transport refused the message
    #[error("Transport error: {0}")]
    Transport(String),
    /// No transport is registered for the frame
    #[error("Unknown frame: {0}")]
    UnknownFrame(FrameId),
    /// A freshly generated correlation id is already waiting for a reply.
    /// This is a bug in the id generator, never something to retry past.
    #[error("Correlation id {0} is already in flight")]
    UidCollision(Uid),
    /// The waiting side was torn down before a reply arrived
    #[error("Channel closed before a reply arrived")]
    Closed,
    /// An opt-in timeout elapsed
    #[error("Timed out waiting for '{0}'")]
    Timeout(String),
    /// The bridge no longer accepts work
    #[error("Bridge is shutting down")]
    ShuttingDown,
}

/// Errors a request handler may fail with.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The request payload was well-formed JSON but semantically invalid
    #[error("Invalid request: {0}")]
    Validation(String),
    /// The handler ran and failed
    #[error("Handler execution error: {0}")]
    Execution(String),
    /// The payload did not match the shape the handler expects
    #[error("Malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl HandlerError {
    /// Short category name shown in front of the message in user notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Validation(_) => "ValidationError",
            HandlerError::Execution(_) => "ExecutionError",
            HandlerError::Serialization(_) => "PayloadError",
            HandlerError::Variable(_) => "VariableError",
            HandlerError::Script(_) => "ScriptError",
            HandlerError::Bridge(_) => "BridgeError",
        }
    }
}
