//! # Transport
//!
//! The bridge never talks to a concrete messaging layer. Everything goes
//! through [`Transport`], a one-way "post this message" primitive; the receive
//! half is whatever pumps inbound messages into [`crate::HostBridge`] or
//! [`crate::FrameClient`].
//!
//! [`duplex()`] builds an in-process pair of ends backed by unbounded tokio
//! channels, which is how frames are attached in tests and embedded hosts.

use crate::error::BridgeError;
use async_trait::async_trait;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Name of an execution frame (the host, or one of its isolated children).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(CompactString);

impl FrameId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(CompactString::new(name.as_ref()))
    }

    /// Frame that runs the script with the given id.
    pub fn for_script(script_id: &str) -> Self {
        Self(CompactString::new(format!("script-{}", script_id)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Outbound half of a structured messaging channel.
///
/// Messages must be plain JSON: no handles, no cycles. Delivery is
/// fire-and-forget; a successful `post` only means the message was handed to
/// the channel.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn post(&self, message: Value) -> Result<(), BridgeError>;
}

/// Sending end of an in-process duplex channel.
#[derive(Debug, Clone)]
pub struct DuplexSender {
    tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl Transport for DuplexSender {
    async fn post(&self, message: Value) -> Result<(), BridgeError> {
        self.tx
            .send(message)
            .map_err(|_| BridgeError::Transport("peer endpoint dropped".to_string()))
    }
}

/// One end of an in-process duplex channel: post to the peer through
/// `sender`, read what the peer posted from `inbox`.
#[derive(Debug)]
pub struct DuplexPort {
    pub sender: DuplexSender,
    pub inbox: mpsc::UnboundedReceiver<Value>,
}

/// Creates two connected ports. Whatever one port's sender posts arrives in
/// the other port's inbox, in order.
pub fn duplex() -> (DuplexPort, DuplexPort) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        DuplexPort {
            sender: DuplexSender { tx: b_tx },
            inbox: a_rx,
        },
        DuplexPort {
            sender: DuplexSender { tx: a_tx },
            inbox: b_rx,
        },
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Transport that keeps everything posted to it.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<Value>>>,
    }

    impl RecordingTransport {
        pub fn messages(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn post(&self, message: Value) -> Result<(), BridgeError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplex_delivers_both_ways() {
        let (mut left, mut right) = duplex();

        left.sender.post(json!({"request": "ping"})).await.unwrap();
        right.sender.post(json!({"request": "pong"})).await.unwrap();

        assert_eq!(right.inbox.recv().await, Some(json!({"request": "ping"})));
        assert_eq!(left.inbox.recv().await, Some(json!({"request": "pong"})));
    }

    #[tokio::test]
    async fn test_post_to_dropped_peer_fails() {
        let (left, right) = duplex();
        drop(right);
        assert!(matches!(
            left.sender.post(json!({})).await,
            Err(BridgeError::Transport(_))
        ));
    }

    #[test]
    fn test_script_frame_names() {
        assert_eq!(FrameId::for_script("abc").as_str(), "script-abc");
        assert_eq!(FrameId::from("host").to_string(), "host");
    }
}
