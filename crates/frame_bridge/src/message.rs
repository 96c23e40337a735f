//! # Wire Messages
//!
//! Every message crossing a frame boundary is a JSON object with a `request`
//! tag. Correlated requests additionally carry a `uid`; their reply reuses the
//! uid and appends [`CALLBACK_SUFFIX`] to the tag:
//!
//! ```json
//! { "request": "iframe_get_variables", "uid": 1834029384023, "option": { "type": "chat" } }
//! { "request": "iframe_get_variables_callback", "uid": 1834029384023, "result": { "hp": 10 } }
//! ```
//!
//! Channel messages (`iframe_notify_all`, `iframe_wait`) never carry a uid and
//! are handled by a separate layer on the same transport.

use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix appended to a request tag to form its reply tag.
pub const CALLBACK_SUFFIX: &str = "_callback";

/// Tag of the fire-and-forget publish message.
pub const NOTIFY_ALL_TAG: &str = "iframe_notify_all";
/// Tag of the message registering a channel waiter.
pub const WAIT_TAG: &str = "iframe_wait";
/// Tag of the message delivering published data to a waiter.
pub const NOTIFY_CALLBACK_TAG: &str = "iframe_notify_callback";

/// Tag of the message delivering a host event to a frame-side listener.
pub const EVENT_CALLBACK_TAG: &str = "iframe_event_callback";

/// Returns the reply tag for a request tag.
pub fn callback_name(request: &str) -> String {
    let mut name = String::with_capacity(request.len() + CALLBACK_SUFFIX.len());
    name.push_str(request);
    name.push_str(CALLBACK_SUFFIX);
    name
}

/// Correlation token pairing one request with its one reply.
///
/// Serialized as a plain JSON number. Generated values stay below 2^53 so a
/// JavaScript peer can round-trip them without precision loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produces process-unique correlation ids.
///
/// The counter is seeded from the wall clock (milliseconds, shifted left by
/// ten bits) plus a random offset, then strictly incremented. Repeated calls
/// inside the same millisecond therefore never collide, and two generators
/// started at the same instant are unlikely to overlap.
#[derive(Debug)]
pub struct UidGenerator {
    next: AtomicU64,
}

impl UidGenerator {
    pub fn new() -> Self {
        let millis = crate::utils::current_timestamp_millis();
        let jitter: u64 = rand::thread_rng().gen_range(0..1024);
        Self {
            next: AtomicU64::new((millis << 10) + jitter),
        }
    }

    /// Starts the sequence at a fixed value. Useful for reproducing collisions.
    pub fn starting_at(value: u64) -> Self {
        Self {
            next: AtomicU64::new(value),
        }
    }

    pub fn next_uid(&self) -> Uid {
        Uid(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A correlated request: tag, uid, and the operation-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub request: String,
    pub uid: Uid,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RequestMessage {
    pub fn new(request: impl Into<String>, uid: Uid, payload: Map<String, Value>) -> Self {
        Self {
            request: request.into(),
            uid,
            payload,
        }
    }

    /// Parses an inbound message, returning `None` for anything that is not
    /// a correlated request (missing tag, missing uid, not an object).
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let request = object.get("request")?.as_str()?;
        let uid = object.get("uid")?.as_u64().or_else(|| {
            // Peers that build uids from floating point clocks send fractional
            // values; the integral part is what they compare against.
            object
                .get("uid")?
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })?;

        let payload = object
            .iter()
            .filter(|(key, _)| key.as_str() != "request" && key.as_str() != "uid")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            request: request.to_string(),
            uid: Uid(uid),
            payload,
        })
    }

    pub fn callback_name(&self) -> String {
        callback_name(&self.request)
    }

    /// Decodes the payload fields into a typed command.
    pub fn decode<C: DeserializeOwned>(&self) -> Result<C, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

/// The single reply produced for every recognized request.
///
/// `result` is omitted from the wire form when the handler produced nothing or
/// failed; peers read that as `undefined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub request: String,
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ReplyMessage {
    pub fn to_request(request: &RequestMessage, result: Option<Value>) -> Self {
        Self {
            request: request.callback_name(),
            uid: request.uid,
            result,
        }
    }
}

/// Messages owned by the notification channel layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request")]
pub enum ChannelMessage {
    #[serde(rename = "iframe_notify_all")]
    NotifyAll {
        channel: String,
        #[serde(default)]
        data: Vec<Value>,
    },
    #[serde(rename = "iframe_wait")]
    Wait { channel: String },
    #[serde(rename = "iframe_notify_callback")]
    NotifyCallback { channel: String, data: Vec<Value> },
}

impl ChannelMessage {
    /// Parses a channel-layer message; anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let tag = value.get("request")?.as_str()?;
        if tag != NOTIFY_ALL_TAG && tag != WAIT_TAG && tag != NOTIFY_CALLBACK_TAG {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// One host event emission forwarded to the frame listener that subscribed
/// to it. `args` are the emitted arguments; a non-array payload arrives as a
/// single argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCallback {
    pub event_type: String,
    pub listener_uid: u64,
    #[serde(default)]
    pub listener_string: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventCallback {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "request": EVENT_CALLBACK_TAG,
            "event_type": self.event_type,
            "listener_uid": self.listener_uid,
            "listener_string": self.listener_string,
            "args": self.args,
        })
    }

    /// Parses an `iframe_event_callback` message; anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("request")?.as_str()? != EVENT_CALLBACK_TAG {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// A typed request: the payload type, its wire tag, and what it returns.
///
/// Implementing this once gives both sides of the protocol: the host registers
/// a handler with [`crate::HostBridge::register_command`] and a frame calls it
/// with [`crate::FrameClient::call`].
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire tag of the request.
    const TAG: &'static str;
    /// Result carried in the reply.
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uids_unique_under_rapid_generation() {
        let generator = UidGenerator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generator.next_uid()));
        }
    }

    #[test]
    fn test_uid_fits_javascript_number() {
        let uid = UidGenerator::new().next_uid();
        assert!(uid.0 < (1u64 << 53));
    }

    #[test]
    fn test_request_parsing_strips_envelope_fields() {
        let value = json!({"request": "getX", "uid": 42, "option": {"type": "chat"}});
        let request = RequestMessage::from_value(&value).unwrap();

        assert_eq!(request.request, "getX");
        assert_eq!(request.uid, Uid(42));
        assert_eq!(request.payload.len(), 1);
        assert_eq!(request.payload["option"], json!({"type": "chat"}));
        assert_eq!(request.callback_name(), "getX_callback");
    }

    #[test]
    fn test_malformed_requests_rejected() {
        assert!(RequestMessage::from_value(&json!(null)).is_none());
        assert!(RequestMessage::from_value(&json!("getX")).is_none());
        assert!(RequestMessage::from_value(&json!({"uid": 1})).is_none());
        assert!(RequestMessage::from_value(&json!({"request": "getX"})).is_none());
        assert!(RequestMessage::from_value(&json!({"request": 5, "uid": 1})).is_none());
    }

    #[test]
    fn test_fractional_uid_accepted() {
        let value = json!({"request": "getX", "uid": 1700000000123.75});
        let request = RequestMessage::from_value(&value).unwrap();
        assert_eq!(request.uid, Uid(1700000000123));
    }

    #[test]
    fn test_undefined_result_omitted_on_wire() {
        let reply = ReplyMessage {
            request: "doThing_callback".to_string(),
            uid: Uid(7),
            result: None,
        };
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire, json!({"request": "doThing_callback", "uid": 7}));
    }

    #[test]
    fn test_channel_messages_parse() {
        let notify = json!({"request": "iframe_notify_all", "channel": "ready", "data": ["go"]});
        assert_eq!(
            ChannelMessage::from_value(&notify),
            Some(ChannelMessage::NotifyAll {
                channel: "ready".to_string(),
                data: vec![json!("go")],
            })
        );

        let wait = json!({"request": "iframe_wait", "channel": "ready"});
        assert_eq!(
            ChannelMessage::from_value(&wait),
            Some(ChannelMessage::Wait { channel: "ready".to_string() })
        );

        let rpc = json!({"request": "iframe_get_variables", "uid": 3});
        assert!(ChannelMessage::from_value(&rpc).is_none());
    }

    #[test]
    fn test_event_callback_wire_form() {
        let callback = EventCallback {
            event_type: "chat_changed".to_string(),
            listener_uid: 9,
            listener_string: "() => {}".to_string(),
            args: vec![json!({"chat_id": "b"})],
        };
        let wire = callback.to_value();
        assert_eq!(wire["request"], json!("iframe_event_callback"));
        assert_eq!(EventCallback::from_value(&wire), Some(callback));

        let notify = json!({"request": "iframe_notify_callback", "channel": "ready", "data": []});
        assert!(EventCallback::from_value(&notify).is_none());
    }
}
