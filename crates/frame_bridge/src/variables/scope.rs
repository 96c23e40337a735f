//! Scope names and the option object frames send with variable requests.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One of the four variable stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    Global,
    Character,
    #[default]
    Chat,
    Message,
}

impl VariableScope {
    pub const ALL: [VariableScope; 4] = [
        VariableScope::Global,
        VariableScope::Character,
        VariableScope::Chat,
        VariableScope::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableScope::Global => "global",
            VariableScope::Character => "character",
            VariableScope::Chat => "chat",
            VariableScope::Message => "message",
        }
    }
}

impl fmt::Display for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VariableScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VariableScope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| format!("Unknown variable scope '{}'", s))
    }
}

/// Which floor a `message` scope request addresses.
///
/// On the wire this is either a number (a floor index, or a negative offset
/// from the end where `-1` is the newest floor) or the string `"latest"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageId {
    #[default]
    Latest,
    Index(i64),
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageId::Latest => serializer.serialize_str("latest"),
            MessageId::Index(index) => serializer.serialize_i64(*index),
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Index(index) => Ok(MessageId::Index(index)),
            Raw::Name(name) if name == "latest" => Ok(MessageId::Latest),
            Raw::Name(name) => Err(serde::de::Error::custom(format!(
                "message_id must be a number or \"latest\", got \"{}\"",
                name
            ))),
        }
    }
}

/// Which variables a request reads or replaces. Every field is optional on
/// the wire; the default is the chat scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariableOption {
    #[serde(rename = "type", default)]
    pub scope: VariableScope,
    /// Only meaningful for the `message` scope
    #[serde(default)]
    pub message_id: MessageId,
}

impl VariableOption {
    pub fn scope(scope: VariableScope) -> Self {
        Self {
            scope,
            message_id: MessageId::Latest,
        }
    }

    pub fn message(message_id: MessageId) -> Self {
        Self {
            scope: VariableScope::Message,
            message_id,
        }
    }
}
