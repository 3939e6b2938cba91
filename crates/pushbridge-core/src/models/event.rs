use std::fmt;

use nostr_sdk::{Event, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeDecodeError;

/// Hex public key identifying an event author and owning filters/push tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<PublicKey> for Identity {
    fn from(value: PublicKey) -> Self {
        Self(value.to_hex())
    }
}

/// Opaque push destination (an Expo push token on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PushToken(String);

impl PushToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PushToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PushToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Record the relay plugin publishes for every accepted event.
///
/// The event is decoded but its signature is not checked; the relay in front
/// of the queue already did.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueWrapper {
    pub event: Event,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub received_at: i64,
    #[serde(default)]
    pub source_info: String,
}

impl QueueWrapper {
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeDecodeError> {
        Ok(serde_json::from_slice(body)?)
    }
}
