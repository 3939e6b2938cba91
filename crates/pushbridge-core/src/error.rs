use std::fmt;

use crate::models::Identity;

/// Why a control event was not taken through decryption.
///
/// This is a routing outcome, not a fault: the event is acknowledged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotAdmitted {
    NotControlKind(u16),
    /// No `p` tag carrying a value
    NoRecipient,
    /// First `p` tag names somebody else
    WrongRecipient(String),
    /// Content lacks the NIP-04 `?iv=` marker
    NotEncrypted,
}

impl fmt::Display for NotAdmitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotAdmitted::NotControlKind(kind) => write!(f, "kind {} is not a control kind", kind),
            NotAdmitted::NoRecipient => write!(f, "no p tag"),
            NotAdmitted::WrongRecipient(actual) => {
                write!(f, "first p tag is not for me (was: {})", actual)
            }
            NotAdmitted::NotEncrypted => write!(f, "no iv marker"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("control event not admitted: {0}")]
    NotAdmitted(NotAdmitted),

    #[error("decryption failed for event {event_id} from {author}: {reason}")]
    Decryption {
        event_id: String,
        author: Identity,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlParseError {
    #[error("control payload is not a JSON record: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("filter entry {index} is invalid: {source}")]
    FilterEntry {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("token entry {index} is invalid: {reason}")]
    TokenEntry { index: usize, reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("push transport request failed: {0}")]
    Transport(String),

    #[error("push service error ({status}): {body}")]
    Service { status: u16, body: String },

    #[error("unexpected push service response: {0}")]
    Response(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to decode queue envelope: {0}")]
pub struct EnvelopeDecodeError(#[from] pub serde_json::Error);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("consumer stream closed")]
    StreamClosed,

    #[error("failed to settle delivery {tag}: {reason}")]
    Settle { tag: u64, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to relay {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to fetch stored events: {0}")]
    Fetch(String),
}
