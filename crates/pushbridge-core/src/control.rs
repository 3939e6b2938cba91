//! Decoding of decrypted control payloads
//!
//! Payload shape: `{"filters": [...], "tokens": [...]}`. Filter entries are
//! NIP-01 filter objects, either bare (`{"kinds": [1]}`) or wrapped as
//! `{"filter": {...}}`. Token entries are strings, either bare (`"tok"`) or
//! wrapped as `{"expoPushToken": "tok"}`.
//!
//! Both keys are optional and every entry is decoded on its own, so one bad
//! entry never costs the rest of the message.

use nostr_sdk::{Filter, JsonUtil};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ControlParseError;
use crate::models::PushToken;

/// Key of the wrapped filter entry form
const FILTER_ENTRY_KEY: &str = "filter";

#[derive(Debug, Default, Deserialize)]
struct RawControlPayload {
    #[serde(default)]
    filters: Option<Vec<Value>>,
    #[serde(default)]
    tokens: Option<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenEntry {
    Bare(String),
    Wrapped {
        #[serde(rename = "expoPushToken")]
        expo_push_token: String,
    },
}

impl TokenEntry {
    fn into_inner(self) -> String {
        match self {
            TokenEntry::Bare(token) => token,
            TokenEntry::Wrapped { expo_push_token } => expo_push_token,
        }
    }
}

/// Result of parsing one control payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlUpdate {
    pub filters: Vec<Filter>,
    pub tokens: Vec<PushToken>,
    /// Entries dropped because they failed to decode
    pub skipped: usize,
}

pub fn parse_control(content: &str) -> ControlUpdate {
    let payload = match decode_payload(content) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "control payload unreadable, treating as empty");
            return ControlUpdate::default();
        }
    };

    let (filters, bad_filters) = decode_filters(payload.filters.unwrap_or_default());
    let (tokens, bad_tokens) = decode_tokens(payload.tokens.unwrap_or_default());

    ControlUpdate {
        filters,
        tokens,
        skipped: bad_filters + bad_tokens,
    }
}

pub fn parse_filters(content: &str) -> Vec<Filter> {
    decode_payload(content)
        .map(|payload| decode_filters(payload.filters.unwrap_or_default()).0)
        .unwrap_or_default()
}

pub fn parse_push_tokens(content: &str) -> Vec<PushToken> {
    decode_payload(content)
        .map(|payload| decode_tokens(payload.tokens.unwrap_or_default()).0)
        .unwrap_or_default()
}

fn decode_payload(content: &str) -> Result<RawControlPayload, ControlParseError> {
    serde_json::from_str(content).map_err(ControlParseError::Payload)
}

/// Inner filter of a `{"filter": ...}` entry, or the entry itself.
fn unwrap_filter_entry(entry: Value) -> Value {
    match entry {
        Value::Object(mut fields) => match fields.remove(FILTER_ENTRY_KEY) {
            Some(inner) => inner,
            None => Value::Object(fields),
        },
        other => other,
    }
}

fn decode_filters(entries: Vec<Value>) -> (Vec<Filter>, usize) {
    let mut filters = Vec::with_capacity(entries.len());
    let mut skipped = 0;

    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<Filter>(unwrap_filter_entry(entry)) {
            Ok(filter) => {
                debug!(index, filter = %filter.as_json(), "parsed filter");
                filters.push(filter);
            }
            Err(source) => {
                let err = ControlParseError::FilterEntry { index, source };
                warn!(error = %err, "skipping filter entry");
                skipped += 1;
            }
        }
    }

    (filters, skipped)
}

fn decode_tokens(entries: Vec<Value>) -> (Vec<PushToken>, usize) {
    let mut tokens = Vec::with_capacity(entries.len());
    let mut skipped = 0;

    for (index, entry) in entries.into_iter().enumerate() {
        let reason = match serde_json::from_value::<TokenEntry>(entry) {
            Ok(entry) => {
                let token = entry.into_inner();
                if !token.trim().is_empty() {
                    tokens.push(PushToken::new(token));
                    continue;
                }
                "empty token".to_string()
            }
            Err(_) => "expected a string or {\"expoPushToken\": string}".to_string(),
        };

        let err = ControlParseError::TokenEntry { index, reason };
        warn!(error = %err, "skipping token entry");
        skipped += 1;
    }

    (tokens, skipped)
}
