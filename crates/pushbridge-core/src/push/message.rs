use std::collections::BTreeMap;

use nostr_sdk::Event;
use serde::Serialize;

use crate::constants::{NOTIFICATION_BODY_MAX_CHARS, UNKNOWN_PLUS_CODE};
use crate::models::tag_utils::plus_code;
use crate::models::PushToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Default,
}

/// One notification for one device, in Expo's request shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub to: PushToken,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    pub priority: Priority,
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    /// Notification announcing `event` to the device behind `to`
    pub fn for_event(to: PushToken, event: &Event) -> Self {
        let code = plus_code(event).unwrap_or(UNKNOWN_PLUS_CODE);
        let tags: Vec<&[String]> = event.tags.iter().map(|tag| tag.as_slice()).collect();

        let mut data = BTreeMap::new();
        data.insert("id".to_string(), event.id.to_hex());
        data.insert("kind".to_string(), event.kind.as_u16().to_string());
        data.insert("pubkey".to_string(), event.pubkey.to_hex());
        data.insert("content".to_string(), event.content.clone());
        data.insert("createdAt".to_string(), event.created_at.as_u64().to_string());
        data.insert(
            "tags".to_string(),
            serde_json::to_string(&tags).unwrap_or_default(),
        );

        Self {
            to,
            title: format!("New note in plus code {}", code),
            body: truncate_chars(&event.content, NOTIFICATION_BODY_MAX_CHARS),
            sound: Some("default".to_string()),
            priority: Priority::Default,
            data,
        }
    }
}

/// Cut `s` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_index, _)) => format!("{}…", &s[..byte_index]),
        None => s.to_string(),
    }
}
