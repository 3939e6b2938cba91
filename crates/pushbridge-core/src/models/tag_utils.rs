//! Tag extraction utilities for nostr events
//!
//! Tags are `["name", "value", ...extra]`; entries without a value are skipped.

use nostr_sdk::Event;

/// Extract a single string value from a tag by name.
/// Returns the first occurrence that carries a value.
pub fn extract_tag_str<'a>(event: &'a Event, tag_name: &str) -> Option<&'a str> {
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|tag| tag.len() > 1 && tag[0] == tag_name)
        .map(|tag| tag[1].as_str())
}

/// Open Location Code from an `l` (or `#l`) label tag.
pub fn plus_code(event: &Event) -> Option<&str> {
    extract_tag_str(event, "l").or_else(|| extract_tag_str(event, "#l"))
}
