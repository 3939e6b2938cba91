use nostr_sdk::filter::MatchEventOptions;
use nostr_sdk::{Event, JsonUtil};
use tracing::debug;

use crate::models::Identity;
use crate::store::FilterRegistry;

/// Identities with at least one filter matching an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    /// In first-match order, without duplicates
    pub identities: Vec<Identity>,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }
}

/// Evaluate `event` against every registered filter with NIP-01 semantics.
///
/// NIP-50 `search` is left to relays and ignored here. The registry is read
/// once; updates landing mid-evaluation are not observed.
pub fn match_event(event: &Event, registry: &FilterRegistry) -> MatchResult {
    let mut result = MatchResult::default();

    for (identity, filters) in registry.snapshot() {
        let first_match = filters
            .iter()
            .find(|filter| filter.match_event(event, MatchEventOptions::new()));
        if let Some(filter) = first_match {
            debug!(
                kind = event.kind.as_u16(),
                filter = %filter.as_json(),
                owner = %identity.short(),
                "filter matched"
            );
            result.identities.push(identity);
        }
    }

    result
}
