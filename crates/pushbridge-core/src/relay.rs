use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::{Client, Event, Keys, Kind};
use tracing::{debug, info};

use crate::constants::{DEFAULT_BACKFILL_TIMEOUT, KIND_APP_DATA};
use crate::error::RelayError;

/// Source of stored control events replayed at startup
#[async_trait]
pub trait RelayBackfill: Send + Sync {
    /// Stored control events, oldest first.
    async fn fetch_control_events(&self) -> Result<Vec<Event>, RelayError>;
}

/// Reads stored control events from a single relay until EOSE or timeout.
pub struct NostrBackfill {
    keys: Keys,
    relay_url: String,
    control_kind: u16,
    timeout: Duration,
}

impl NostrBackfill {
    pub fn new(keys: Keys, relay_url: impl Into<String>) -> Self {
        Self {
            keys,
            relay_url: relay_url.into(),
            control_kind: KIND_APP_DATA,
            timeout: DEFAULT_BACKFILL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_control_kind(mut self, kind: u16) -> Self {
        self.control_kind = kind;
        self
    }
}

#[async_trait]
impl RelayBackfill for NostrBackfill {
    async fn fetch_control_events(&self) -> Result<Vec<Event>, RelayError> {
        let client = Client::new(self.keys.clone());
        client
            .add_relay(&self.relay_url)
            .await
            .map_err(|e| RelayError::Connect {
                url: self.relay_url.clone(),
                reason: e.to_string(),
            })?;

        info!(relay = %self.relay_url, "reading stored control events");
        if tokio::time::timeout(self.timeout, client.connect()).await.is_err() {
            client.disconnect().await;
            return Err(RelayError::Connect {
                url: self.relay_url.clone(),
                reason: format!("connect timed out after {:?}", self.timeout),
            });
        }

        let filter = nostr_sdk::Filter::new().kind(Kind::Custom(self.control_kind));
        let fetched = client.fetch_events(filter, self.timeout).await;
        client.disconnect().await;
        let fetched = fetched.map_err(|e| RelayError::Fetch(e.to_string()))?;

        let mut events: Vec<Event> = fetched.into_iter().collect();
        for event in &events {
            debug!(id = %event.id.to_hex(), "got stored event");
        }
        sort_oldest_first(&mut events);

        info!(count = events.len(), "finished reading stored events");
        Ok(events)
    }
}

/// Replay order for backfilled events; ties keep relay order.
pub fn sort_oldest_first(events: &mut [Event]) {
    events.sort_by_key(|e| e.created_at);
}
