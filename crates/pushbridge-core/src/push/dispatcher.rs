use std::time::Duration;

use futures::stream::{self, StreamExt};
use nostr_sdk::Event;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{DeliveryOutcome, PushMessage, PushTransport};
use crate::constants::{DEFAULT_DISPATCH_CONCURRENCY, DEFAULT_DISPATCH_TIMEOUT};
use crate::models::{Identity, PushToken};
use crate::store::PushRegistry;

/// Outcome for one (identity, token) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub identity: Identity,
    pub token: PushToken,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub deliveries: Vec<Delivery>,
    /// Matched identities without any registered token
    pub no_destination: Vec<Identity>,
}

impl DispatchReport {
    pub fn accepted(&self) -> usize {
        self.count(|o| o.is_accepted())
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Rejected(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Failed(_)))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::TimedOut))
    }

    fn count(&self, pred: impl Fn(&DeliveryOutcome) -> bool) -> usize {
        self.deliveries.iter().filter(|d| pred(&d.outcome)).count()
    }
}

/// Fans matched events out to every registered token of every matched identity.
///
/// Requests run concurrently up to `concurrency`; the whole fan-out for one
/// event shares a single deadline. There are no retries.
pub struct PushDispatcher<T> {
    transport: T,
    timeout: Duration,
    concurrency: usize,
}

impl<T: PushTransport> PushDispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
            concurrency: DEFAULT_DISPATCH_CONCURRENCY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn dispatch(
        &self,
        matched: &[Identity],
        registry: &PushRegistry,
        event: &Event,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut owners = Vec::new();
        let mut messages = Vec::new();

        for identity in matched {
            let tokens = registry.get(identity);
            if tokens.is_empty() {
                info!(identity = %identity.short(), "no push token registered for identity");
                report.no_destination.push(identity.clone());
                continue;
            }

            debug!(identity = %identity.short(), count = tokens.len(), "sending push");
            for token in tokens.iter() {
                if let Err(reason) = self.transport.validate_token(token) {
                    warn!(%token, %reason, "push token is not valid for this transport");
                    report.deliveries.push(Delivery {
                        identity: identity.clone(),
                        token: token.clone(),
                        outcome: DeliveryOutcome::Rejected(reason),
                    });
                    continue;
                }
                owners.push(identity.clone());
                messages.push(PushMessage::for_event(token.clone(), event));
            }
        }

        if messages.is_empty() {
            return report;
        }

        let outcomes = self.send_all(&messages).await;
        for ((identity, message), outcome) in owners.into_iter().zip(messages).zip(outcomes) {
            match &outcome {
                DeliveryOutcome::Accepted { .. } => debug!(token = %message.to, "push accepted"),
                DeliveryOutcome::Rejected(reason) => {
                    warn!(token = %message.to, %reason, "push rejected")
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(token = %message.to, %reason, "push failed")
                }
                DeliveryOutcome::TimedOut => warn!(token = %message.to, "push timed out"),
            }
            report.deliveries.push(Delivery {
                identity,
                token: message.to,
                outcome,
            });
        }

        report
    }

    /// Send in transport-sized chunks under one deadline; unfinished chunks
    /// come back as `TimedOut`.
    async fn send_all(&self, messages: &[PushMessage]) -> Vec<DeliveryOutcome> {
        let chunk_size = self.transport.max_batch().max(1);
        let mut outcomes: Vec<Option<DeliveryOutcome>> = vec![None; messages.len()];
        let deadline = Instant::now() + self.timeout;

        let mut in_flight = stream::iter(messages.chunks(chunk_size).enumerate())
            .map(move |(index, chunk)| async move {
                (index * chunk_size, chunk.len(), self.transport.send_batch(chunk).await)
            })
            .buffer_unordered(self.concurrency);

        loop {
            match timeout_at(deadline, in_flight.next()).await {
                Ok(Some((offset, len, result))) => {
                    let slots = &mut outcomes[offset..offset + len];
                    match result {
                        Ok(tickets) => {
                            if tickets.len() != len {
                                warn!(
                                    expected = len,
                                    received = tickets.len(),
                                    "push service returned a mismatched ticket count"
                                );
                            }
                            let mut tickets = tickets.into_iter();
                            for slot in slots.iter_mut() {
                                *slot = Some(tickets.next().unwrap_or_else(|| {
                                    DeliveryOutcome::Failed("no ticket returned".to_string())
                                }));
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, count = len, "push batch failed");
                            for slot in slots.iter_mut() {
                                *slot = Some(DeliveryOutcome::Failed(e.to_string()));
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(timeout = ?self.timeout, "push dispatch deadline reached");
                    break;
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(DeliveryOutcome::TimedOut))
            .collect()
    }
}
