use std::sync::Arc;

use nostr_sdk::Event;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::control::parse_control;
use crate::error::{GateError, NotAdmitted, QueueError};
use crate::gate::ControlGate;
use crate::matcher::match_event;
use crate::models::{Identity, QueueWrapper};
use crate::push::{DispatchReport, PushDispatcher, PushTransport};
use crate::queue::{Envelope, EnvelopeStream};
use crate::stats::SharedPipelineStats;
use crate::store::{FilterRegistry, PushRegistry};

/// Lifecycle of the pipeline. Moves forward exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Replaying stored control events; the queue is not consumed yet
    StartupBackfill,
    LiveConsume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Control(Event),
    Domain(Event),
}

/// What a control event did to the registries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied {
        identity: Identity,
        /// First update ever seen from this identity
        new_identity: bool,
        filters: usize,
        tokens: usize,
        skipped: usize,
    },
    NotAdmitted(NotAdmitted),
    DecryptFailed(String),
}

/// How an envelope was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Body undecodable, handed back to the broker
    Requeued,
    /// Body undecodable on redelivery, dropped without requeue
    DeadLettered,
}

/// Why `run` returned without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Shutdown,
    /// The queue stopped handing out messages
    StreamEnded,
}

/// Control-message ingestion and event fan-out.
///
/// Control events (kind 10395 addressed to this node) replace the author's
/// filters and push tokens. Every other event is matched against all filters
/// and pushed to the tokens of each matching identity. Envelopes are settled
/// one at a time, after dispatch for them has finished.
pub struct IngestionPipeline<T> {
    gate: ControlGate,
    filters: Arc<FilterRegistry>,
    pushes: Arc<PushRegistry>,
    dispatcher: PushDispatcher<T>,
    stats: SharedPipelineStats,
    state: PipelineState,
    dead_letter_redelivered: bool,
}

impl<T: PushTransport> IngestionPipeline<T> {
    pub fn new(
        gate: ControlGate,
        filters: Arc<FilterRegistry>,
        pushes: Arc<PushRegistry>,
        dispatcher: PushDispatcher<T>,
    ) -> Self {
        Self {
            gate,
            filters,
            pushes,
            dispatcher,
            stats: SharedPipelineStats::new(),
            state: PipelineState::StartupBackfill,
            dead_letter_redelivered: false,
        }
    }

    /// Reject undecodable envelopes without requeue once the broker has
    /// already redelivered them.
    pub fn with_dead_letter_redelivered(mut self, enabled: bool) -> Self {
        self.dead_letter_redelivered = enabled;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &SharedPipelineStats {
        &self.stats
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    pub fn pushes(&self) -> &Arc<PushRegistry> {
        &self.pushes
    }

    pub fn gate(&self) -> &ControlGate {
        &self.gate
    }

    pub fn classify(&self, event: Event) -> Classified {
        if self.gate.is_control(&event) {
            Classified::Control(event)
        } else {
            Classified::Domain(event)
        }
    }

    /// Apply stored control events, then go live.
    ///
    /// Returns how many events changed the registries. Non-control events are
    /// skipped; nothing is dispatched during backfill.
    pub fn backfill(&mut self, events: Vec<Event>) -> usize {
        if self.state == PipelineState::LiveConsume {
            warn!("backfill requested after going live, ignoring");
            return 0;
        }

        let total = events.len();
        let mut applied = 0;
        for event in events {
            match self.classify(event) {
                Classified::Control(event) => {
                    if matches!(self.handle_control(&event), ControlOutcome::Applied { .. }) {
                        applied += 1;
                    }
                }
                Classified::Domain(event) => {
                    debug!(id = %event.id, kind = event.kind.as_u16(), "skipping non-control event in backfill");
                }
            }
        }

        self.state = PipelineState::LiveConsume;
        info!(
            total,
            applied,
            identities = self.filters.len(),
            "backfill complete, consuming live events"
        );
        applied
    }

    /// Admit, decrypt and apply one control event.
    pub fn handle_control(&self, event: &Event) -> ControlOutcome {
        let plaintext = match self.gate.admit(event) {
            Ok(plaintext) => plaintext,
            Err(GateError::NotAdmitted(reason)) => {
                debug!(id = %event.id, %reason, "control event not admitted");
                self.stats.update(|s| s.not_admitted += 1);
                return ControlOutcome::NotAdmitted(reason);
            }
            Err(e @ GateError::Decryption { .. }) => {
                warn!(error = %e, "dropping control event");
                self.stats.update(|s| s.decrypt_failures += 1);
                return ControlOutcome::DecryptFailed(e.to_string());
            }
        };

        let update = parse_control(&plaintext);
        let identity = Identity::from(event.pubkey);
        let filter_count = update.filters.len();
        let token_count = update.tokens.len();

        if !update.tokens.is_empty() {
            let tokens: Vec<&str> = update.tokens.iter().map(|t| t.as_str()).collect();
            debug!(identity = %identity, ?tokens, "push tokens received");
        }

        let existed = self.filters.put(identity.clone(), update.filters);
        self.pushes.put(identity.clone(), update.tokens);
        self.stats.update(|s| s.control_updates += 1);

        if existed {
            info!(
                identity = %identity.short(),
                filters = filter_count,
                tokens = token_count,
                "updated identity"
            );
        } else {
            info!(
                identity = %identity.short(),
                filters = filter_count,
                tokens = token_count,
                "new identity"
            );
        }

        ControlOutcome::Applied {
            identity,
            new_identity: !existed,
            filters: filter_count,
            tokens: token_count,
            skipped: update.skipped,
        }
    }

    /// Match one event and push it to every matching identity.
    pub async fn handle_domain(&self, event: &Event) -> DispatchReport {
        self.stats.record_domain(event.kind.as_u16());

        let matched = match_event(event, &self.filters);
        if matched.is_empty() {
            debug!(id = %event.id, kind = event.kind.as_u16(), "no filter matched");
            return DispatchReport::default();
        }

        info!(
            id = %event.id,
            kind = event.kind.as_u16(),
            identities = matched.len(),
            "event matched"
        );
        let report = self
            .dispatcher
            .dispatch(&matched.identities, &self.pushes, event)
            .await;

        self.stats.update(|s| {
            s.matched_events += 1;
            s.record_dispatch(&report);
        });
        report
    }

    /// Decode, route and settle one envelope.
    ///
    /// Only a failure to settle is returned as an error; everything else is
    /// logged and the envelope is acknowledged.
    pub async fn process_envelope<E: Envelope>(
        &self,
        envelope: &E,
    ) -> Result<Disposition, QueueError> {
        self.stats.update(|s| s.envelopes += 1);

        let wrapper = match QueueWrapper::decode(envelope.body()) {
            Ok(wrapper) => wrapper,
            Err(e) => return self.reject_undecodable(envelope, e.to_string()).await,
        };

        debug!(
            id = %wrapper.event.id,
            kind = wrapper.event.kind.as_u16(),
            source = %wrapper.source_info,
            "processing event"
        );

        match self.classify(wrapper.event) {
            Classified::Control(event) => {
                self.handle_control(&event);
            }
            Classified::Domain(event) => {
                self.handle_domain(&event).await;
            }
        }

        envelope.ack().await.map_err(|e| {
            error!(error = %e, "failed to acknowledge envelope");
            e
        })?;
        Ok(Disposition::Acked)
    }

    async fn reject_undecodable<E: Envelope>(
        &self,
        envelope: &E,
        reason: String,
    ) -> Result<Disposition, QueueError> {
        let dead_letter = self.dead_letter_redelivered && envelope.redelivered();
        warn!(
            tag = envelope.delivery_tag(),
            redelivered = envelope.redelivered(),
            requeue = !dead_letter,
            %reason,
            "rejecting undecodable envelope"
        );

        envelope.reject(!dead_letter).await.map_err(|e| {
            error!(error = %e, "failed to reject envelope");
            e
        })?;

        self.stats.update(|s| {
            s.decode_rejects += 1;
            if dead_letter {
                s.dead_lettered += 1;
            }
        });
        Ok(if dead_letter {
            Disposition::DeadLettered
        } else {
            Disposition::Requeued
        })
    }

    /// Consume `stream` until it ends, fails or `shutdown` flips to true.
    ///
    /// Goes live with empty state if backfill never ran. An envelope already
    /// taken is always settled before shutdown is honoured.
    pub async fn run<S: EnvelopeStream>(
        &mut self,
        stream: &mut S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunEnd, QueueError> {
        if self.state == PipelineState::StartupBackfill {
            self.backfill(Vec::new());
        }

        loop {
            if *shutdown.borrow() {
                return Ok(RunEnd::Shutdown);
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(RunEnd::Shutdown);
                    }
                    continue;
                }
                next = stream.next_envelope() => next,
            };

            match next {
                Some(Ok(envelope)) => {
                    self.process_envelope(&envelope).await?;
                }
                Some(Err(e)) => {
                    error!(error = %e, "queue delivery failed");
                    return Err(e);
                }
                None => {
                    info!("queue stream ended");
                    return Ok(RunEnd::StreamEnded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::KIND_APP_DATA;
    use crate::error::DispatchError;
    use crate::models::PushToken;
    use crate::push::{DeliveryOutcome, PushMessage};
    use crate::queue::{MemoryQueue, Settlement};
    use async_trait::async_trait;
    use nostr_sdk::nips::nip04;
    use nostr_sdk::{EventBuilder, Filter, Keys, Kind, Tag};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<PushToken>>,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn send_batch(
            &self,
            messages: &[PushMessage],
        ) -> Result<Vec<DeliveryOutcome>, DispatchError> {
            self.sent.lock().extend(messages.iter().map(|m| m.to.clone()));
            Ok(messages
                .iter()
                .map(|_| DeliveryOutcome::Accepted { ticket: None })
                .collect())
        }
    }

    struct Fixture {
        node: Keys,
        transport: Arc<RecordingTransport>,
        pipeline: IngestionPipeline<Arc<RecordingTransport>>,
    }

    fn fixture() -> Fixture {
        let node = Keys::generate();
        let transport = Arc::new(RecordingTransport::default());
        let pipeline = IngestionPipeline::new(
            ControlGate::new(node.clone()),
            Arc::new(FilterRegistry::new()),
            Arc::new(PushRegistry::new()),
            PushDispatcher::new(Arc::clone(&transport)),
        );
        Fixture {
            node,
            transport,
            pipeline,
        }
    }

    fn control(sender: &Keys, node: &Keys, payload: &str) -> Event {
        let content = nip04::encrypt(sender.secret_key(), &node.public_key(), payload).unwrap();
        EventBuilder::new(Kind::from(KIND_APP_DATA), content)
            .tag(Tag::public_key(node.public_key()))
            .sign_with_keys(sender)
            .unwrap()
    }

    fn note(kind: u16) -> Event {
        EventBuilder::new(Kind::from(kind), "hello")
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    fn wrap(event: Event) -> QueueWrapper {
        QueueWrapper {
            event,
            event_type: "new".to_string(),
            received_at: 0,
            source_info: "test".to_string(),
        }
    }

    #[test]
    fn test_backfill_goes_live_once() {
        let mut f = fixture();
        let client = Keys::generate();
        let events = vec![
            control(&client, &f.node, r#"{"filters":[{"kinds":[1]}]}"#),
            note(1),
        ];

        assert_eq!(f.pipeline.state(), PipelineState::StartupBackfill);
        assert_eq!(f.pipeline.backfill(events), 1);
        assert_eq!(f.pipeline.state(), PipelineState::LiveConsume);
        assert!(f.transport.sent.lock().is_empty());

        let late = vec![control(&Keys::generate(), &f.node, r#"{"filters":[]}"#)];
        assert_eq!(f.pipeline.backfill(late), 0);
        assert_eq!(f.pipeline.filters().len(), 1);
    }

    #[test]
    fn test_control_outcomes() {
        let f = fixture();
        let client = Keys::generate();
        let event = control(
            &client,
            &f.node,
            r#"{"filters":[{"kinds":[1]}],"tokens":["tokA"]}"#,
        );

        match f.pipeline.handle_control(&event) {
            ControlOutcome::Applied {
                new_identity,
                filters,
                tokens,
                ..
            } => {
                assert!(new_identity);
                assert_eq!((filters, tokens), (1, 1));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(
            f.pipeline.handle_control(&event),
            ControlOutcome::Applied {
                new_identity: false,
                ..
            }
        ));

        let garbled = EventBuilder::new(Kind::from(KIND_APP_DATA), "%%%not-base64%%%?iv=%%%")
            .tag(Tag::public_key(f.node.public_key()))
            .sign_with_keys(&client)
            .unwrap();
        assert!(matches!(
            f.pipeline.handle_control(&garbled),
            ControlOutcome::DecryptFailed(_)
        ));

        let stats = f.pipeline.stats().snapshot();
        assert_eq!(stats.control_updates, 2);
        assert_eq!(stats.decrypt_failures, 1);
    }

    #[tokio::test]
    async fn test_undecodable_envelope_requeued() {
        let f = fixture();
        let mut queue = MemoryQueue::new();
        let tag = queue.push("{not json");

        let envelope = queue.next_envelope().await.unwrap().unwrap();
        let disposition = f.pipeline.process_envelope(&envelope).await.unwrap();

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(
            queue.settlement_of(tag),
            Some(Settlement::Rejected { requeue: true })
        );
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_undecodable_dead_lettered_when_enabled() {
        let f = fixture();
        let pipeline = f.pipeline.with_dead_letter_redelivered(true);
        let mut queue = MemoryQueue::new();
        queue.push("{not json");

        let first = queue.next_envelope().await.unwrap().unwrap();
        assert_eq!(
            pipeline.process_envelope(&first).await.unwrap(),
            Disposition::Requeued
        );

        let second = queue.next_envelope().await.unwrap().unwrap();
        assert_eq!(
            pipeline.process_envelope(&second).await.unwrap(),
            Disposition::DeadLettered
        );
        assert_eq!(queue.pending(), 0);
        assert_eq!(pipeline.stats().snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_domain_event_dispatched_and_acked() {
        let f = fixture();
        f.pipeline
            .filters()
            .put(Identity::from("pk1"), vec![Filter::new().kind(Kind::TextNote)]);
        f.pipeline
            .pushes()
            .put(Identity::from("pk1"), vec![PushToken::from("tokA")]);

        let mut queue = MemoryQueue::new();
        let tag = queue.push_wrapper(&wrap(note(1))).unwrap();
        let envelope = queue.next_envelope().await.unwrap().unwrap();

        let disposition = f.pipeline.process_envelope(&envelope).await.unwrap();
        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(queue.settlement_of(tag), Some(Settlement::Acked));
        assert_eq!(*f.transport.sent.lock(), vec![PushToken::from("tokA")]);
    }

    #[tokio::test]
    async fn test_settle_failure_is_returned() {
        let f = fixture();
        let mut queue = MemoryQueue::new();
        queue.push_wrapper(&wrap(note(1))).unwrap();
        let envelope = queue.next_envelope().await.unwrap().unwrap();
        envelope.ack().await.unwrap();

        assert!(f.pipeline.process_envelope(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_run_until_drained_then_shutdown() {
        let mut f = fixture();
        let mut queue = MemoryQueue::new();
        queue.push_wrapper(&wrap(note(1))).unwrap();
        queue.push_wrapper(&wrap(note(2))).unwrap();

        let (tx, mut rx) = watch::channel(false);
        let end = f.pipeline.run(&mut queue, &mut rx).await.unwrap();
        assert_eq!(end, RunEnd::StreamEnded);
        assert_eq!(f.pipeline.state(), PipelineState::LiveConsume);
        assert_eq!(f.pipeline.stats().snapshot().envelopes, 2);

        queue.push_wrapper(&wrap(note(3))).unwrap();
        tx.send(true).unwrap();
        let end = f.pipeline.run(&mut queue, &mut rx).await.unwrap();
        assert_eq!(end, RunEnd::Shutdown);
        assert_eq!(queue.pending(), 1);
    }
}
