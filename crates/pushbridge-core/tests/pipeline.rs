use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::nips::nip04;
use nostr_sdk::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};
use parking_lot::Mutex;

use pushbridge_core::constants::KIND_APP_DATA;
use pushbridge_core::push::Delivery;
use pushbridge_core::queue::Settlement;
use pushbridge_core::{
    ControlGate, ControlOutcome, DeliveryOutcome, DispatchError, Disposition, Envelope,
    EnvelopeStream, FilterRegistry, Identity, IngestionPipeline, MemoryQueue, PushDispatcher,
    PushMessage, PushRegistry, PushToken, PushTransport, QueueWrapper,
};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<PushMessage>>,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send_batch(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<DeliveryOutcome>, DispatchError> {
        self.sent.lock().extend_from_slice(messages);
        Ok(messages
            .iter()
            .map(|_| DeliveryOutcome::Accepted { ticket: None })
            .collect())
    }
}

struct Bridge {
    node: Keys,
    transport: Arc<RecordingTransport>,
    pipeline: IngestionPipeline<Arc<RecordingTransport>>,
    queue: MemoryQueue,
}

impl Bridge {
    fn new() -> Self {
        let node = Keys::generate();
        let transport = Arc::new(RecordingTransport::default());
        let mut pipeline = IngestionPipeline::new(
            ControlGate::new(node.clone()),
            Arc::new(FilterRegistry::new()),
            Arc::new(PushRegistry::new()),
            PushDispatcher::new(Arc::clone(&transport)),
        );
        pipeline.backfill(Vec::new());

        Self {
            node,
            transport,
            pipeline,
            queue: MemoryQueue::new(),
        }
    }

    fn control_for(&self, sender: &Keys, recipient: &Keys, payload: &str) -> Event {
        control_event(sender, &self.node, recipient, payload, 1_700_000_000)
    }

    fn control(&self, sender: &Keys, payload: &str) -> Event {
        self.control_for(sender, &self.node, payload)
    }

    /// Push one envelope through the queue and the pipeline.
    async fn deliver_raw(&mut self, body: Vec<u8>) -> (u64, Disposition) {
        let tag = self.queue.push(body);
        let envelope = self.queue.next_envelope().await.unwrap().unwrap();
        let disposition = self.pipeline.process_envelope(&envelope).await.unwrap();
        (tag, disposition)
    }

    async fn deliver(&mut self, event: Event) -> (u64, Disposition) {
        self.deliver_raw(serde_json::to_vec(&wrap(event)).unwrap()).await
    }

    fn sent_to(&self) -> Vec<PushToken> {
        self.transport
            .sent
            .lock()
            .iter()
            .map(|m| m.to.clone())
            .collect()
    }
}

/// Control event from `sender`, encrypted for `node` and tagged for `recipient`
fn control_event(
    sender: &Keys,
    node: &Keys,
    recipient: &Keys,
    payload: &str,
    created_at: u64,
) -> Event {
    let content = nip04::encrypt(sender.secret_key(), &node.public_key(), payload).unwrap();
    EventBuilder::new(Kind::from(KIND_APP_DATA), content)
        .tag(Tag::public_key(recipient.public_key()))
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(sender)
        .unwrap()
}

fn wrap(event: Event) -> QueueWrapper {
    QueueWrapper {
        event,
        event_type: "new".to_string(),
        received_at: 1_700_000_001,
        source_info: "127.0.0.1".to_string(),
    }
}

fn note(content: &str, kind: u16) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .tag(Tag::parse(["l", "8FVC9G8F+6X"]).unwrap())
        .sign_with_keys(&Keys::generate())
        .unwrap()
}

#[tokio::test]
async fn test_control_then_matching_event_pushes_once() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();
    let pk1 = Identity::from(client.public_key());

    let control = bridge.control(&client, r#"{"filters":[{"kinds":[1]}],"tokens":["tokA"]}"#);
    let (_, disposition) = bridge.deliver(control).await;
    assert_eq!(disposition, Disposition::Acked);

    let report = bridge.pipeline.handle_domain(&note("first", 1)).await;
    assert_eq!(
        report.deliveries,
        vec![Delivery {
            identity: pk1,
            token: PushToken::from("tokA"),
            outcome: DeliveryOutcome::Accepted { ticket: None },
        }]
    );

    let second = note("hello from the map", 1);
    let second_id = second.id.to_hex();
    let (tag, disposition) = bridge.deliver(second).await;
    assert_eq!(disposition, Disposition::Acked);
    assert_eq!(bridge.queue.settlement_of(tag), Some(Settlement::Acked));
    assert_eq!(bridge.sent_to().len(), 2);

    let sent = bridge.transport.sent.lock();
    assert_eq!(sent[1].title, "New note in plus code 8FVC9G8F+6X");
    assert_eq!(sent[1].body, "hello from the map");
    assert_eq!(sent[1].data["id"], second_id);
}

#[tokio::test]
async fn test_wrapped_entries_are_accepted() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();

    let control = bridge.control(
        &client,
        r#"{"filters":[{"filter":{"kinds":[1]}}],"tokens":[{"expoPushToken":"tokA"}]}"#,
    );
    bridge.deliver(control).await;

    let report = bridge.pipeline.handle_domain(&note("n1", 1)).await;
    assert_eq!(report.accepted(), 1);
    assert_eq!(bridge.sent_to(), vec![PushToken::from("tokA")]);
}

#[tokio::test]
async fn test_second_control_replaces_filters_and_clears_tokens() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();
    let pk1 = Identity::from(client.public_key());

    let first = bridge.control(&client, r#"{"filters":[{"kinds":[1]}],"tokens":["tokA"]}"#);
    bridge.deliver(first).await;

    let second = bridge.control(&client, r#"{"filters":[{"kinds":[2]}]}"#);
    bridge.deliver(second).await;

    let report = bridge.pipeline.handle_domain(&note("n1", 1)).await;
    assert!(report.deliveries.is_empty());
    assert!(report.no_destination.is_empty());

    let report = bridge.pipeline.handle_domain(&note("n2", 2)).await;
    assert!(report.deliveries.is_empty());
    assert_eq!(report.no_destination, vec![pk1.clone()]);

    assert!(bridge.pipeline.pushes().get(&pk1).is_empty());
    assert!(bridge.sent_to().is_empty());
}

#[tokio::test]
async fn test_control_for_other_recipient_is_ignored() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();
    let somebody_else = Keys::generate();

    let control = bridge.control_for(
        &client,
        &somebody_else,
        r#"{"filters":[{"kinds":[1]}],"tokens":["tokA"]}"#,
    );
    let (tag, disposition) = bridge.deliver(control).await;

    assert_eq!(disposition, Disposition::Acked);
    assert_eq!(bridge.queue.settlement_of(tag), Some(Settlement::Acked));
    assert!(bridge.pipeline.filters().is_empty());
    assert!(bridge.pipeline.pushes().is_empty());
    assert_eq!(bridge.pipeline.stats().snapshot().not_admitted, 1);
}

#[tokio::test]
async fn test_non_json_plaintext_clears_both_registries() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();
    let pk1 = Identity::from(client.public_key());

    bridge
        .deliver(bridge.control(&client, r#"{"filters":[{"kinds":[1]}],"tokens":["tokA"]}"#))
        .await;
    assert_eq!(bridge.pipeline.filters().get(&pk1).len(), 1);

    let outcome = bridge
        .pipeline
        .handle_control(&bridge.control(&client, "definitely not json"));
    assert!(matches!(
        outcome,
        ControlOutcome::Applied {
            new_identity: false,
            filters: 0,
            tokens: 0,
            ..
        }
    ));

    assert!(bridge.pipeline.filters().get(&pk1).is_empty());
    assert!(bridge.pipeline.pushes().get(&pk1).is_empty());
    let report = bridge.pipeline.handle_domain(&note("n1", 1)).await;
    assert!(report.deliveries.is_empty());
    assert!(bridge.sent_to().is_empty());
}

#[tokio::test]
async fn test_unparsable_envelope_requeued_without_state_change() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();

    let control = bridge.control(&client, r#"{"filters":[{"kinds":[1]}],"tokens":["tokA"]}"#);
    bridge.deliver(control).await;
    let filters_before = bridge.pipeline.filters().snapshot();

    let bad = bridge.queue.push(b"{\"event\": 42".to_vec());
    let good = bridge
        .queue
        .push(serde_json::to_vec(&wrap(note("n1", 1))).unwrap());

    let envelope = bridge.queue.next_envelope().await.unwrap().unwrap();
    let disposition = bridge.pipeline.process_envelope(&envelope).await.unwrap();
    assert_eq!(disposition, Disposition::Requeued);
    assert_eq!(
        bridge.queue.settlement_of(bad),
        Some(Settlement::Rejected { requeue: true })
    );
    assert_eq!(bridge.pipeline.filters().snapshot(), filters_before);

    // The valid envelope behind it is still processed.
    let envelope = bridge.queue.next_envelope().await.unwrap().unwrap();
    assert_eq!(envelope.delivery_tag(), good);
    let disposition = bridge.pipeline.process_envelope(&envelope).await.unwrap();
    assert_eq!(disposition, Disposition::Acked);
    assert_eq!(bridge.sent_to(), vec![PushToken::from("tokA")]);

    // The rejected body comes back, marked as redelivered.
    let envelope = bridge.queue.next_envelope().await.unwrap().unwrap();
    assert!(envelope.redelivered());
    assert_eq!(envelope.body(), b"{\"event\": 42");
}

#[tokio::test]
async fn test_repeated_control_is_idempotent() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();
    let payload = r##"{"filters":[{"kinds":[1]},{"#t":["coffee"]}],"tokens":["tokA","tokB"]}"##;

    bridge.deliver(bridge.control(&client, payload)).await;
    let filters_once = bridge.pipeline.filters().snapshot();
    let pushes_once = bridge.pipeline.pushes().snapshot();

    bridge.deliver(bridge.control(&client, payload)).await;
    assert_eq!(bridge.pipeline.filters().snapshot(), filters_once);
    assert_eq!(bridge.pipeline.pushes().snapshot(), pushes_once);
    assert_eq!(bridge.pipeline.pushes().item_count(), 2);
}

#[tokio::test]
async fn test_bad_entries_skipped_good_entries_kept() {
    let mut bridge = Bridge::new();
    let client = Keys::generate();
    let pk1 = Identity::from(client.public_key());
    let author = Keys::generate().public_key().to_hex();

    let payload = format!(
        r#"{{"filters":[{{"kinds":[1]}},{{"kinds":"one"}},{{"since":"yesterday"}},{{"authors":["{}"]}}],"tokens":["tokA",17]}}"#,
        author
    );
    let outcome = bridge
        .pipeline
        .handle_control(&bridge.control(&client, &payload));

    assert!(matches!(
        outcome,
        ControlOutcome::Applied {
            filters: 2,
            tokens: 1,
            skipped: 3,
            ..
        }
    ));
    assert_eq!(bridge.pipeline.filters().get(&pk1).len(), 2);
}

#[tokio::test]
async fn test_backfill_seeds_state_without_dispatch() {
    let node = Keys::generate();
    let transport = Arc::new(RecordingTransport::default());
    let mut pipeline = IngestionPipeline::new(
        ControlGate::new(node.clone()),
        Arc::new(FilterRegistry::new()),
        Arc::new(PushRegistry::new()),
        PushDispatcher::new(Arc::clone(&transport)),
    );

    let client = Keys::generate();
    let events = vec![
        control_event(
            &client,
            &node,
            &node,
            r#"{"filters":[{"kinds":[1]}],"tokens":["old"]}"#,
            10,
        ),
        control_event(
            &client,
            &node,
            &node,
            r#"{"filters":[{"kinds":[7]}],"tokens":["new"]}"#,
            20,
        ),
    ];
    assert_eq!(pipeline.backfill(events), 2);

    let pk1 = Identity::from(client.public_key());
    assert_eq!(&*pipeline.pushes().get(&pk1), &[PushToken::from("new")]);
    assert!(transport.sent.lock().is_empty());

    let report = pipeline.handle_domain(&note("n7", 7)).await;
    assert_eq!(report.accepted(), 1);
}
