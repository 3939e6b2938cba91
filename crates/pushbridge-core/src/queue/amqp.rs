use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, info};

use super::{Envelope, EnvelopeStream};
use crate::constants::EXCHANGE_NAME;
use crate::error::QueueError;

/// Consumer bound to the relay's fanout exchange.
///
/// Prefetch is 1: the pipeline settles each message before asking for the next.
pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    queue: String,
}

impl AmqpConsumer {
    /// Connect and declare the durable exchange, queue and binding.
    pub async fn connect(url: &str, queue: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let durable_exchange = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Fanout,
                durable_exchange,
                FieldTable::default(),
            )
            .await?;

        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .queue_declare(queue, durable_queue, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue,
                EXCHANGE_NAME,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("pushbridge-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue, exchange = EXCHANGE_NAME, %consumer_tag, "consuming from queue");

        Ok(Self {
            connection,
            channel,
            consumer,
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl EnvelopeStream for AmqpConsumer {
    type Envelope = AmqpEnvelope;

    async fn next_envelope(&mut self) -> Option<Result<AmqpEnvelope, QueueError>> {
        self.consumer
            .next()
            .await
            .map(|delivery| delivery.map(AmqpEnvelope).map_err(QueueError::from))
    }

    async fn close(self) -> Result<(), QueueError> {
        debug!(queue = %self.queue, "closing AMQP connection");
        self.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

pub struct AmqpEnvelope(Delivery);

#[async_trait]
impl Envelope for AmqpEnvelope {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn redelivered(&self) -> bool {
        self.0.redelivered
    }

    fn delivery_tag(&self) -> u64 {
        self.0.delivery_tag
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Settle {
                tag: self.0.delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.0
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| QueueError::Settle {
                tag: self.0.delivery_tag,
                reason: e.to_string(),
            })
    }
}
