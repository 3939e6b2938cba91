//! Queue consumption seam
//!
//! The pipeline only needs a sequential stream of envelopes it can settle one
//! by one. `AmqpConsumer` reads the relay's fanout exchange; `MemoryQueue` is
//! the in-process stand-in used by tests and local replay.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;

use crate::error::QueueError;

pub use amqp::{AmqpConsumer, AmqpEnvelope};
pub use memory::{MemoryEnvelope, MemoryQueue, Settlement};

/// One message taken from the queue, not yet settled.
#[async_trait]
pub trait Envelope: Send + Sync {
    fn body(&self) -> &[u8];

    /// Broker says this message was handed out before
    fn redelivered(&self) -> bool;

    fn delivery_tag(&self) -> u64;

    async fn ack(&self) -> Result<(), QueueError>;

    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

#[async_trait]
pub trait EnvelopeStream: Send {
    type Envelope: Envelope;

    /// Next message, or `None` once the stream is closed
    async fn next_envelope(&mut self) -> Option<Result<Self::Envelope, QueueError>>;

    /// Release the underlying connection; unsettled messages go back to the broker.
    async fn close(self) -> Result<(), QueueError>
    where
        Self: Sized,
    {
        Ok(())
    }
}
