use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Envelope, EnvelopeStream};
use crate::error::QueueError;
use crate::models::QueueWrapper;

/// How a message taken from a `MemoryQueue` was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected { requeue: bool },
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Pending>,
    settlements: Vec<(u64, Settlement)>,
    next_tag: u64,
    closed: bool,
}

#[derive(Debug, Clone)]
struct Pending {
    tag: u64,
    body: Vec<u8>,
    redelivered: bool,
}

impl State {
    fn enqueue(&mut self, body: Vec<u8>, redelivered: bool) -> u64 {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.pending.push_back(Pending {
            tag,
            body,
            redelivered,
        });
        tag
    }
}

/// In-process queue with broker-like settlement: a requeued message goes to
/// the back marked as redelivered. The stream ends once nothing is pending.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body, returning its delivery tag.
    pub fn push(&self, body: impl Into<Vec<u8>>) -> u64 {
        self.state.lock().enqueue(body.into(), false)
    }

    pub fn push_wrapper(&self, wrapper: &QueueWrapper) -> Result<u64, serde_json::Error> {
        Ok(self.push(serde_json::to_vec(wrapper)?))
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether a handle to this queue was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn settlement_of(&self, tag: u64) -> Option<Settlement> {
        self.state
            .lock()
            .settlements
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, s)| *s)
    }
}

#[async_trait]
impl EnvelopeStream for MemoryQueue {
    type Envelope = MemoryEnvelope;

    async fn next_envelope(&mut self) -> Option<Result<MemoryEnvelope, QueueError>> {
        let pending = self.state.lock().pending.pop_front()?;
        Some(Ok(MemoryEnvelope {
            state: Arc::clone(&self.state),
            pending,
        }))
    }

    async fn close(self) -> Result<(), QueueError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

pub struct MemoryEnvelope {
    state: Arc<Mutex<State>>,
    pending: Pending,
}

impl MemoryEnvelope {
    fn settle(&self, settlement: Settlement) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.settlements.iter().any(|(t, _)| *t == self.pending.tag) {
            return Err(QueueError::Settle {
                tag: self.pending.tag,
                reason: "already settled".to_string(),
            });
        }
        state.settlements.push((self.pending.tag, settlement));
        if settlement == (Settlement::Rejected { requeue: true }) {
            state.enqueue(self.pending.body.clone(), true);
        }
        Ok(())
    }
}

#[async_trait]
impl Envelope for MemoryEnvelope {
    fn body(&self) -> &[u8] {
        &self.pending.body
    }

    fn redelivered(&self) -> bool {
        self.pending.redelivered
    }

    fn delivery_tag(&self) -> u64 {
        self.pending.tag
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.settle(Settlement::Acked)
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.settle(Settlement::Rejected { requeue })
    }
}
