pub mod dispatcher;
pub mod expo;
pub mod message;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::models::PushToken;

pub use dispatcher::{Delivery, DispatchReport, PushDispatcher};
pub use expo::{is_expo_push_token, ExpoTransport};
pub use message::{Priority, PushMessage};

/// Result of handing one message to the push service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the service, with its ticket id when one was issued
    Accepted { ticket: Option<String> },
    /// Refused for this token (invalid or unregistered device, etc.)
    Rejected(String),
    /// The request carrying this message failed
    Failed(String),
    /// Still outstanding when the dispatch deadline passed
    TimedOut,
}

impl DeliveryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted { .. })
    }
}

/// Push service seam.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Syntax check done before any network call.
    fn validate_token(&self, _token: &PushToken) -> Result<(), String> {
        Ok(())
    }

    /// Largest number of messages accepted by one `send_batch` call
    fn max_batch(&self) -> usize {
        1
    }

    /// Send `messages`, returning one outcome per message in the same order.
    async fn send_batch(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<DeliveryOutcome>, DispatchError>;
}

#[async_trait]
impl<T: PushTransport + ?Sized> PushTransport for Arc<T> {
    fn validate_token(&self, token: &PushToken) -> Result<(), String> {
        (**self).validate_token(token)
    }

    fn max_batch(&self) -> usize {
        (**self).max_batch()
    }

    async fn send_batch(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<DeliveryOutcome>, DispatchError> {
        (**self).send_batch(messages).await
    }
}
