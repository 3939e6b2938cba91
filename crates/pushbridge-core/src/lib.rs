//! Core of the pushbridge service.
//!
//! Learns per-identity filters and push tokens from encrypted control events,
//! matches every other event against them and fans matched events out to the
//! push transport.

pub mod constants;
pub mod control;
pub mod error;
pub mod gate;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod push;
pub mod queue;
pub mod relay;
pub mod stats;
pub mod store;

pub use control::{parse_control, parse_filters, parse_push_tokens, ControlUpdate};
pub use error::{
    ControlParseError, DispatchError, EnvelopeDecodeError, GateError, NotAdmitted, QueueError,
    RelayError,
};
pub use gate::ControlGate;
pub use matcher::{match_event, MatchResult};
pub use models::{Identity, PushToken, QueueWrapper};
pub use pipeline::{
    Classified, ControlOutcome, Disposition, IngestionPipeline, PipelineState, RunEnd,
};
pub use push::{
    DeliveryOutcome, DispatchReport, ExpoTransport, PushDispatcher, PushMessage, PushTransport,
};
pub use queue::{AmqpConsumer, Envelope, EnvelopeStream, MemoryQueue};
pub use relay::{NostrBackfill, RelayBackfill};
pub use stats::{PipelineStats, SharedPipelineStats};
pub use store::{FilterRegistry, PushRegistry, Registry};
