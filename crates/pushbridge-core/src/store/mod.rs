pub mod registry;

pub use registry::{FilterRegistry, PushRegistry, Registry};
