pub mod event;
pub mod tag_utils;

pub use event::{Identity, PushToken, QueueWrapper};
