//! Framing and wire vocabulary of the broker protocol.
//!
//! - [`Message`]: multi-frame message with envelope push/pop
//! - [`Identity`]: opaque peer address used for routing
//! - [`wire`]: protocol constants and body/param parsing

pub mod frame;
pub mod identity;
pub mod wire;

pub use frame::Message;
pub use identity::Identity;
pub use wire::{AdminQuery, AnswerStatus, ClientReply, JobName, WorkerBody};
