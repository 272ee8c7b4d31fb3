//! Message bus client surface for OCPMedia.
//!
//! The player core is driven entirely by pub/sub messages. This crate holds
//! the `Message` envelope, the `MessageBus` handle the rest of the workspace
//! programs against, and the source-gating predicate shared by every service
//! handler. The bundled implementation delivers messages in-process on a
//! dedicated thread; connecting the same surface to an external transport is
//! a deployment concern, not a core one.

mod client;
mod gate;
mod message;

pub use client::{MessageBus, MessageWaiter, Subscription};
pub use gate::is_message_for_sources;
pub use message::Message;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("timed out waiting for a reply to '{0}'")]
    ResponseTimeout(String),
    #[error("message bus is shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BusError>;
