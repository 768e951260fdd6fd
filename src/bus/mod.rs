//! Message bus connecting channels to the agent loop.

pub mod message;
pub mod queue;

pub use message::{Attachment, CHECK_COMMAND, InboundMessage, OutboundMessage};
pub use queue::{MessageBus, Shutdown, shutdown_signal};
