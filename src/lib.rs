//! Mailbus: a message bus between chat-style channels and an agent loop,
//! with an IMAP/SMTP email channel.

pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod tools;
