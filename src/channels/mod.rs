//! Channel abstraction for message I/O.

pub mod channel;
pub mod cli;
pub mod email;
pub mod email_types;
pub mod imap;
pub mod smtp;

pub use channel::*;
pub use cli::CliChannel;
pub use email::{ConnectionState, EmailChannel, PollReport};
pub use email_types::ParsedMail;
