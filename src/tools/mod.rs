//! Tool abstraction for agent capabilities.

pub mod email;
pub mod registry;
pub mod tool;

pub use email::{CheckEmailTool, SendEmailTool};
pub use registry::ToolRegistry;
pub use tool::*;
