mod client;
mod error;
mod manager;
mod stderr_buffer;
mod ws_client;

pub use client::McpClientHandle;
pub use error::McpError;
pub use manager::{diagnose, McpManager, ServerStatus};
pub use stderr_buffer::StderrBuffer;
