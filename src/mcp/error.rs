use std::fmt;

/// Mirrors `McpIntegrationError`'s shape, extended with the connection
/// lifecycle and dispatch errors the Connection Manager needs (`spec.md`
/// §4.4): not-connected, timeout, and the diagnostics-enriched variant.
#[derive(Debug)]
pub enum McpError {
    Sdk(String),
    Connection(String),
    Discovery(String),
    ToolConversion(String),
    NotConnected(String),
    Timeout {
        tool_name: String,
        timeout_seconds: f64,
        /// The websocket transport's JSON-RPC request id, sent back to the
        /// server in a `notifications/cancelled`; for transports with no
        /// wire-level cancellation this is a human-readable placeholder.
        correlation_token: String,
    },
    /// A connection-closed error enriched with everything `spec.md` §4.4's
    /// "Diagnostics" section asks for: configured command, resolved path,
    /// path existence, directory existence, and the stderr tail.
    Diagnostic {
        server: String,
        message: String,
        configured_command: String,
        resolved_path: String,
        path_exists: bool,
        directory_exists: bool,
        stderr_tail: Vec<String>,
    },
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::Sdk(e) => write!(f, "mcp sdk error: {e}"),
            McpError::Connection(s) => write!(f, "failed to connect to mcp server: {s}"),
            McpError::Discovery(s) => write!(f, "failed to discover mcp tools: {s}"),
            McpError::ToolConversion(s) => write!(f, "failed to convert mcp tool: {s}"),
            McpError::NotConnected(s) => write!(f, "mcp server not connected: {s}"),
            McpError::Timeout { tool_name, timeout_seconds, correlation_token } => write!(
                f,
                "tool '{tool_name}' timed out after {timeout_seconds}s (cancellation token: {correlation_token})"
            ),
            McpError::Diagnostic { server, message, configured_command, resolved_path, path_exists, directory_exists, stderr_tail } => write!(
                f,
                "mcp server '{server}' connection closed: {message}\n  command: {configured_command}\n  resolved path: {resolved_path} (exists: {path_exists})\n  directory exists: {directory_exists}\n  stderr tail:\n{}",
                stderr_tail.join("\n")
            ),
        }
    }
}

impl std::error::Error for McpError {}
