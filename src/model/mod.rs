mod conversation;
mod flow;
mod mcp_config;
mod message;
mod model_config;
mod tool_call;

pub use conversation::{ConversationState, ConversationStatus, TraceEntry};
pub use flow::{Edge, Flow, McpBinding, Node, NodeProperties, NodeType};
pub use mcp_config::{
    DockerParams, DockerTransportMethod, McpServerConfig, McpServerConfigPatch, McpTransport,
    StdioParams,
};
pub use message::{Message, Role};
pub use model_config::{FunctionCallingSchema, ModelCatalog, ModelConfig, ReasoningTagSchema};
pub use tool_call::{ToolCall, ToolCallFunction, TOOL_DELIM};
