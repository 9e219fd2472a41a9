//! Flow execution engine for MCP-backed, multi-node LLM agent flows.
//!
//! Six components compose into one [`Engine`]: a flat-keyspace [`storage`]
//! layer, a [`secrets`] resolver for `${global:NAME}`/`encrypted:` values,
//! an [`mcp`] connection manager, an OpenAI-compatible [`llm`] invoker, a
//! [`prompt`] renderer that expands tool pills, and the [`flow_exec`]
//! executor that drives a conversation through a [`model::Flow`] node by
//! node.
//!
//! ```no_run
//! use std::sync::Arc;
//! use flujo_engine::prelude::*;
//!
//! # async fn run() {
//! let storage: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
//! let engine = Engine::new(storage, Arc::new(NullSecretStore));
//! let _ = engine.executor.run("flow-1", "conversation-1", true).await;
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod flow_exec;
pub mod llm;
pub mod mcp;
pub mod model;
pub mod observability;
pub mod prompt;
pub mod secrets;
pub mod storage;
pub mod xml_escape;

use std::sync::Arc;

pub use crate::flow_exec::{Action, ExecutorError, FlowExecutor, MAX_INTERNAL_ITERATIONS};
pub use crate::llm::{InvocationOutcome, InvokerError, ModelInvoker};
pub use crate::mcp::{diagnose, McpClientHandle, McpError, McpManager, ServerStatus};
pub use crate::model::*;
pub use crate::observability::init_default_tracing;
pub use crate::prompt::{PromptRenderer, RenderOptions, ToolCatalogSource, ToolDescriptor, ToolParam};
pub use crate::secrets::{NullSecretStore, SecretError, SecretResolver, SecretStore, StaticSecretStore};
pub use crate::storage::{keys, FileStorageGateway, InMemoryStorageGateway, StorageError, StorageGateway, StorageGatewayExt};

/// Wires the six components together, per `spec.md` §6: build the shared
/// storage and secret layers first, then the components that depend on
/// them, finishing with the [`FlowExecutor`] that drives everything else.
pub struct Engine {
    pub storage: Arc<dyn StorageGateway>,
    pub secrets: Arc<SecretResolver>,
    pub mcp: Arc<McpManager>,
    pub invoker: Arc<ModelInvoker>,
    pub renderer: Arc<PromptRenderer>,
    pub executor: Arc<FlowExecutor>,
}

impl Engine {
    pub fn new(storage: Arc<dyn StorageGateway>, secret_store: Arc<dyn SecretStore>) -> Self {
        let secrets = Arc::new(SecretResolver::new(secret_store, storage.clone()));
        let mcp = Arc::new(McpManager::new(storage.clone(), secrets.clone()));
        let invoker = Arc::new(ModelInvoker::new(storage.clone(), secrets.clone()));
        let renderer = Arc::new(PromptRenderer::new(mcp.clone()));
        let executor = Arc::new(FlowExecutor::new(storage.clone(), renderer.clone(), mcp.clone(), invoker.clone()));
        Self { storage, secrets, mcp, invoker, renderer, executor }
    }

    /// Connects every enabled MCP server from storage. Call once at
    /// startup; a server that fails to connect is logged and skipped
    /// rather than aborting the others, per `spec.md` §4.4.
    pub async fn start(&self) {
        self.mcp.start_enabled_servers().await;
    }
}

/// Commonly used items for embedding the engine in a host application.
pub mod prelude {
    pub use crate::{
        init_default_tracing,
        model::{
            ConversationState, ConversationStatus, Flow, Message, ModelCatalog, ModelConfig, Node,
            NodeType, Role, ToolCall,
        },
        Action, Engine, ExecutorError, FlowExecutor, InMemoryStorageGateway, NullSecretStore,
        SecretStore, StorageGateway,
    };
}
