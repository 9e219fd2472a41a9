use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolRequestParam, InitializeRequestParam};
use rmcp::service::RunningService;
use rmcp::RoleClient;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::prompt::{ToolDescriptor, ToolParam};

use super::error::McpError;
use super::stderr_buffer::StderrBuffer;
use super::ws_client::WsMcpClient;

/// How long [`McpClientHandle::close`] waits for a graceful `cancel()`
/// acknowledgement before giving up on it, per `spec.md` §4.4's disconnect
/// sequence.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A stdio/docker-spawned child has no `InitializeRequestParam` round-trip
/// the way the HTTP-based transports do; rmcp types the two differently
/// (`()` vs `InitializeRequestParam`), matching `ArcMcpStdioClient` /
/// `ArcMcpSseClient` in the teacher's `mcp_tool_builder`.
pub type StdioService = RunningService<RoleClient, ()>;
pub type HttpService = RunningService<RoleClient, InitializeRequestParam>;

/// `Option` wraps every rmcp-backed variant so [`McpClientHandle::close`]
/// can take the service out by value: `RunningService::cancel` consumes
/// `self`, and these are reached only through a shared `Arc`.
enum ClientInner {
    Stdio(Option<StdioService>),
    Docker(Option<StdioService>),
    Sse(Option<HttpService>),
    StreamableHttp(Option<HttpService>),
    WebSocket(WsMcpClient),
}

/// One live connection to an MCP server, bundling a transport, the rmcp (or
/// hand-rolled websocket) client, and a rolling stderr buffer for
/// process-backed transports, per `spec.md` §4.4.
pub struct McpClientHandle {
    inner: Mutex<ClientInner>,
    pub stderr: Option<Arc<StderrBuffer>>,
}

impl McpClientHandle {
    pub(super) fn stdio(service: StdioService, stderr: Arc<StderrBuffer>) -> Self {
        Self { inner: Mutex::new(ClientInner::Stdio(Some(service))), stderr: Some(stderr) }
    }

    pub(super) fn docker(service: StdioService, stderr: Arc<StderrBuffer>) -> Self {
        Self { inner: Mutex::new(ClientInner::Docker(Some(service))), stderr: Some(stderr) }
    }

    pub(super) fn sse(service: HttpService) -> Self {
        Self { inner: Mutex::new(ClientInner::Sse(Some(service))), stderr: None }
    }

    pub(super) fn streamable_http(service: HttpService) -> Self {
        Self { inner: Mutex::new(ClientInner::StreamableHttp(Some(service))), stderr: None }
    }

    pub(super) fn websocket(client: WsMcpClient) -> Self {
        Self { inner: Mutex::new(ClientInner::WebSocket(client)), stderr: None }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let inner = self.inner.lock().await;
        match &*inner {
            ClientInner::Stdio(s) | ClientInner::Docker(s) => {
                let s = s.as_ref().ok_or_else(closed_error)?;
                let result = s.list_tools(Default::default()).await.map_err(|e| McpError::Discovery(e.to_string()))?;
                Ok(result.tools.iter().map(rmcp_tool_to_descriptor).collect())
            }
            ClientInner::Sse(s) | ClientInner::StreamableHttp(s) => {
                let s = s.as_ref().ok_or_else(closed_error)?;
                let result = s.list_tools(Default::default()).await.map_err(|e| McpError::Discovery(e.to_string()))?;
                Ok(result.tools.iter().map(rmcp_tool_to_descriptor).collect())
            }
            ClientInner::WebSocket(ws) => {
                let value = ws.list_tools().await?;
                parse_ws_tool_list(&value)
            }
        }
    }

    /// `timeout`: `None` races nothing. For the websocket transport, a
    /// timeout reserves a request id up front so it can send a
    /// correlated `notifications/cancelled` if the call doesn't finish in
    /// time; the rmcp-backed transports have no equivalent hook exposed by
    /// their `call_tool` convenience method, so a timeout there only
    /// abandons the local future — the server is never told.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout: Option<Duration>) -> Result<String, McpError> {
        let inner = self.inner.lock().await;
        let args_object = arguments.as_object().cloned();
        match &*inner {
            ClientInner::Stdio(s) | ClientInner::Docker(s) => {
                let s = s.as_ref().ok_or_else(closed_error)?;
                let result = race(
                    s.call_tool(CallToolRequestParam { name: tool_name.to_string().into(), arguments: args_object }),
                    timeout,
                    tool_name,
                )
                .await?;
                Ok(flatten_rmcp_content(&result))
            }
            ClientInner::Sse(s) | ClientInner::StreamableHttp(s) => {
                let s = s.as_ref().ok_or_else(closed_error)?;
                let result = race(
                    s.call_tool(CallToolRequestParam { name: tool_name.to_string().into(), arguments: args_object }),
                    timeout,
                    tool_name,
                )
                .await?;
                Ok(flatten_rmcp_content(&result))
            }
            ClientInner::WebSocket(ws) => match timeout {
                None => {
                    let value = ws.call_tool(tool_name, arguments).await?;
                    Ok(flatten_ws_content(&value))
                }
                Some(d) => {
                    let id = ws.reserve_request_id();
                    match tokio::time::timeout(d, ws.call_tool_with_id(id, tool_name, arguments)).await {
                        Ok(Ok(value)) => Ok(flatten_ws_content(&value)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => {
                            ws.cancel_request(id, "client timeout").await;
                            Err(McpError::Timeout {
                                tool_name: tool_name.to_string(),
                                timeout_seconds: d.as_secs_f64(),
                                correlation_token: id.to_string(),
                            })
                        }
                    }
                }
            },
        }
    }

    /// Staged teardown per `spec.md` §4.4: attempt a graceful `cancel()`
    /// (which closes the child's stdin for process-backed transports) and
    /// give it [`GRACEFUL_SHUTDOWN_TIMEOUT`] to finish; a server that ignores
    /// it is left to the `Drop` of whatever remains once this returns. For
    /// docker-backed servers, [`super::manager::McpManager::disconnect_server`]
    /// follows this with `docker stop`, which is the actual hard-kill step;
    /// plain stdio processes that ignore the graceful cancel have no
    /// equivalent forced-kill here, since rmcp's `TokioChildProcess` doesn't
    /// hand back a raw child handle to send a signal through directly.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        match &mut *inner {
            ClientInner::Stdio(svc) | ClientInner::Docker(svc) => {
                if let Some(service) = svc.take() {
                    graceful_cancel(service, "mcp child process").await;
                }
            }
            ClientInner::Sse(svc) | ClientInner::StreamableHttp(svc) => {
                if let Some(service) = svc.take() {
                    graceful_cancel(service, "mcp server").await;
                }
            }
            ClientInner::WebSocket(ws) => ws.close().await,
        }
    }
}

fn closed_error() -> McpError {
    McpError::NotConnected("connection was already closed".to_string())
}

async fn race<F, T, E>(fut: F, timeout: Option<Duration>, tool_name: &str) -> Result<T, McpError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    match timeout {
        None => fut.await.map_err(|e| McpError::Sdk(e.to_string())),
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(McpError::Sdk(e.to_string())),
            Err(_) => Err(McpError::Timeout {
                tool_name: tool_name.to_string(),
                timeout_seconds: d.as_secs_f64(),
                correlation_token: "unavailable (no wire cancellation for this transport)".to_string(),
            }),
        },
    }
}

async fn graceful_cancel<Info>(service: RunningService<RoleClient, Info>, what: &str) {
    match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, service.cancel()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "{what} did not shut down cleanly"),
        Err(_) => warn!("{what} ignored cancellation after {GRACEFUL_SHUTDOWN_TIMEOUT:?}"),
    }
}

fn rmcp_tool_to_descriptor(tool: &rmcp::model::Tool) -> ToolDescriptor {
    let mut params = Vec::new();
    let schema = &*tool.input_schema;
    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (name, details) in properties {
            let (type_name, description) = match details {
                Value::Object(details) => (
                    details.get("type").and_then(Value::as_str).unwrap_or("string").to_string(),
                    details.get("description").and_then(Value::as_str).unwrap_or("").to_string(),
                ),
                _ => ("string".to_string(), String::new()),
            };
            params.push(ToolParam { name: name.clone(), description, type_name });
        }
    }
    ToolDescriptor {
        name: tool.name.clone().into_owned(),
        description: tool.description.clone().map(|d| d.into_owned()).unwrap_or_default(),
        params,
    }
}

fn flatten_rmcp_content(result: &rmcp::model::CallToolResult) -> String {
    let mut out = String::new();
    for content in &result.content {
        if let Some(text) = content.as_text() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&text.text);
        }
    }
    out
}

fn parse_ws_tool_list(value: &Value) -> Result<Vec<ToolDescriptor>, McpError> {
    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| McpError::Discovery("tools/list response missing a 'tools' array".to_string()))?;

    Ok(tools
        .iter()
        .map(|t| {
            let name = t.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let description = t.get("description").and_then(Value::as_str).unwrap_or_default().to_string();
            let mut params = Vec::new();
            if let Some(Value::Object(properties)) = t.get("inputSchema").and_then(|s| s.get("properties")) {
                for (name, details) in properties {
                    let type_name = details.get("type").and_then(Value::as_str).unwrap_or("string").to_string();
                    let description = details.get("description").and_then(Value::as_str).unwrap_or("").to_string();
                    params.push(ToolParam { name: name.clone(), description, type_name });
                }
            }
            ToolDescriptor { name, description, params }
        })
        .collect())
}

fn flatten_ws_content(value: &Value) -> String {
    value
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
