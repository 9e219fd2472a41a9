use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::error::McpError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsWriter = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

/// A minimal JSON-RPC-over-WebSocket MCP client, grounded on `RemoteBackend`'s
/// `connect_async` + split-stream + id-correlated read loop. `rmcp`'s own
/// transports cover stdio, SSE, and streamable-HTTP; it has no bundled
/// WebSocket client, so the engine speaks the JSON-RPC wire format directly
/// for this one transport.
pub struct WsMcpClient {
    writer: Mutex<WsWriter>,
    pending: Pending,
    next_id: AtomicI64,
    reader_task: tokio::task::JoinHandle<()>,
}

impl WsMcpClient {
    pub async fn connect(url: &str) -> Result<Self, McpError> {
        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| McpError::Connection(format!("connect timeout against {url}")))?
            .map_err(|e| McpError::Connection(e.to_string()))?;

        let (writer, mut reader) = stream.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let pending_for_reader = pending.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "mcp websocket read error, ending reader loop");
                        break;
                    }
                };
                let text = match msg {
                    WsMessage::Text(t) => t,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "ignoring non-json-rpc websocket frame");
                        continue;
                    }
                };
                if let Some(id) = value.get("id").and_then(Value::as_i64) {
                    let mut pending = pending_for_reader.lock().await;
                    if let Some(tx) = pending.remove(&id) {
                        let _ = tx.send(value);
                    }
                }
            }
        });

        let client = Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicI64::new(1),
            reader_task,
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<(), McpError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "flujo-engine", "version": env!("CARGO_PKG_VERSION") },
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn send(&self, payload: Value) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(|e| McpError::Connection(e.to_string()))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    /// Allocates a JSON-RPC id without sending anything, so a caller can
    /// hold onto it and later correlate a `notifications/cancelled` to this
    /// specific in-flight request.
    pub fn reserve_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request_with_id(&self, id: i64, method: &str, params: Value) -> Result<Value, McpError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;
        let response = rx
            .await
            .map_err(|_| McpError::Connection("websocket reader task ended before a reply arrived".into()))?;
        if let Some(error) = response.get("error") {
            return Err(McpError::Sdk(error.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.reserve_request_id();
        self.request_with_id(id, method, params).await
    }

    pub async fn list_tools(&self) -> Result<Value, McpError> {
        self.request("tools/list", json!({})).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Same as [`Self::call_tool`] but under a caller-chosen request id, so
    /// the caller can cancel it by id if it times out.
    pub async fn call_tool_with_id(&self, id: i64, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.request_with_id(id, "tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Sends `notifications/cancelled` for a specific in-flight request, per
    /// the MCP spec's `{requestId, reason}` shape, and drops the pending
    /// response slot so a late reply is silently ignored.
    pub async fn cancel_request(&self, request_id: i64, reason: &str) {
        let _ = self
            .notify("notifications/cancelled", json!({ "requestId": request_id, "reason": reason }))
            .await;
        self.pending.lock().await.remove(&request_id);
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

impl Drop for WsMcpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
