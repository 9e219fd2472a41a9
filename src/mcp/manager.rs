use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation};
use rmcp::transport::{ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{DockerParams, DockerTransportMethod, McpServerConfig, McpServerConfigPatch, McpTransport, StdioParams};
use crate::prompt::{PromptError, ToolCatalogSource, ToolDescriptor};
use crate::secrets::SecretResolver;
use crate::storage::{keys, BoxFuture, StorageGateway};

use super::client::McpClientHandle;
use super::error::McpError;
use super::stderr_buffer::StderrBuffer;
use super::ws_client::WsMcpClient;

#[derive(Debug, Clone)]
pub enum ServerStatus {
    Initialization,
    Connected,
    Disconnected,
    Error { message: String, stderr_tail: Vec<String> },
}

struct ManagedServer {
    config: McpServerConfig,
    client: Option<Arc<McpClientHandle>>,
    status: ServerStatus,
}

/// Process-global so module-reload (development hot reload) never orphans a
/// subprocess: a freshly-constructed [`McpManager`] is just a new handle to
/// this same table, per `spec.md` §4.4's "Recovery" section.
static GLOBAL_REGISTRY: Lazy<RwLock<HashMap<String, Arc<Mutex<ManagedServer>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static DOCKER_CONTAINER_NAMES: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub struct McpManager {
    storage: Arc<dyn StorageGateway>,
    secrets: Arc<SecretResolver>,
    startup_complete: AtomicBool,
}

impl McpManager {
    pub fn new(storage: Arc<dyn StorageGateway>, secrets: Arc<SecretResolver>) -> Self {
        Self { storage, secrets, startup_complete: AtomicBool::new(false) }
    }

    async fn entry(&self, name: &str) -> Option<Arc<Mutex<ManagedServer>>> {
        GLOBAL_REGISTRY.read().await.get(name).cloned()
    }

    async fn load_configs(&self) -> Result<Vec<McpServerConfig>, McpError> {
        let value = self
            .storage
            .load(keys::MCP_SERVERS)
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?
            .unwrap_or_else(|| Value::Array(vec![]));
        serde_json::from_value(value).map_err(|e| McpError::Connection(e.to_string()))
    }

    async fn save_configs(&self, configs: &[McpServerConfig]) -> Result<(), McpError> {
        self.storage
            .save(keys::MCP_SERVERS, serde_json::to_value(configs).unwrap_or(Value::Array(vec![])))
            .await
            .map_err(|e| McpError::Connection(e.to_string()))
    }

    async fn config_for(&self, name: &str) -> Result<McpServerConfig, McpError> {
        self.load_configs()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| McpError::NotConnected(format!("no configured mcp server named {name}")))
    }

    /// Idempotent: creates the transport+client if absent, otherwise returns
    /// immediately. Resolved `${global:...}` / `encrypted:...` values in env
    /// vars are substituted before the process is spawned or the URL used.
    pub async fn connect_server(&self, name: &str) -> Result<(), McpError> {
        if let Some(existing) = self.entry(name).await {
            let guard = existing.lock().await;
            if guard.client.is_some() {
                return Ok(());
            }
        }

        let config = self.config_for(name).await?;
        if config.disabled {
            let entry = Arc::new(Mutex::new(ManagedServer { config, client: None, status: ServerStatus::Disconnected }));
            GLOBAL_REGISTRY.write().await.insert(name.to_string(), entry);
            return Ok(());
        }

        GLOBAL_REGISTRY.write().await.insert(
            name.to_string(),
            Arc::new(Mutex::new(ManagedServer { config: config.clone(), client: None, status: ServerStatus::Initialization })),
        );

        let resolved_env = self.resolve_env(&config).await;
        let connect_result = self.open_transport(name, &config, resolved_env).await;

        let entry = self.entry(name).await.expect("just inserted above");
        let mut guard = entry.lock().await;
        match connect_result {
            Ok(client) => {
                guard.client = Some(Arc::new(client));
                guard.status = ServerStatus::Connected;
                info!(server = name, "mcp server connected");
                Ok(())
            }
            Err(e) => {
                guard.status = ServerStatus::Error { message: e.to_string(), stderr_tail: vec![] };
                warn!(server = name, error = %e, "failed to connect mcp server");
                Err(e)
            }
        }
    }

    async fn resolve_env(&self, config: &McpServerConfig) -> HashMap<String, String> {
        let env = match &config.transport {
            McpTransport::Stdio(p) => p.env.clone(),
            McpTransport::Docker(p) => p.env.clone(),
            _ => HashMap::new(),
        };
        let mut resolved = HashMap::with_capacity(env.len());
        for (k, v) in env {
            resolved.insert(k, self.secrets.resolve_string(v).await);
        }
        resolved
    }

    async fn open_transport(
        &self,
        name: &str,
        config: &McpServerConfig,
        env: HashMap<String, String>,
    ) -> Result<McpClientHandle, McpError> {
        match &config.transport {
            McpTransport::Stdio(params) => connect_stdio(params, env).await,
            McpTransport::WebSocket { url } => {
                let client = WsMcpClient::connect(url).await?;
                Ok(McpClientHandle::websocket(client))
            }
            McpTransport::StreamableHttp { url } => connect_streamable_http(url).await,
            McpTransport::HttpSse { url } => connect_sse(url).await,
            McpTransport::Docker(params) => connect_docker(name, params, env).await,
        }
    }

    pub async fn disconnect_server(&self, name: &str) -> Result<(), McpError> {
        let Some(entry) = self.entry(name).await else { return Ok(()) };
        let mut guard = entry.lock().await;
        if let Some(client) = guard.client.take() {
            client.close().await;
        }
        guard.status = ServerStatus::Disconnected;

        if let McpTransport::Docker(_) = &guard.config.transport {
            let mut names = DOCKER_CONTAINER_NAMES.lock().await;
            if let Some(container_name) = names.remove(name) {
                let _ = Command::new("docker").args(["stop", &container_name]).status().await;
            }
        }
        Ok(())
    }

    pub async fn list_server_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| McpError::NotConnected(name.to_string()))?;
        let guard = entry.lock().await;
        let client = guard
            .client
            .as_ref()
            .ok_or_else(|| McpError::NotConnected(name.to_string()))?;
        client.list_tools().await
    }

    /// `timeout_seconds`: `None` = no timeout; `Some(-1.0)` = explicit no
    /// timeout; `Some(t)` with `t > 0.0` races the call against a timer.
    /// Timeout racing and any cancellation notification are the client
    /// handle's responsibility, since only it knows enough about the
    /// transport to correlate a cancellation to the right in-flight call.
    pub async fn call_tool(
        &self,
        server: &str,
        tool_name: &str,
        args: Value,
        timeout_seconds: Option<f64>,
    ) -> Result<String, McpError> {
        let entry = self
            .entry(server)
            .await
            .ok_or_else(|| McpError::NotConnected(server.to_string()))?;
        let client = {
            let guard = entry.lock().await;
            guard.client.clone().ok_or_else(|| McpError::NotConnected(server.to_string()))?
        };

        let resolved_args = self.secrets.resolve(args).await;
        let timeout = match timeout_seconds {
            None | Some(-1.0) => None,
            Some(t) if t > 0.0 => Some(Duration::from_secs_f64(t)),
            Some(_) => None,
        };
        client.call_tool(tool_name, resolved_args, timeout).await
    }

    pub async fn get_server_status(&self, name: &str) -> ServerStatus {
        match self.entry(name).await {
            None => ServerStatus::Initialization,
            Some(entry) => {
                let guard = entry.lock().await;
                match &guard.status {
                    ServerStatus::Error { message, .. } => {
                        let stderr_tail = guard
                            .client
                            .as_ref()
                            .and_then(|c| c.stderr.as_ref())
                            .map(|b| b.tail(20))
                            .unwrap_or_default();
                        ServerStatus::Error { message: message.clone(), stderr_tail }
                    }
                    other => other.clone(),
                }
            }
        }
    }

    /// Persists the merged config regardless of whether the follow-up
    /// (re)connect succeeds, per `spec.md` §4.4: "a broken config can still
    /// be stored so the user can fix it."
    pub async fn update_server_config(&self, name: &str, patch: McpServerConfigPatch) -> Result<(), McpError> {
        let mut configs = self.load_configs().await?;
        let Some(existing) = configs.iter_mut().find(|c| c.name == name) else {
            return Err(McpError::NotConnected(format!("no configured mcp server named {name}")));
        };
        let was_disabled = existing.disabled;
        let reconnect_required = existing.merge_patch(patch);
        let now_disabled = existing.disabled;
        self.save_configs(&configs).await?;

        if reconnect_required && self.entry(name).await.is_some() {
            let _ = self.disconnect_server(name).await;
        }
        if was_disabled && !now_disabled {
            let _ = self.connect_server(name).await;
        } else if !was_disabled && now_disabled {
            let _ = self.disconnect_server(name).await;
        } else if reconnect_required {
            let _ = self.connect_server(name).await;
        }
        Ok(())
    }

    pub async fn start_enabled_servers(&self) {
        let configs = self.load_configs().await.unwrap_or_default();
        for config in configs.into_iter().filter(|c| !c.disabled) {
            if let Err(e) = self.connect_server(&config.name).await {
                warn!(server = %config.name, error = %e, "failed to start enabled mcp server, continuing");
            }
        }
        self.startup_complete.store(true, Ordering::SeqCst);
    }

    pub fn startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::SeqCst)
    }
}

impl ToolCatalogSource for McpManager {
    fn ensure_connected<'a>(&'a self, server: &'a str) -> BoxFuture<'a, Result<(), PromptError>> {
        Box::pin(async move {
            self.connect_server(server).await.map_err(|e| PromptError::Mcp(e.to_string()))
        })
    }

    fn list_tools<'a>(&'a self, server: &'a str) -> BoxFuture<'a, Result<Vec<ToolDescriptor>, PromptError>> {
        Box::pin(async move {
            self.list_server_tools(server).await.map_err(|e| PromptError::Mcp(e.to_string()))
        })
    }
}

async fn connect_stdio(params: &StdioParams, extra_env: HashMap<String, String>) -> Result<McpClientHandle, McpError> {
    let stderr = Arc::new(StderrBuffer::new());
    let mut env = params.env.clone();
    env.extend(extra_env);

    let (command, prefix_args) = resolve_command(&params.command);
    let cmd = Command::new(&command).configure(|cmd| {
        for arg in &prefix_args {
            cmd.arg(arg);
        }
        for arg in &params.args {
            cmd.arg(arg);
        }
        for (k, v) in &env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stderr(std::process::Stdio::piped());
    });

    let mut transport = TokioChildProcess::new(cmd).map_err(|e| McpError::Connection(e.to_string()))?;
    if let Some(child_stderr) = transport.stderr() {
        spawn_stderr_reader(child_stderr, stderr.clone());
    }

    let service = ().serve(transport).await.map_err(|e| McpError::Connection(e.to_string()))?;
    Ok(McpClientHandle::stdio(service, stderr))
}

async fn connect_docker(server_name: &str, params: &DockerParams, extra_env: HashMap<String, String>) -> Result<McpClientHandle, McpError> {
    let container_name = format!("flujo_{server_name}_{}", short_uuid());
    DOCKER_CONTAINER_NAMES.lock().await.insert(server_name.to_string(), container_name.clone());

    let mut env = params.env.clone();
    env.extend(extra_env);

    match params.transport_method {
        DockerTransportMethod::Stdio => {
            let cmd = Command::new("docker").configure(|cmd| {
                cmd.arg("run").arg("-i").arg("--rm").arg("--name").arg(&container_name);
                if let Some(network) = &params.network {
                    cmd.arg("--network").arg(network);
                }
                for volume in &params.volumes {
                    cmd.arg("-v").arg(volume);
                }
                for (k, v) in &env {
                    cmd.arg("-e").arg(format!("{k}={v}"));
                }
                cmd.arg(&params.image);
                for arg in &params.args {
                    cmd.arg(arg);
                }
                cmd.stderr(std::process::Stdio::piped());
            });
            let stderr = Arc::new(StderrBuffer::new());
            let mut transport = TokioChildProcess::new(cmd).map_err(|e| McpError::Connection(e.to_string()))?;
            if let Some(child_stderr) = transport.stderr() {
                spawn_stderr_reader(child_stderr, stderr.clone());
            }
            let service = ().serve(transport).await.map_err(|e| McpError::Connection(e.to_string()))?;
            Ok(McpClientHandle::docker(service, stderr))
        }
        DockerTransportMethod::WebSocket => {
            let port = pick_ephemeral_port();
            let status = Command::new("docker")
                .arg("run")
                .arg("-d")
                .arg("--rm")
                .arg("--name")
                .arg(&container_name)
                .arg("-p")
                .arg(format!("{port}:{port}"))
                .args(env.iter().flat_map(|(k, v)| ["-e".to_string(), format!("{k}={v}")]))
                .arg(&params.image)
                .args(&params.args)
                .status()
                .await
                .map_err(|e| McpError::Connection(e.to_string()))?;
            if !status.success() {
                return Err(McpError::Connection(format!("docker run exited with {status}")));
            }
            let client = WsMcpClient::connect(&format!("ws://localhost:{port}")).await?;
            Ok(McpClientHandle::websocket(client))
        }
    }
}

async fn connect_sse(url: &str) -> Result<McpClientHandle, McpError> {
    let transport = SseClientTransport::start(url.to_string()).await.map_err(|e| McpError::Connection(e.to_string()))?;
    let service = client_info().serve(transport).await.map_err(|e| McpError::Connection(e.to_string()))?;
    Ok(McpClientHandle::sse(service))
}

async fn connect_streamable_http(url: &str) -> Result<McpClientHandle, McpError> {
    let transport = StreamableHttpClientTransport::from_uri(url.to_string());
    let service = client_info().serve(transport).await.map_err(|e| McpError::Connection(e.to_string()))?;
    Ok(McpClientHandle::streamable_http(service))
}

fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation { name: "flujo-engine".to_string(), version: env!("CARGO_PKG_VERSION").to_string() },
    }
}

fn spawn_stderr_reader(stderr: impl tokio::io::AsyncRead + Unpin + Send + 'static, buffer: Arc<StderrBuffer>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%line, "mcp server stderr");
            buffer.push(line);
        }
    });
}

/// On Windows, a `.bat` command must be run through `cmd.exe /c <command>`,
/// per `spec.md` §4.4's stdio transport note. Returns the program to spawn
/// and any arguments that must precede the configured `params.args`.
fn resolve_command(command: &str) -> (String, Vec<String>) {
    if cfg!(windows) && command.ends_with(".bat") {
        ("cmd.exe".to_string(), vec!["/c".to_string(), command.to_string()])
    } else {
        (command.to_string(), Vec::new())
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().to_string().chars().take(8).collect()
}

fn pick_ephemeral_port() -> u16 {
    49152 + (std::process::id() as u16 % 10000)
}

/// Enriches a connection-closed error with the diagnostics `spec.md` §4.4
/// asks for: resolved command path, its existence, the server directory's
/// existence, and the stderr tail.
pub fn diagnose(server: &str, configured_command: &str, cwd: Option<&str>, stderr_tail: Vec<String>, message: String) -> McpError {
    let resolved_path = cwd
        .map(|c| Path::new(c).join(configured_command))
        .unwrap_or_else(|| Path::new(configured_command).to_path_buf());
    let directory_exists = resolved_path.parent().map(Path::exists).unwrap_or(false);
    McpError::Diagnostic {
        server: server.to_string(),
        message,
        configured_command: configured_command.to_string(),
        path_exists: resolved_path.exists(),
        resolved_path: resolved_path.display().to_string(),
        directory_exists,
        stderr_tail,
    }
}
