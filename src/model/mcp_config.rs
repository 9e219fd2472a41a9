use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StdioParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DockerTransportMethod {
    #[default]
    Stdio,
    WebSocket,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DockerParams {
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub transport_method: DockerTransportMethod,
}

/// The five transports an MCP server config may declare, per `spec.md` §4.4.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McpTransport {
    Stdio(StdioParams),
    WebSocket { url: String },
    StreamableHttp { url: String },
    HttpSse { url: String },
    Docker(DockerParams),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpServerConfig {
    /// Unique key; only one live client exists per name at any moment.
    pub name: String,
    pub transport: McpTransport,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auto_approve: Vec<String>,
}

impl McpServerConfig {
    /// Merge a partial patch (as produced by `updateServerConfig`) into this
    /// config, returning whether the transport kind or its connection
    /// parameters changed in a way that requires recreating the client.
    pub fn merge_patch(&mut self, patch: McpServerConfigPatch) -> bool {
        let mut reconnect_required = false;

        if let Some(transport) = patch.transport {
            if !transport_same_connection(&self.transport, &transport) {
                reconnect_required = true;
            }
            self.transport = transport;
        }
        if let Some(disabled) = patch.disabled {
            if disabled != self.disabled {
                reconnect_required = true;
            }
            self.disabled = disabled;
        }
        if let Some(auto_approve) = patch.auto_approve {
            self.auto_approve = auto_approve;
        }

        reconnect_required
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct McpServerConfigPatch {
    #[serde(default)]
    pub transport: Option<McpTransport>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub auto_approve: Option<Vec<String>>,
}

fn transport_same_connection(a: &McpTransport, b: &McpTransport) -> bool {
    match (a, b) {
        (McpTransport::Stdio(p1), McpTransport::Stdio(p2)) => {
            p1.command == p2.command && p1.args == p2.args && p1.env == p2.env && p1.cwd == p2.cwd
        }
        (McpTransport::WebSocket { url: u1 }, McpTransport::WebSocket { url: u2 }) => u1 == u2,
        (McpTransport::StreamableHttp { url: u1 }, McpTransport::StreamableHttp { url: u2 }) => {
            u1 == u2
        }
        (McpTransport::HttpSse { url: u1 }, McpTransport::HttpSse { url: u2 }) => u1 == u2,
        (McpTransport::Docker(p1), McpTransport::Docker(p2)) => {
            p1.image == p2.image && p1.args == p2.args && p1.volumes == p2.volumes
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patching_only_auto_approve_does_not_require_reconnect() {
        let mut cfg = McpServerConfig {
            name: "srv".into(),
            transport: McpTransport::Stdio(StdioParams {
                command: "echo-server".into(),
                ..Default::default()
            }),
            disabled: false,
            auto_approve: vec![],
        };
        let reconnect = cfg.merge_patch(McpServerConfigPatch {
            auto_approve: Some(vec!["echo".into()]),
            ..Default::default()
        });
        assert!(!reconnect);
        assert_eq!(cfg.auto_approve, vec!["echo".to_string()]);
    }

    #[test]
    fn patching_command_requires_reconnect() {
        let mut cfg = McpServerConfig {
            name: "srv".into(),
            transport: McpTransport::Stdio(StdioParams {
                command: "old-command".into(),
                ..Default::default()
            }),
            disabled: false,
            auto_approve: vec![],
        };
        let reconnect = cfg.merge_patch(McpServerConfigPatch {
            transport: Some(McpTransport::Stdio(StdioParams {
                command: "new-command".into(),
                ..Default::default()
            })),
            ..Default::default()
        });
        assert!(reconnect);
    }

    #[test]
    fn disabled_flip_requires_reconnect() {
        let mut cfg = McpServerConfig {
            name: "srv".into(),
            transport: McpTransport::WebSocket { url: "ws://x".into() },
            disabled: true,
            auto_approve: vec![],
        };
        let reconnect = cfg.merge_patch(McpServerConfigPatch {
            disabled: Some(false),
            ..Default::default()
        });
        assert!(reconnect);
        assert!(!cfg.disabled);
    }
}
