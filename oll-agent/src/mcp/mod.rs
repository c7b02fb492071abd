use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation, PaginatedRequestParam,
    ProtocolVersion,
};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::tools::expand_vars;

const CLIENT_NAME: &str = "oll/mcp";

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    StreamableHttp,
    Stdio,
}

/// How to reach one tool server. The contained string is the server key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerSpec {
    Streamable(String),
    Stdio(String),
}

impl ServerSpec {
    pub fn key(&self) -> &str {
        match self {
            ServerSpec::Streamable(url) => url,
            ServerSpec::Stdio(cmdline) => cmdline,
        }
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            ServerSpec::Streamable(_) => TransportKind::StreamableHttp,
            ServerSpec::Stdio(_) => TransportKind::Stdio,
        }
    }

    pub fn redacted(&self) -> String {
        redact(self.transport(), self.key())
    }
}

/// Strips secrets from a server key: query strings from URLs, arguments from
/// command lines.
pub fn redact(transport: TransportKind, key: &str) -> String {
    match transport {
        TransportKind::StreamableHttp => key.split('?').next().unwrap_or_default().to_string(),
        TransportKind::Stdio => match parse_command_line(key) {
            Ok((command, _)) => command,
            Err(_) => key.split_whitespace().next().unwrap_or_default().to_string(),
        },
    }
}

pub fn parse_command_line(cmdline: &str) -> Result<(String, Vec<String>), MCPError> {
    let mut parts = shlex::split(cmdline)
        .ok_or_else(|| MCPError::InvalidCommandLine("unbalanced quotes".to_string()))?
        .into_iter();
    let command = parts
        .next()
        .ok_or_else(|| MCPError::InvalidCommandLine("no command was given".to_string()))?;
    Ok((command, parts.collect()))
}

// `~` and `$VAR` expand over the whole line before it is split.
fn stdio_command(cmdline: &str) -> Result<(String, Vec<String>), MCPError> {
    parse_command_line(&expand_vars(cmdline))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub destructive: Option<bool>,
}

#[derive(Debug, Error)]
pub enum MCPError {
    #[error("failed to connect to MCP server '{server}': {reason}")]
    ConnectionFailed { server: String, reason: String },
    #[error("failed to fetch tools from '{server}': {reason}")]
    ListToolsFailed { server: String, reason: String },
    #[error("failed to call MCP tool '{tool}' from '{server}': {reason}")]
    ToolCallFailed {
        server: String,
        tool: String,
        reason: String,
    },
    #[error("input schema of tool '{tool}' is not an object schema: {reason}")]
    InvalidSchema { tool: String, reason: String },
    #[error("invalid command line: {0}")]
    InvalidCommandLine(String),
    #[error("session for '{0}' is already closed")]
    SessionClosed(String),
}

#[async_trait]
pub trait ToolSession: Send + Sync {
    fn server_key(&self) -> &str;

    fn transport(&self) -> TransportKind;

    fn redacted_key(&self) -> String {
        redact(self.transport(), self.server_key())
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, MCPError>;

    /// Returns the content of the call result.
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, MCPError>;

    /// Closing more than once is a no-op.
    async fn close(&self);
}

pub struct RmcpSession {
    server_key: String,
    transport: TransportKind,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ClientInfo>>>,
}

fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: CLIENT_NAME.to_string(),
            title: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            icons: None,
            website_url: None,
        },
    }
}

impl RmcpSession {
    async fn connect(spec: &ServerSpec, http: &reqwest::Client) -> Result<Self, MCPError> {
        let failed = |reason: String| MCPError::ConnectionFailed {
            server: spec.redacted(),
            reason,
        };

        let service = match spec {
            ServerSpec::Streamable(url) => {
                let transport = StreamableHttpClientTransport::with_client(
                    http.clone(),
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                );
                client_info()
                    .serve(transport)
                    .await
                    .map_err(|e| failed(e.to_string()))?
            }
            ServerSpec::Stdio(cmdline) => {
                let (command, args) = stdio_command(cmdline)?;
                let mut command = tokio::process::Command::new(command);
                command.args(args);

                let transport = TokioChildProcess::new(command).map_err(|e| failed(e.to_string()))?;
                client_info()
                    .serve(transport)
                    .await
                    .map_err(|e| failed(e.to_string()))?
            }
        };

        Ok(Self {
            server_key: spec.key().to_string(),
            transport: spec.transport(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        })
    }
}

#[async_trait]
impl ToolSession for RmcpSession {
    fn server_key(&self) -> &str {
        &self.server_key
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, MCPError> {
        let mut tools = Vec::new();
        let mut cursor = None;

        loop {
            let listed = self
                .peer
                .list_tools(Some(PaginatedRequestParam { cursor }))
                .await
                .map_err(|e| MCPError::ListToolsFailed {
                    server: self.redacted_key(),
                    reason: e.to_string(),
                })?;

            tools.extend(listed.tools.into_iter().map(|tool| RemoteTool {
                name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object((*tool.input_schema).clone()),
                destructive: tool.annotations.as_ref().and_then(|a| a.destructive_hint),
            }));

            match listed.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, MCPError> {
        let failed = |reason: String| MCPError::ToolCallFailed {
            server: self.redacted_key(),
            tool: name.to_string(),
            reason,
        };

        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| failed(e.to_string()))?;

        if result.is_error == Some(true) {
            tracing::warn!(tool = name, server = %self.redacted_key(), "tool reported an error result");
        }

        serde_json::to_value(&result.content).map_err(|e| failed(e.to_string()))
    }

    async fn close(&self) {
        let service = match self.service.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(service) = service {
            tracing::debug!(server = %self.redacted_key(), "closing MCP session");
            if let Err(e) = service.cancel().await {
                tracing::warn!(server = %self.redacted_key(), "failed to close MCP session: {}", e);
            }
        }
    }
}

/// Input schemas must be JSON objects describing an object; a missing `type`
/// is filled in.
pub fn normalize_schema(tool: &str, schema: Value) -> Result<Value, MCPError> {
    let invalid = |reason: String| MCPError::InvalidSchema {
        tool: tool.to_string(),
        reason,
    };

    let mut schema = match schema {
        Value::Object(map) => map,
        other => return Err(invalid(format!("expected an object, got `{}`", other))),
    };

    match schema.get("type") {
        None => {
            schema.insert("type".to_string(), Value::String("object".to_string()));
        }
        Some(Value::String(kind)) if kind == "object" => {}
        Some(other) => return Err(invalid(format!("unsupported type `{}`", other))),
    }

    Ok(Value::Object(schema))
}

/// Owns every tool-server session of one run.
pub struct McpSessionManager {
    http: reqwest::Client,
    sessions: Vec<Arc<dyn ToolSession>>,
}

impl McpSessionManager {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(KEEP_ALIVE)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("failed to create HTTP client for MCP, using default config: {}", e);
                reqwest::Client::new()
            });

        Self {
            http,
            sessions: Vec::new(),
        }
    }

    pub fn session(&self, server_key: &str) -> Option<Arc<dyn ToolSession>> {
        self.sessions
            .iter()
            .find(|s| s.server_key() == server_key)
            .map(Arc::clone)
    }

    /// Opens a session, or returns the one already opened for the same server.
    pub async fn connect(&mut self, spec: &ServerSpec) -> Result<Arc<dyn ToolSession>, MCPError> {
        if let Some(existing) = self.session(spec.key()) {
            return Ok(existing);
        }

        tracing::info!(server = %spec.redacted(), "connecting to MCP server");
        let session: Arc<dyn ToolSession> = Arc::new(RmcpSession::connect(spec, &self.http).await?);
        self.sessions.push(Arc::clone(&session));
        Ok(session)
    }

    pub fn adopt(&mut self, session: Arc<dyn ToolSession>) -> Arc<dyn ToolSession> {
        if let Some(existing) = self.session(session.server_key()) {
            return existing;
        }
        self.sessions.push(Arc::clone(&session));
        session
    }

    pub async fn list_tools(&self, session: &dyn ToolSession) -> Result<Vec<RemoteTool>, MCPError> {
        let tools = session.list_tools().await?;
        tracing::debug!(server = %session.redacted_key(), count = tools.len(), "listed MCP tools");

        tools
            .into_iter()
            .map(|tool| {
                let input_schema = normalize_schema(&tool.name, tool.input_schema)?;
                Ok(RemoteTool { input_schema, ..tool })
            })
            .collect()
    }

    pub fn sessions(&self) -> &[Arc<dyn ToolSession>] {
        &self.sessions
    }

    pub async fn close_all(&mut self) {
        for session in self.sessions.drain(..) {
            session.close().await;
        }
    }
}

impl Default for McpSessionManager {
    fn default() -> Self {
        Self::new()
    }
}
