//! Transport seam between [`super::ToolClient`] and the wire.
//!
//! `ToolTransport` is the minimal surface a tool server must offer once a
//! connection exists; `TransportFactory` opens connections from a
//! [`ToolServerConfig`]. The production implementation speaks MCP through
//! rmcp over a stdio child process or an SSE stream; tests substitute stubs.

use std::process::Stdio;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::HeaderValue;
use reqwest::header::HeaderMap;
use rmcp::{
    model::{
        CallToolRequestParam, ClientCapabilities, ClientInfo, GetPromptRequestParam,
        Implementation, ProtocolVersion, ReadResourceRequestParam,
    },
    service::{DynService, RunningService, ServerSink},
    transport::{sse_client::SseClientConfig, SseClientTransport},
    RoleClient, ServiceExt,
};
use serde_json::Value;
use tokio::sync::Mutex;
use which::which;

use super::config::{ServerTransportConfig, ToolServerConfig};
use super::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::error::{CoreError, CoreResult};

/// One live connection to a tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> CoreResult<Vec<ToolDescriptor>>;
    async fn list_prompts(&self) -> CoreResult<Vec<PromptDescriptor>>;
    async fn list_resources(&self) -> CoreResult<Vec<ResourceDescriptor>>;

    /// Invoke a tool and return the joined text content of the result.
    async fn call_tool(&self, name: &str, args: Value) -> CoreResult<String>;

    /// Render a named prompt and return the first message's text content.
    async fn get_prompt(&self, name: &str, args: Value) -> CoreResult<String>;

    /// Read a resource and return its concatenated text segments.
    async fn read_resource(&self, uri: &str) -> CoreResult<String>;

    /// Release the connection.
    async fn shutdown(&self) -> CoreResult<()>;
}

/// Opens transports for server configs. The broker goes through this seam so
/// reloads and tests can swap the wire implementation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> CoreResult<std::sync::Arc<dyn ToolTransport>>;
}

type RmcpService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

/// MCP transport over rmcp.
pub struct RmcpTransport {
    sink: ServerSink,
    service: Mutex<Option<RmcpService>>,
}

/// Factory producing [`RmcpTransport`] connections.
#[derive(Debug, Clone, Default)]
pub struct RmcpTransportFactory {
    pub client_name: String,
}

impl RmcpTransportFactory {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn client_info(&self) -> ClientInfo {
        ClientInfo::new(
            ClientCapabilities::default(),
            Implementation::new(
                if self.client_name.is_empty() {
                    env!("CARGO_PKG_NAME").to_string()
                } else {
                    self.client_name.clone()
                },
                env!("CARGO_PKG_VERSION"),
            ),
        )
        .with_protocol_version(ProtocolVersion::default())
    }
}

#[async_trait]
impl TransportFactory for RmcpTransportFactory {
    async fn connect(
        &self,
        config: &ToolServerConfig,
    ) -> CoreResult<std::sync::Arc<dyn ToolTransport>> {
        let client_info = self.client_info();
        let service: RmcpService = match &config.transport {
            ServerTransportConfig::Stdio { command, args, env } => {
                if which(command).is_err() && !std::path::Path::new(command).exists() {
                    return Err(CoreError::Transport(format!(
                        "command not found: {}",
                        command
                    )));
                }
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args)
                    .envs(env)
                    .stderr(Stdio::inherit())
                    .stdout(Stdio::piped())
                    .stdin(Stdio::piped());
                let transport = rmcp::transport::child_process::TokioChildProcess::new(cmd)
                    .map_err(|e| CoreError::Transport(e.to_string()))?;
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| CoreError::Transport(e.to_string()))?
            }
            ServerTransportConfig::Sse {
                url,
                headers,
                bearer_token,
            } => {
                let transport = if bearer_token.is_some() || !headers.is_empty() {
                    let mut default_headers = HeaderMap::new();
                    for (key, value) in headers {
                        let name: http::header::HeaderName = key
                            .parse()
                            .map_err(|_| {
                                CoreError::Validation(format!("invalid header name: {}", key))
                            })?;
                        default_headers.insert(
                            name,
                            HeaderValue::from_str(value).map_err(|e| {
                                CoreError::Validation(format!("invalid header value: {}", e))
                            })?,
                        );
                    }
                    if let Some(token) = bearer_token {
                        default_headers.insert(
                            AUTHORIZATION,
                            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                                CoreError::Validation(format!("invalid bearer token: {}", e))
                            })?,
                        );
                    }
                    let client = reqwest::ClientBuilder::new()
                        .default_headers(default_headers)
                        .build()
                        .map_err(|e| CoreError::Transport(e.to_string()))?;
                    SseClientTransport::start_with_client(
                        client,
                        SseClientConfig {
                            sse_endpoint: url.clone().into(),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| CoreError::Transport(e.to_string()))?
                } else {
                    SseClientTransport::start(url.as_str())
                        .await
                        .map_err(|e| CoreError::Transport(e.to_string()))?
                };
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .map_err(|e| CoreError::Transport(e.to_string()))?
            }
        };

        log::debug!(
            "connected to tool server '{}': {:?}",
            config.name,
            service.peer_info()
        );

        let sink = service.peer().clone();
        Ok(std::sync::Arc::new(RmcpTransport {
            sink,
            service: Mutex::new(Some(service)),
        }))
    }
}

fn transport_err(err: impl std::fmt::Display) -> CoreError {
    let text = err.to_string();
    if text.to_ascii_lowercase().contains("timeout") {
        CoreError::Timeout(text)
    } else {
        CoreError::Transport(text)
    }
}

fn args_to_object(args: Value) -> Option<serde_json::Map<String, Value>> {
    match args {
        Value::Object(map) => Some(map),
        Value::Null => None,
        other => {
            log::warn!("non-object tool arguments coerced to empty: {}", other);
            None
        }
    }
}

#[async_trait]
impl ToolTransport for RmcpTransport {
    async fn list_tools(&self) -> CoreResult<Vec<ToolDescriptor>> {
        let tools = self.sink.list_all_tools().await.map_err(transport_err)?;
        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.map(|d| d.into_owned()).unwrap_or_default(),
                input_schema: Value::Object(t.input_schema.as_ref().clone()),
            })
            .collect())
    }

    async fn list_prompts(&self) -> CoreResult<Vec<PromptDescriptor>> {
        let prompts = self.sink.list_all_prompts().await.map_err(transport_err)?;
        Ok(prompts
            .into_iter()
            .map(|p| PromptDescriptor {
                name: p.name.to_string(),
                description: p.description.map(|d| d.to_string()).unwrap_or_default(),
            })
            .collect())
    }

    async fn list_resources(&self) -> CoreResult<Vec<ResourceDescriptor>> {
        let resources = self
            .sink
            .list_all_resources()
            .await
            .map_err(transport_err)?;
        Ok(resources
            .into_iter()
            .map(|r| ResourceDescriptor {
                uri: r.uri.to_string(),
                name: r.name.to_string(),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> CoreResult<String> {
        let result = self
            .sink
            .call_tool({
                let mut params = CallToolRequestParam::new(name.to_string());
                if let Some(arguments) = args_to_object(args) {
                    params = params.with_arguments(arguments);
                }
                params
            })
            .await
            .map_err(transport_err)?;

        let texts: Vec<String> = result
            .content
            .iter()
            .filter_map(|item| item.as_text().map(|t| t.text.clone()))
            .collect();
        Ok(texts.join("\n"))
    }

    async fn get_prompt(&self, name: &str, args: Value) -> CoreResult<String> {
        let result = self
            .sink
            .get_prompt({
                let mut params = GetPromptRequestParam::new(name.to_string());
                if let Some(arguments) = args_to_object(args) {
                    params = params.with_arguments(arguments);
                }
                params
            })
            .await
            .map_err(transport_err)?;

        let first = result
            .messages
            .first()
            .ok_or_else(|| CoreError::NotFound(format!("prompt '{}' rendered no messages", name)))?;
        match &first.content {
            rmcp::model::PromptMessageContent::Text { text } => Ok(text.clone()),
            other => Ok(serde_json::to_string(other)?),
        }
    }

    async fn read_resource(&self, uri: &str) -> CoreResult<String> {
        let result = self
            .sink
            .read_resource(ReadResourceRequestParam::new(uri.to_string()))
            .await
            .map_err(transport_err)?;

        let segments: Vec<String> = result
            .contents
            .iter()
            .filter_map(|item| match item {
                rmcp::model::ResourceContents::TextResourceContents { text, .. } => {
                    Some(text.clone())
                }
                _ => None,
            })
            .collect();
        Ok(segments.join("\n"))
    }

    async fn shutdown(&self) -> CoreResult<()> {
        if let Some(service) = self.service.lock().await.take() {
            service
                .cancel()
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))?;
        }
        Ok(())
    }
}
