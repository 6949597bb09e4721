//! Shared stubs for exercising the runtime without real models or servers.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use vigil::chat::{ChatMessage, Tool};
use vigil::error::{CoreError, CoreResult};
use vigil::mcp::config::{FleetConfig, ServerTransportConfig, ToolServerConfig};
use vigil::mcp::transport::{ToolTransport, TransportFactory};
use vigil::mcp::{PromptDescriptor, ResourceDescriptor, ToolBroker, ToolDescriptor};
use vigil::provider::{ChatSession, ModelProvider, ProviderInput, ProviderResponse};
use vigil::{ToolCall, Usage};

/// A provider that answers from a prepared script of responses, recording
/// every input it receives.
pub struct ScriptedProvider {
    model: String,
    context_window: u64,
    script: Mutex<VecDeque<ProviderResponse>>,
    fail_with: Option<String>,
    pub sent: Mutex<Vec<ProviderInput>>,
    pub bound_tools: Mutex<Vec<Tool>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            model: "scripted-model".to_string(),
            context_window: 1_000_000,
            script: Mutex::new(responses.into()),
            fail_with: None,
            sent: Mutex::new(Vec::new()),
            bound_tools: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose every request fails with a model error.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = window;
        self
    }

    pub fn text_response(text: &str) -> ProviderResponse {
        ProviderResponse {
            text: Some(text.to_string()),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                cached_tokens: None,
            }),
            ..Default::default()
        }
    }

    pub fn tool_call_response(name: &str, args: Value) -> ProviderResponse {
        ProviderResponse {
            tool_calls: vec![ToolCall {
                id: format!("call-{}", name),
                name: name.to_string(),
                arguments: args.to_string(),
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    fn bind_tools(&self, tools: Vec<Tool>) {
        *self.bound_tools.lock() = tools;
    }

    async fn send(
        &self,
        session: &mut ChatSession,
        input: ProviderInput,
    ) -> CoreResult<ProviderResponse> {
        if let Some(message) = &self.fail_with {
            return Err(CoreError::Model(message.clone()));
        }
        match &input {
            ProviderInput::Text(text) => {
                session.push(ChatMessage::user().content(text.clone()).build())
            }
            ProviderInput::ToolResults(outcomes) => session.push(
                ChatMessage::user()
                    .tool_result(outcomes.clone())
                    .build(),
            ),
        }
        self.sent.lock().push(input);

        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::text_response("(script exhausted)"));
        if let Some(text) = &response.text {
            session.push(ChatMessage::model().content(text.clone()).build());
        }
        Ok(response)
    }
}

/// Echoes `"hello " + input`; the simplest possible turn driver.
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn model(&self) -> &str {
        "echo-model"
    }

    fn context_window(&self) -> u64 {
        1_000_000
    }

    fn bind_tools(&self, _tools: Vec<Tool>) {}

    async fn send(
        &self,
        session: &mut ChatSession,
        input: ProviderInput,
    ) -> CoreResult<ProviderResponse> {
        let text = match &input {
            ProviderInput::Text(text) => format!("hello {}", text),
            ProviderInput::ToolResults(_) => "hello tools".to_string(),
        };
        if let ProviderInput::Text(original) = &input {
            session.push(ChatMessage::user().content(original.clone()).build());
        }
        session.push(ChatMessage::model().content(text.clone()).build());
        Ok(ProviderResponse {
            text: Some(text),
            ..Default::default()
        })
    }
}

/// One capability served by the stub tool server.
#[derive(Debug, Clone)]
pub enum StubTool {
    Tool { name: String, result: String },
    Prompt { name: String, rendered: String },
    Resource { uri: String, body: String },
}

impl StubTool {
    pub fn tool(name: &str, result: &str) -> Self {
        StubTool::Tool {
            name: name.to_string(),
            result: result.to_string(),
        }
    }

    pub fn prompt(name: &str, rendered: &str) -> Self {
        StubTool::Prompt {
            name: name.to_string(),
            rendered: rendered.to_string(),
        }
    }

    pub fn resource(uri: &str, body: &str) -> Self {
        StubTool::Resource {
            uri: uri.to_string(),
            body: body.to_string(),
        }
    }
}

struct StubServerTransport {
    items: Vec<StubTool>,
    pub calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ToolTransport for StubServerTransport {
    async fn list_tools(&self) -> CoreResult<Vec<ToolDescriptor>> {
        Ok(self
            .items
            .iter()
            .filter_map(|item| match item {
                StubTool::Tool { name, .. } => Some(ToolDescriptor {
                    name: name.clone(),
                    description: String::new(),
                    input_schema: json!({"type": "object"}),
                }),
                _ => None,
            })
            .collect())
    }

    async fn list_prompts(&self) -> CoreResult<Vec<PromptDescriptor>> {
        Ok(self
            .items
            .iter()
            .filter_map(|item| match item {
                StubTool::Prompt { name, .. } => Some(PromptDescriptor {
                    name: name.clone(),
                    description: String::new(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn list_resources(&self) -> CoreResult<Vec<ResourceDescriptor>> {
        Ok(self
            .items
            .iter()
            .filter_map(|item| match item {
                StubTool::Resource { uri, .. } => Some(ResourceDescriptor {
                    uri: uri.clone(),
                    name: String::new(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> CoreResult<String> {
        self.calls.lock().push((name.to_string(), args));
        self.items
            .iter()
            .find_map(|item| match item {
                StubTool::Tool { name: n, result } if n == name => Some(result.clone()),
                _ => None,
            })
            .ok_or_else(|| CoreError::NotFound(format!("tool '{}' not served", name)))
    }

    async fn get_prompt(&self, name: &str, _args: Value) -> CoreResult<String> {
        self.items
            .iter()
            .find_map(|item| match item {
                StubTool::Prompt { name: n, rendered } if n == name => Some(rendered.clone()),
                _ => None,
            })
            .ok_or_else(|| CoreError::NotFound(format!("prompt '{}' not served", name)))
    }

    async fn read_resource(&self, uri: &str) -> CoreResult<String> {
        self.items
            .iter()
            .find_map(|item| match item {
                StubTool::Resource { uri: u, body } if u == uri => Some(body.clone()),
                _ => None,
            })
            .ok_or_else(|| CoreError::NotFound(format!("resource '{}' not served", uri)))
    }

    async fn shutdown(&self) -> CoreResult<()> {
        Ok(())
    }
}

struct StubServerFactory {
    items: Vec<StubTool>,
}

#[async_trait]
impl TransportFactory for StubServerFactory {
    async fn connect(&self, _config: &ToolServerConfig) -> CoreResult<Arc<dyn ToolTransport>> {
        Ok(Arc::new(StubServerTransport {
            items: self.items.clone(),
            calls: Mutex::new(Vec::new()),
        }))
    }
}

/// A broker over one stub server exposing the given capabilities.
pub async fn stub_broker(items: Vec<StubTool>) -> ToolBroker {
    let config = FleetConfig {
        servers: vec![ToolServerConfig {
            name: "stub".to_string(),
            transport: ServerTransportConfig::Stdio {
                command: "stub".to_string(),
                args: Vec::new(),
                env: Default::default(),
            },
            description: None,
        }],
    };
    let broker = ToolBroker::new(config, Arc::new(StubServerFactory { items }));
    broker.ensure_fresh().await;
    broker
}

/// A factory whose transports always time out on calls; used to drive the
/// retry-exhaustion path end to end.
pub struct TimingOutFactory;

struct TimingOutTransport;

#[async_trait]
impl ToolTransport for TimingOutTransport {
    async fn list_tools(&self) -> CoreResult<Vec<ToolDescriptor>> {
        Ok(vec![ToolDescriptor {
            name: "add".to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn list_prompts(&self) -> CoreResult<Vec<PromptDescriptor>> {
        Ok(Vec::new())
    }

    async fn list_resources(&self) -> CoreResult<Vec<ResourceDescriptor>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, _name: &str, _args: Value) -> CoreResult<String> {
        Err(CoreError::Timeout("read timed out".to_string()))
    }

    async fn get_prompt(&self, _name: &str, _args: Value) -> CoreResult<String> {
        Err(CoreError::Timeout("read timed out".to_string()))
    }

    async fn read_resource(&self, _uri: &str) -> CoreResult<String> {
        Err(CoreError::Timeout("read timed out".to_string()))
    }

    async fn shutdown(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for TimingOutFactory {
    async fn connect(&self, _config: &ToolServerConfig) -> CoreResult<Arc<dyn ToolTransport>> {
        Ok(Arc::new(TimingOutTransport))
    }
}

/// A broker whose single server always times out tool calls.
pub async fn timing_out_broker() -> ToolBroker {
    let config = FleetConfig {
        servers: vec![ToolServerConfig {
            name: "slow".to_string(),
            transport: ServerTransportConfig::Stdio {
                command: "stub".to_string(),
                args: Vec::new(),
                env: Default::default(),
            },
            description: None,
        }],
    };
    let broker = ToolBroker::new(config, Arc::new(TimingOutFactory));
    broker.ensure_fresh().await;
    broker
}
