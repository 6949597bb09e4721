//! One transport-agnostic connection to a tool server.
//!
//! The client keeps capability caches (`tools`, `prompts`, `resources`)
//! loaded concurrently at `start()`, and performs per-invocation calls with a
//! bounded retry policy. Each public call is an isolated logical session on
//! top of the long-lived transport, so a failed invocation never poisons the
//! connection state.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;

use super::config::ToolServerConfig;
use super::transport::{ToolTransport, TransportFactory};
use super::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::error::{CoreError, CoreResult};

/// Total attempts for a tool call, timeouts included.
const CALL_ATTEMPTS: u32 = 3;

/// Backoff unit between retries; scaled by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Default soft timeout for a stdio tool call.
const STDIO_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// SSE servers frequently front long-running tools; give them more room.
const SSE_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// A connection to one tool server plus its capability caches.
pub struct ToolClient {
    config: ToolServerConfig,
    factory: Arc<dyn TransportFactory>,
    transport: RwLock<Option<Arc<dyn ToolTransport>>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    prompts: RwLock<Vec<PromptDescriptor>>,
    resources: RwLock<Vec<ResourceDescriptor>>,
    last_error: Mutex<Option<String>>,
    call_timeout: Duration,
}

impl ToolClient {
    pub fn new(config: ToolServerConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let call_timeout = if config.is_stdio() {
            STDIO_CALL_TIMEOUT
        } else {
            SSE_CALL_TIMEOUT
        };
        Self {
            config,
            factory,
            transport: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            last_error: Mutex::new(None),
            call_timeout,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    /// Capability cache snapshots. Empty until `start()` has run; a failed
    /// load leaves the corresponding cache empty rather than poisoned.
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap().clone()
    }

    pub fn available_prompts(&self) -> Vec<PromptDescriptor> {
        self.prompts.read().unwrap().clone()
    }

    pub fn available_resources(&self) -> Vec<ResourceDescriptor> {
        self.resources.read().unwrap().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    fn record_error(&self, context: &str, err: &CoreError) {
        log::error!("[{}] {}: {}", self.config.name, context, err);
        *self.last_error.lock().unwrap() = Some(format!("{}: {}", context, err));
    }

    fn clear_error(&self) {
        *self.last_error.lock().unwrap() = None;
    }

    fn current_transport(&self) -> CoreResult<Arc<dyn ToolTransport>> {
        self.transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| CoreError::Transport(format!("server '{}' not started", self.config.name)))
    }

    /// Establish the transport and load the three capability caches
    /// concurrently. Handshake or list failures are captured in
    /// `last_error` and degrade the caches to empty; `start()` itself only
    /// reports, it never takes the process down.
    pub async fn start(&self) -> CoreResult<()> {
        match self.factory.connect(&self.config).await {
            Ok(transport) => {
                *self.transport.write().unwrap() = Some(transport);
                self.clear_error();
            }
            Err(err) => {
                self.record_error("connect failed", &err);
                *self.tools.write().unwrap() = Vec::new();
                *self.prompts.write().unwrap() = Vec::new();
                *self.resources.write().unwrap() = Vec::new();
                return Ok(());
            }
        }

        let transport = self.current_transport()?;
        let (tools, prompts, resources) = tokio::join!(
            transport.list_tools(),
            transport.list_prompts(),
            transport.list_resources(),
        );

        match tools {
            Ok(list) => {
                log::info!("[{}] loaded {} tools", self.config.name, list.len());
                *self.tools.write().unwrap() = list;
            }
            Err(err) => {
                self.record_error("listing tools failed", &err);
                *self.tools.write().unwrap() = Vec::new();
            }
        }
        match prompts {
            Ok(list) => {
                log::debug!("[{}] loaded {} prompts", self.config.name, list.len());
                *self.prompts.write().unwrap() = list;
            }
            Err(err) => {
                self.record_error("listing prompts failed", &err);
                *self.prompts.write().unwrap() = Vec::new();
            }
        }
        match resources {
            Ok(list) => {
                log::debug!("[{}] loaded {} resources", self.config.name, list.len());
                *self.resources.write().unwrap() = list;
            }
            Err(err) => {
                self.record_error("listing resources failed", &err);
                *self.resources.write().unwrap() = Vec::new();
            }
        }

        Ok(())
    }

    /// Release the transport and clear the caches.
    pub async fn stop(&self) {
        let transport = self.transport.write().unwrap().take();
        if let Some(transport) = transport {
            if let Err(err) = transport.shutdown().await {
                log::warn!("[{}] error during shutdown: {}", self.config.name, err);
            }
        }
        *self.tools.write().unwrap() = Vec::new();
        *self.prompts.write().unwrap() = Vec::new();
        *self.resources.write().unwrap() = Vec::new();
    }

    pub async fn restart(&self) -> CoreResult<()> {
        self.stop().await;
        self.start().await
    }

    /// Invoke a tool. Up to [`CALL_ATTEMPTS`] attempts total; only
    /// timeout-class failures are retried, with `0.5s × attempt` backoff.
    /// Exhausted retries yield a `{"error": ...}` JSON payload instead of an
    /// error so the caller can hand it straight back to the model.
    pub async fn call(&self, tool: &str, args: Value) -> Value {
        let mut attempts = 0u32;
        let mut last_err: Option<CoreError> = None;

        while attempts < CALL_ATTEMPTS {
            attempts += 1;
            let result = match self.current_transport() {
                Ok(transport) => {
                    match tokio::time::timeout(
                        self.call_timeout,
                        transport.call_tool(tool, args.clone()),
                    )
                    .await
                    {
                        Ok(inner) => inner,
                        Err(_elapsed) => Err(CoreError::Timeout(format!(
                            "tool '{}' exceeded {:?}",
                            tool, self.call_timeout
                        ))),
                    }
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(text) => return Self::parse_result_body(tool, &text),
                Err(err) if err.is_retryable() && attempts < CALL_ATTEMPTS => {
                    log::warn!(
                        "[{}] tool '{}' attempt {} timed out, retrying",
                        self.config.name,
                        tool,
                        attempts
                    );
                    last_err = Some(err);
                    tokio::time::sleep(RETRY_BACKOFF * attempts).await;
                }
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        log::error!(
            "[{}] tool '{}' call failed after {} attempts: {}",
            self.config.name,
            tool,
            attempts,
            message
        );
        serde_json::json!({ "error": format!("Tool call failed: {}", message) })
    }

    /// JSON-shaped bodies are parsed; anything else comes back as text, an
    /// empty body as `""`.
    fn parse_result_body(tool: &str, text: &str) -> Value {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            log::warn!("tool '{}' returned empty content", tool);
            return Value::String(String::new());
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            match serde_json::from_str(trimmed) {
                Ok(parsed) => return parsed,
                Err(err) => {
                    log::debug!("tool '{}' result is not valid JSON: {}", tool, err);
                }
            }
        }
        Value::String(text.to_string())
    }

    /// Render a named prompt on the server.
    pub async fn get_prompt(&self, name: &str, args: Value) -> CoreResult<String> {
        let transport = self.current_transport()?;
        tokio::time::timeout(self.call_timeout, transport.get_prompt(name, args))
            .await
            .map_err(|_| CoreError::Timeout(format!("prompt '{}' render timed out", name)))?
    }

    /// Read a resource body.
    pub async fn read_resource(&self, uri: &str) -> CoreResult<String> {
        let transport = self.current_transport()?;
        tokio::time::timeout(self.call_timeout, transport.read_resource(uri))
            .await
            .map_err(|_| CoreError::Timeout(format!("resource '{}' read timed out", uri)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport stub with scripted behavior per call.
    struct StubTransport {
        tools: Vec<ToolDescriptor>,
        call_result: Box<dyn Fn(u32) -> CoreResult<String> + Send + Sync>,
        calls: AtomicU32,
    }

    impl StubTransport {
        fn with_result(result: CoreResult<String>) -> Self {
            let stored = Mutex::new(Some(result));
            Self {
                tools: vec![ToolDescriptor {
                    name: "add".into(),
                    description: "adds".into(),
                    input_schema: json!({"type": "object"}),
                }],
                call_result: Box::new(move |_| {
                    stored
                        .lock()
                        .unwrap()
                        .take()
                        .unwrap_or(Ok(String::new()))
                }),
                calls: AtomicU32::new(0),
            }
        }

        fn always_timeout() -> Self {
            Self {
                tools: Vec::new(),
                call_result: Box::new(|_| Err(CoreError::Timeout("read timed out".into()))),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolTransport for StubTransport {
        async fn list_tools(&self) -> CoreResult<Vec<ToolDescriptor>> {
            Ok(self.tools.clone())
        }

        async fn list_prompts(&self) -> CoreResult<Vec<PromptDescriptor>> {
            Ok(Vec::new())
        }

        async fn list_resources(&self) -> CoreResult<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, _name: &str, _args: Value) -> CoreResult<String> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.call_result)(attempt)
        }

        async fn get_prompt(&self, _name: &str, _args: Value) -> CoreResult<String> {
            Ok("rendered".into())
        }

        async fn read_resource(&self, _uri: &str) -> CoreResult<String> {
            Ok("body".into())
        }

        async fn shutdown(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    struct StubFactory {
        transport: Option<Arc<StubTransport>>,
    }

    impl StubFactory {
        fn new(transport: StubTransport) -> Arc<Self> {
            Self::sharing(Arc::new(transport))
        }

        fn sharing(transport: Arc<StubTransport>) -> Arc<Self> {
            Arc::new(Self {
                transport: Some(transport),
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self { transport: None })
        }
    }

    #[async_trait]
    impl TransportFactory for StubFactory {
        async fn connect(&self, _config: &ToolServerConfig) -> CoreResult<Arc<dyn ToolTransport>> {
            self.transport
                .clone()
                .map(|t| t as Arc<dyn ToolTransport>)
                .ok_or_else(|| CoreError::Transport("connection refused".into()))
        }
    }

    fn stdio_config(name: &str) -> ToolServerConfig {
        ToolServerConfig {
            name: name.into(),
            transport: super::super::config::ServerTransportConfig::Stdio {
                command: "stub".into(),
                args: Vec::new(),
                env: Default::default(),
            },
            description: None,
        }
    }

    #[tokio::test]
    async fn start_loads_capability_caches() {
        let client = ToolClient::new(
            stdio_config("calc"),
            StubFactory::new(StubTransport::with_result(Ok("5".into()))),
        );
        client.start().await.unwrap();
        assert_eq!(client.available_tools().len(), 1);
        assert!(client.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_connect_leaves_empty_caches_without_failing() {
        let client = ToolClient::new(stdio_config("down"), StubFactory::refusing());
        client.start().await.unwrap();
        assert!(client.available_tools().is_empty());
        assert!(client.last_error().is_some());
    }

    #[tokio::test]
    async fn json_shaped_results_are_parsed() {
        let client = ToolClient::new(
            stdio_config("calc"),
            StubFactory::new(StubTransport::with_result(Ok(r#"{"sum": 5}"#.into()))),
        );
        client.start().await.unwrap();
        let result = client.call("add", json!({"a": 2, "b": 3})).await;
        assert_eq!(result["sum"], 5);
    }

    #[tokio::test]
    async fn plain_text_results_stay_text_and_empty_becomes_empty_string() {
        assert_eq!(
            ToolClient::parse_result_body("t", "forty two"),
            Value::String("forty two".into())
        );
        assert_eq!(
            ToolClient::parse_result_body("t", "  "),
            Value::String(String::new())
        );
        // JSON-shaped but invalid stays text
        assert_eq!(
            ToolClient::parse_result_body("t", "{nope"),
            Value::String("{nope".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhaustion_returns_json_error_after_three_attempts() {
        let transport = Arc::new(StubTransport::always_timeout());
        let client = ToolClient::new(stdio_config("slow"), StubFactory::sharing(transport.clone()));
        client.start().await.unwrap();

        let result = client.call("add", json!({})).await;
        let error = result["error"].as_str().unwrap();
        assert!(error.contains("Tool call failed"), "got: {}", error);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_timeout_errors_do_not_retry() {
        let transport = StubTransport {
            tools: Vec::new(),
            call_result: Box::new(|attempt| {
                assert_eq!(attempt, 1, "transport error must not be retried");
                Err(CoreError::Transport("connection reset".into()))
            }),
            calls: AtomicU32::new(0),
        };
        let client = ToolClient::new(stdio_config("flaky"), StubFactory::new(transport));
        client.start().await.unwrap();

        let result = client.call("add", json!({})).await;
        assert!(result["error"].as_str().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn stop_clears_caches() {
        let client = ToolClient::new(
            stdio_config("calc"),
            StubFactory::new(StubTransport::with_result(Ok("ok".into()))),
        );
        client.start().await.unwrap();
        assert!(!client.available_tools().is_empty());
        client.stop().await;
        assert!(client.available_tools().is_empty());
        // A call after stop reports the disconnect as a tool-result error.
        let result = client.call("add", json!({})).await;
        assert!(result.get("error").is_some());
    }
}
