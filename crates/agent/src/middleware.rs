//! Middleware chains around the conversation runtime.
//!
//! Three independent pipelines: message-in, tool-call and response-out. A
//! middleware that sets a `modified_*` value supersedes the original for
//! everything downstream. A failing middleware is logged and skipped; a
//! guard that wants to block a tool call does so by planting a result, not
//! by erroring.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use vigil::error::CoreResult;
use vigil::mcp::ToolBroker;

/// Context for the message-in chain.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub chat_id: String,
    pub message: String,
    pub modified_message: Option<String>,
    /// When set, the orchestrator skips the model and answers with
    /// `response` directly.
    pub skip_model: bool,
    pub response: Option<String>,
}

impl MessageContext {
    pub fn new(chat_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message: message.into(),
            modified_message: None,
            skip_model: false,
            response: None,
        }
    }

    pub fn effective_message(&self) -> &str {
        self.modified_message.as_deref().unwrap_or(&self.message)
    }
}

/// Context for the tool-call chain. `tool_name` is the original (server)
/// name, already translated from the model's sanitized alias.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub tool_name: String,
    pub tool_args: Value,
    pub modified_args: Option<Value>,
    /// A planted result vetoes the call: the orchestrator feeds it back to
    /// the model instead of dispatching to the broker.
    pub result: Option<Value>,
}

impl ToolCallContext {
    pub fn new(tool_name: impl Into<String>, tool_args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args,
            modified_args: None,
            result: None,
        }
    }

    pub fn effective_args(&self) -> &Value {
        self.modified_args.as_ref().unwrap_or(&self.tool_args)
    }

    pub fn is_vetoed(&self) -> bool {
        self.result.is_some()
    }
}

/// Context for the response-out chain.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub user_message: String,
    pub response: String,
    pub modified_response: Option<String>,
}

impl ResponseContext {
    pub fn new(user_message: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            response: response.into(),
            modified_response: None,
        }
    }

    pub fn effective_response(&self) -> &str {
        self.modified_response.as_deref().unwrap_or(&self.response)
    }
}

#[async_trait]
pub trait MessageMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, ctx: &mut MessageContext, broker: &ToolBroker) -> CoreResult<()>;
}

#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, ctx: &mut ToolCallContext, broker: &ToolBroker) -> CoreResult<()>;
}

#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, ctx: &mut ResponseContext, broker: &ToolBroker) -> CoreResult<()>;
}

/// The three chains, executed in registration order.
#[derive(Clone, Default)]
pub struct MiddlewareSet {
    message: Vec<Arc<dyn MessageMiddleware>>,
    tool: Vec<Arc<dyn ToolMiddleware>>,
    response: Vec<Arc<dyn ResponseMiddleware>>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message<M: MessageMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.message.push(Arc::new(middleware));
        self
    }

    pub fn with_tool<M: ToolMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.tool.push(Arc::new(middleware));
        self
    }

    pub fn with_response<M: ResponseMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.response.push(Arc::new(middleware));
        self
    }

    pub async fn run_message(&self, ctx: &mut MessageContext, broker: &ToolBroker) {
        for middleware in &self.message {
            if let Err(err) = middleware.handle(ctx, broker).await {
                log::error!("message middleware '{}' failed: {}", middleware.name(), err);
            }
            if ctx.skip_model {
                break;
            }
        }
    }

    pub async fn run_tool(&self, ctx: &mut ToolCallContext, broker: &ToolBroker) {
        for middleware in &self.tool {
            if let Err(err) = middleware.handle(ctx, broker).await {
                log::error!("tool middleware '{}' failed: {}", middleware.name(), err);
            }
            if ctx.is_vetoed() {
                break;
            }
        }
    }

    pub async fn run_response(&self, ctx: &mut ResponseContext, broker: &ToolBroker) {
        for middleware in &self.response {
            if let Err(err) = middleware.handle(ctx, broker).await {
                log::error!("response middleware '{}' failed: {}", middleware.name(), err);
            }
        }
    }
}

/// Expands `/name <args>` into the server-rendered prompt of that name.
/// Unknown commands leave the message untouched.
pub struct CommandPromptMiddleware;

#[async_trait]
impl MessageMiddleware for CommandPromptMiddleware {
    fn name(&self) -> &'static str {
        "command_prompt"
    }

    async fn handle(&self, ctx: &mut MessageContext, broker: &ToolBroker) -> CoreResult<()> {
        let message = ctx.effective_message().trim().to_string();
        let Some(rest) = message.strip_prefix('/') else {
            return Ok(());
        };
        let (command, args) = match rest.split_once(char::is_whitespace) {
            Some((command, args)) => (command.to_string(), args.trim().to_string()),
            None => (rest.to_string(), String::new()),
        };
        if command.is_empty() {
            return Ok(());
        }

        match broker.get_prompt(&command, json!({ "input": args })).await {
            Ok(rendered) => {
                log::info!("expanded /{} into a {}-char prompt", command, rendered.len());
                ctx.modified_message = Some(rendered);
            }
            Err(err) => {
                log::debug!("no prompt for /{}: {}", command, err);
            }
        }
        Ok(())
    }
}

/// Fetches `@<uri>` references and appends their bodies to the message as
/// `[Resource: uri]` blocks. Fetch failures append an error note instead.
pub struct ResourceFetchingMiddleware;

#[async_trait]
impl MessageMiddleware for ResourceFetchingMiddleware {
    fn name(&self) -> &'static str {
        "resource_fetching"
    }

    async fn handle(&self, ctx: &mut MessageContext, broker: &ToolBroker) -> CoreResult<()> {
        let re = Regex::new(r"@([a-zA-Z][a-zA-Z0-9+.-]*://\S+)").expect("resource regex is valid");
        let message = ctx.effective_message().to_string();
        let uris: Vec<String> = re
            .captures_iter(&message)
            .map(|caps| caps[1].to_string())
            .collect();
        if uris.is_empty() {
            return Ok(());
        }

        let mut expanded = message;
        for uri in uris {
            match broker.read_resource(&uri).await {
                Ok(body) => {
                    expanded.push_str(&format!("\n\n[Resource: {}]\n{}", uri, body));
                }
                Err(err) => {
                    log::warn!("failed to fetch resource '{}': {}", uri, err);
                    expanded.push_str(&format!("\n\n[Resource: {} — unavailable: {}]", uri, err));
                }
            }
        }
        ctx.modified_message = Some(expanded);
        Ok(())
    }
}

/// Configuration of the self-modification guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Branches on which source writes are blocked.
    pub protected_branches: Vec<String>,
    /// Path prefixes considered "own source".
    pub source_paths: Vec<String>,
    /// Tool used to query the current VCS branch; expected to return the
    /// branch name as text or `{"branch": ...}`.
    pub branch_tool: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            protected_branches: vec!["main".to_string()],
            source_paths: vec!["src/".to_string(), "crates/".to_string()],
            branch_tool: "git_current_branch".to_string(),
        }
    }
}

/// Blocks tool calls that write into the agent's own source tree while the
/// working branch is protected. Branch lookup failures fail open: a broken
/// VCS tool must not wedge every write.
pub struct SelfModificationGuard {
    config: GuardConfig,
}

impl SelfModificationGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    fn is_write_tool(name: &str) -> bool {
        let lowered = name.to_ascii_lowercase();
        ["write", "edit", "delete", "move", "patch"]
            .iter()
            .any(|verb| lowered.contains(verb))
    }

    fn touched_source_path(&self, args: &Value) -> Option<String> {
        let candidates = ["path", "file_path", "filename", "target", "destination"];
        let obj = args.as_object()?;
        for key in candidates {
            if let Some(path) = obj.get(key).and_then(Value::as_str) {
                let normalized = path.trim_start_matches("./");
                if self
                    .config
                    .source_paths
                    .iter()
                    .any(|prefix| normalized.starts_with(prefix.as_str()))
                {
                    return Some(path.to_string());
                }
            }
        }
        None
    }

    fn parse_branch(result: &Value) -> Option<String> {
        match result {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => obj
                .get("branch")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            _ => None,
        }
    }
}

#[async_trait]
impl ToolMiddleware for SelfModificationGuard {
    fn name(&self) -> &'static str {
        "self_modification_guard"
    }

    async fn handle(&self, ctx: &mut ToolCallContext, broker: &ToolBroker) -> CoreResult<()> {
        if !Self::is_write_tool(&ctx.tool_name) {
            return Ok(());
        }
        let Some(path) = self.touched_source_path(ctx.effective_args()) else {
            return Ok(());
        };

        let branch_result = broker.call(&self.config.branch_tool, json!({})).await;
        let Some(branch) = Self::parse_branch(&branch_result) else {
            log::warn!(
                "self-modification guard could not determine branch, allowing write to '{}'",
                path
            );
            return Ok(());
        };

        if self.config.protected_branches.contains(&branch) {
            log::warn!(
                "blocked '{}' write to '{}' on protected branch '{}'",
                ctx.tool_name,
                path,
                branch
            );
            ctx.result = Some(json!({
                "error": format!(
                    "Blocked: writing to source path '{}' is not allowed on protected branch '{}'",
                    path, branch
                )
            }));
        }
        Ok(())
    }
}
