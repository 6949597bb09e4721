//! Model provider abstraction.
//!
//! A [`ModelProvider`] hides one LLM family behind a uniform surface: it
//! opens a [`ChatSession`] seeded with system prompts and history, accepts
//! one input per turn step and yields a [`ProviderResponse`] that either
//! carries final text or tool calls to execute. Wire protocols live in
//! concrete implementations outside this crate; the runtime only ever sees
//! this trait.

mod context_window;
mod schema;

pub use context_window::{context_window_for, DEFAULT_CONTEXT_WINDOW};
pub use schema::{prepare_tools, sanitize_tool_name, transform_schema, NameMap};

use async_trait::async_trait;

use crate::chat::{ChatMessage, FinishReason};
use crate::error::CoreResult;
use crate::{ToolCall, Usage};

/// One model turn step: either the user's text or tool results going back in.
#[derive(Debug, Clone)]
pub enum ProviderInput {
    Text(String),
    ToolResults(Vec<crate::chat::ToolOutcome>),
}

/// What the model produced for one request.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// Final or interstitial text, if any.
    pub text: Option<String>,
    /// Reasoning text surfaced separately from the answer, if any.
    pub thinking: Option<String>,
    /// Tool calls the model wants executed before it can continue.
    pub tool_calls: Vec<ToolCall>,
    /// Token accounting, when the provider reports it.
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

impl ProviderResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// An open conversation with a provider.
///
/// The session owns the system prompts and accumulated history; it is
/// confined to a single turn at a time and never shared across turns
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    pub system_prompts: Vec<String>,
    pub history: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(system_prompts: Vec<String>, history: Vec<ChatMessage>) -> Self {
        Self {
            system_prompts,
            history,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
    }
}

/// Uniform interface over one LLM family.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// The configured model identifier (e.g. a model name string).
    fn model(&self) -> &str;

    /// The model's context window in tokens. Implementations should consult
    /// [`context_window_for`] and allow a configuration override.
    fn context_window(&self) -> u64 {
        context_window_for(self.model())
    }

    /// Bind the prepared tool descriptors for subsequent sends. Descriptors
    /// are already sanitized and dialect-transformed by [`prepare_tools`].
    fn bind_tools(&self, tools: Vec<crate::chat::Tool>);

    /// Open a session seeded with system prompts and prior history.
    fn start_chat(&self, system_prompts: Vec<String>, history: Vec<ChatMessage>) -> ChatSession {
        ChatSession::new(system_prompts, history)
    }

    /// Send one input into the session and return the model's response.
    /// Implementations append both the input and the response to the session
    /// history so the next send sees them.
    async fn send(
        &self,
        session: &mut ChatSession,
        input: ProviderInput,
    ) -> CoreResult<ProviderResponse>;

    /// One-shot generation outside any session (identity summaries, ad-hoc
    /// prompts). Default: run a throwaway session.
    async fn generate(&self, prompt: &str) -> CoreResult<String> {
        let mut session = self.start_chat(Vec::new(), Vec::new());
        let response = self
            .send(&mut session, ProviderInput::Text(prompt.to_string()))
            .await?;
        Ok(response.text.unwrap_or_default())
    }
}
