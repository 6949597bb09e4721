//! Per-chat conversation runtime.
//!
//! One orchestrator owns one provider session and drives the tool-call loop:
//! identity injection, threshold-triggered summarization, token-budgeted
//! history selection, middleware, tool dispatch and persistence. Everything
//! observable is published on the event bus.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use vigil::chat::{ChatRole, ToolOutcome};
use vigil::error::{CoreError, CoreResult};
use vigil::mcp::ToolBroker;
use vigil::provider::{prepare_tools, ChatSession, ModelProvider, ProviderInput};

use crate::domain::ChatMessageKind;
use crate::event_bus::EventBus;
use crate::events::{EventKind, EventScope};
use crate::identity::IdentityService;
use crate::messages::{node_to_chat_message, MessageService, SaveMessage};
use crate::middleware::{MessageContext, MiddlewareSet, ResponseContext, ToolCallContext};
use crate::store::KnowledgeStore;

const SUMMARY_PROMPT: &str = "Summarize the conversation below into a single compact \
checkpoint. Preserve decisions, open questions, facts learned and the user's standing \
preferences; drop pleasantries. The summary will replace everything before it in the \
model's context.\n\n";

/// Tunables for one orchestrator. Values are clamped into their sane ranges
/// at construction.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Fraction of the context window history may fill.
    pub token_budget_percent: f64,
    /// Fraction of the context window that triggers summarization.
    pub summary_token_threshold: f64,
    /// Hard cap on tool-loop iterations within one turn.
    pub max_tool_iterations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_budget_percent: 0.8,
            summary_token_threshold: 0.85,
            max_tool_iterations: 20,
        }
    }
}

impl OrchestratorConfig {
    pub fn clamped(mut self) -> Self {
        self.token_budget_percent = self.token_budget_percent.clamp(0.1, 1.0);
        self.summary_token_threshold = self.summary_token_threshold.clamp(0.5, 0.95);
        self
    }
}

pub struct ConversationOrchestrator {
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn KnowledgeStore>,
    messages: MessageService,
    identity: IdentityService,
    broker: Arc<ToolBroker>,
    bus: Arc<EventBus>,
    middleware: MiddlewareSet,
    config: OrchestratorConfig,
    /// Confined to one turn at a time; turns never overlap per orchestrator.
    session: Mutex<Option<ChatSession>>,
    name_map: RwLock<HashMap<String, String>>,
    scope: RwLock<EventScope>,
}

impl ConversationOrchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn KnowledgeStore>,
        broker: Arc<ToolBroker>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            messages: MessageService::new(store.clone()),
            identity: IdentityService::new(store.clone()),
            store,
            broker,
            bus,
            middleware: MiddlewareSet::new(),
            config: OrchestratorConfig::default(),
            session: Mutex::new(None),
            name_map: RwLock::new(HashMap::new()),
            scope: RwLock::new(EventScope::default()),
        }
    }

    pub fn with_middleware(mut self, middleware: MiddlewareSet) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config.clamped();
        self
    }

    pub fn message_service(&self) -> &MessageService {
        &self.messages
    }

    fn scope(&self) -> EventScope {
        self.scope.read().unwrap().clone()
    }

    fn chat_id(&self) -> CoreResult<String> {
        self.scope
            .read()
            .unwrap()
            .chat_id
            .clone()
            .ok_or_else(|| CoreError::Validation("chat not started".into()))
    }

    /// One-shot generation outside the session (identity summaries,
    /// summarization).
    pub async fn generate(&self, prompt: &str) -> CoreResult<String> {
        self.provider.generate(prompt).await
    }

    /// Whether the history since the last checkpoint has outgrown the
    /// summarization threshold.
    async fn should_summarize(&self, chat_id: &str) -> CoreResult<bool> {
        let since = self.messages.estimate_tokens_since_summary(chat_id).await?;
        let threshold = (self.provider.context_window() as f64
            * self.config.summary_token_threshold) as u64;
        Ok(since >= threshold)
    }

    /// Produce one flat summary checkpoint replacing all pre-summary history.
    async fn summarize_conversation(&self, chat_id: &str) -> CoreResult<()> {
        let transcript = self.messages.format_for_summary(chat_id).await?;
        if transcript.trim().is_empty() {
            return Ok(());
        }

        self.bus
            .emit(self.scope(), EventKind::SummarizationStarted)
            .await;

        let summary = self
            .provider
            .generate(&format!("{}{}", SUMMARY_PROMPT, transcript))
            .await?;

        self.messages
            .save_message(SaveMessage::new(
                chat_id,
                &summary,
                ChatRole::Model,
                ChatMessageKind::Summary,
            ))
            .await?;

        self.bus
            .emit(
                self.scope(),
                EventKind::Summarized {
                    summary_len: summary.len(),
                },
            )
            .await;
        self.bus
            .emit(self.scope(), EventKind::SummarizationCompleted)
            .await;
        log::info!(
            "summarized chat '{}' into a {}-char checkpoint",
            chat_id,
            summary.len()
        );
        Ok(())
    }

    /// Open (or reopen) the provider session for a chat.
    pub async fn start_chat(
        &self,
        session_id: &str,
        user_id: &str,
        chat_id: &str,
        chat_name: Option<&str>,
        preloaded_identity: Option<String>,
    ) -> CoreResult<()> {
        *self.scope.write().unwrap() = EventScope::new(session_id, user_id).chat(chat_id);

        self.store
            .create_chat(chat_id, user_id, chat_name.unwrap_or("New Chat"))
            .await?;

        let identity_block = match preloaded_identity {
            Some(identity) => identity,
            None => {
                let memory = self.identity.get_identity_memory().await?;
                self.identity
                    .summarize_identity(&memory, self.provider.as_ref())
                    .await?
            }
        };

        if self.should_summarize(chat_id).await? {
            self.summarize_conversation(chat_id).await?;
        }

        let budget = (self.provider.context_window() as f64 * self.config.token_budget_percent)
            as u64;
        let history_nodes = self
            .messages
            .get_messages_within_token_limit(chat_id, budget, true)
            .await?;
        let history_tokens: u64 = history_nodes
            .iter()
            .map(|n| self.messages.estimate_message_tokens(n))
            .sum();
        let history: Vec<_> = history_nodes.iter().map(node_to_chat_message).collect();

        let descriptors = self.broker.aggregate_tools().await;
        let (tools, name_map) = prepare_tools(&descriptors);
        self.provider.bind_tools(tools);
        *self.name_map.write().unwrap() = name_map;

        *self.session.lock().await = Some(
            self.provider
                .start_chat(vec![identity_block], history),
        );

        self.bus
            .emit(
                self.scope(),
                EventKind::TokenEstimate {
                    estimated_tokens: history_tokens,
                    source: "history".into(),
                },
            )
            .await;
        self.bus
            .emit(
                self.scope(),
                EventKind::ChatStarted {
                    chat_name: chat_name.map(str::to_string),
                },
            )
            .await;
        Ok(())
    }

    /// Persist an internal user/model exchange and splice it into the open
    /// session (scheduler bootstrap framing).
    pub async fn inject_internal_exchange(
        &self,
        user_text: &str,
        model_text: &str,
    ) -> CoreResult<()> {
        let chat_id = self.chat_id()?;
        self.messages
            .save_message(
                SaveMessage::new(
                    &chat_id,
                    user_text,
                    ChatRole::User,
                    ChatMessageKind::Internal,
                )
                .internal(),
            )
            .await?;
        self.messages
            .save_message(
                SaveMessage::new(
                    &chat_id,
                    model_text,
                    ChatRole::Model,
                    ChatMessageKind::Internal,
                )
                .internal(),
            )
            .await?;

        let mut session = self.session.lock().await;
        let session = session
            .as_mut()
            .ok_or_else(|| CoreError::Validation("chat not started".into()))?;
        session.push(vigil::chat::ChatMessage::user().content(user_text).build());
        session.push(vigil::chat::ChatMessage::model().content(model_text).build());
        Ok(())
    }

    fn stringify_result(result: &Value) -> String {
        match result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn valid_tool_name(name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Drive one full turn. Returns the model's final text.
    pub async fn send_message(&self, text: &str, task_id: Option<&str>) -> CoreResult<String> {
        let chat_id = self.chat_id()?;
        let scope = self.scope().task(task_id.map(str::to_string));

        // Message-in middleware.
        let mut message_ctx = MessageContext::new(&chat_id, text);
        self.middleware
            .run_message(&mut message_ctx, &self.broker)
            .await;

        if message_ctx.skip_model {
            let canned = message_ctx.response.clone().unwrap_or_default();
            self.messages
                .save_message(SaveMessage::new(
                    &chat_id,
                    message_ctx.effective_message(),
                    ChatRole::User,
                    ChatMessageKind::Message,
                ))
                .await?;
            self.bus
                .emit(
                    scope.clone(),
                    EventKind::MessageSent {
                        content: message_ctx.effective_message().to_string(),
                    },
                )
                .await;
            self.messages
                .save_message(SaveMessage::new(
                    &chat_id,
                    &canned,
                    ChatRole::Model,
                    ChatMessageKind::Message,
                ))
                .await?;
            self.bus
                .emit(
                    scope.clone(),
                    EventKind::MessageReceived {
                        content: canned.clone(),
                    },
                )
                .await;
            self.bus.emit(scope, EventKind::TurnComplete).await;
            return Ok(canned);
        }

        let effective = message_ctx.effective_message().to_string();
        self.messages
            .save_message(SaveMessage::new(
                &chat_id,
                &effective,
                ChatRole::User,
                ChatMessageKind::Message,
            ))
            .await?;
        self.bus
            .emit(
                scope.clone(),
                EventKind::MessageSent {
                    content: effective.clone(),
                },
            )
            .await;
        self.bus
            .emit(
                scope.clone(),
                EventKind::TokenEstimate {
                    estimated_tokens: self.messages.estimate_user_message(&effective),
                    source: "message".into(),
                },
            )
            .await;

        let mut session_guard = self.session.lock().await;
        let session = session_guard
            .as_mut()
            .ok_or_else(|| CoreError::Validation("chat not started".into()))?;

        let mut input = ProviderInput::Text(effective.clone());
        let mut iterations: u32 = 0;
        let final_text = loop {
            let response = self
                .provider
                .send(session, input)
                .await
                .map_err(|err| match err {
                    // A provider deadline is a model failure, not a retryable
                    // transport condition.
                    CoreError::Timeout(m) => CoreError::Model(m),
                    other => other,
                })?;

            if let Some(usage) = response.usage {
                self.bus
                    .emit(scope.clone(), EventKind::TokenUsage { usage })
                    .await;
            }
            if let Some(thinking) = response
                .thinking
                .as_deref()
                .or(response.text.as_deref().filter(|_| response.has_tool_calls()))
            {
                if !thinking.trim().is_empty() {
                    self.bus
                        .emit(
                            scope.clone(),
                            EventKind::Thought {
                                text: thinking.to_string(),
                            },
                        )
                        .await;
                }
            }

            if !response.has_tool_calls() {
                break response.text.unwrap_or_default();
            }

            iterations += 1;
            if iterations > self.config.max_tool_iterations {
                return Err(CoreError::Model(format!(
                    "tool loop exceeded {} iterations",
                    self.config.max_tool_iterations
                )));
            }

            let mut outcomes: Vec<ToolOutcome> = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let args = call.parsed_arguments();
                let original = if Self::valid_tool_name(&call.name) {
                    self.name_map.read().unwrap().get(&call.name).cloned()
                } else {
                    None
                };

                let (display_name, result) = match original {
                    None => {
                        log::warn!("model requested unknown tool '{}'", call.name);
                        (call.name.clone(), json!({"error": "unknown tool"}))
                    }
                    Some(original) => {
                        let mut tool_ctx = ToolCallContext::new(&original, args.clone());
                        self.middleware.run_tool(&mut tool_ctx, &self.broker).await;

                        self.bus
                            .emit(
                                scope.clone(),
                                EventKind::ToolUse {
                                    name: original.clone(),
                                    args: tool_ctx.effective_args().clone(),
                                },
                            )
                            .await;
                        self.messages
                            .save_message(
                                SaveMessage::new(
                                    &chat_id,
                                    format!("Calling {}", original),
                                    ChatRole::Model,
                                    ChatMessageKind::ToolUse,
                                )
                                .tool(&original, tool_ctx.effective_args().clone()),
                            )
                            .await?;

                        let result = match tool_ctx.result.take() {
                            Some(vetoed) => vetoed,
                            None => {
                                self.broker
                                    .call(&original, tool_ctx.effective_args().clone())
                                    .await
                            }
                        };
                        (original, result)
                    }
                };

                let result_text = Self::stringify_result(&result);
                self.bus
                    .emit(
                        scope.clone(),
                        EventKind::ToolResult {
                            name: display_name.clone(),
                            result: result.clone(),
                        },
                    )
                    .await;
                self.messages
                    .save_message(
                        SaveMessage::new(
                            &chat_id,
                            &result_text,
                            ChatRole::User,
                            ChatMessageKind::ToolResult,
                        )
                        .tool(&display_name, args),
                    )
                    .await?;

                outcomes.push(ToolOutcome {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: result_text,
                });
            }

            input = ProviderInput::ToolResults(outcomes);
        };
        drop(session_guard);

        // Response-out middleware.
        let mut response_ctx = ResponseContext::new(&effective, &final_text);
        self.middleware
            .run_response(&mut response_ctx, &self.broker)
            .await;
        let final_text = response_ctx.effective_response().to_string();

        self.messages
            .save_message(SaveMessage::new(
                &chat_id,
                &final_text,
                ChatRole::Model,
                ChatMessageKind::Message,
            ))
            .await?;
        self.bus
            .emit(
                scope.clone(),
                EventKind::MessageReceived {
                    content: final_text.clone(),
                },
            )
            .await;
        self.bus.emit(scope, EventKind::TurnComplete).await;

        Ok(final_text)
    }
}
