//! OpenAI-compatible chat provider for the CLI edge.
//!
//! The core treats providers as abstract; this is the one concrete
//! implementation the binary ships. It speaks the `/chat/completions` shape
//! (OpenAI, OpenRouter, local gateways) with function tools.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use vigil::chat::{ChatMessage, ChatRole, FinishReason, MessageKind, Tool};
use vigil::error::{CoreError, CoreResult};
use vigil::provider::{
    context_window_for, ChatSession, ModelProvider, ProviderInput, ProviderResponse,
};
use vigil::{ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    context_window_override: Option<u64>,
    tools: RwLock<Vec<Tool>>,
}

impl OpenAiChatProvider {
    pub fn new(model: impl Into<String>) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: std::env::var("VIGIL_OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: model.into(),
            context_window_override: None,
            tools: RwLock::new(Vec::new()),
        })
    }

    pub fn with_context_window_override(mut self, window: Option<u64>) -> Self {
        self.context_window_override = window;
        self
    }

    fn wire_messages(session: &ChatSession) -> Vec<Value> {
        let mut messages = Vec::new();
        for system in &session.system_prompts {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &session.history {
            messages.extend(Self::wire_message(message));
        }
        messages
    }

    fn wire_message(message: &ChatMessage) -> Vec<Value> {
        match (&message.role, &message.kind) {
            (ChatRole::User, MessageKind::Text) => {
                vec![json!({"role": "user", "content": message.content})]
            }
            (ChatRole::Model, MessageKind::Text) => {
                vec![json!({"role": "assistant", "content": message.content})]
            }
            (_, MessageKind::ToolUse(calls)) => {
                let tool_calls: Vec<Value> = calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments},
                        })
                    })
                    .collect();
                let mut msg = json!({"role": "assistant", "tool_calls": tool_calls});
                if !message.content.is_empty() {
                    msg["content"] = Value::String(message.content.clone());
                }
                vec![msg]
            }
            (_, MessageKind::ToolResult(outcomes)) => outcomes
                .iter()
                .map(|outcome| {
                    json!({
                        "role": "tool",
                        "tool_call_id": outcome.call_id,
                        "content": outcome.result,
                    })
                })
                .collect(),
        }
    }

    fn input_to_message(input: &ProviderInput) -> ChatMessage {
        match input {
            ProviderInput::Text(text) => ChatMessage::user().content(text.clone()).build(),
            ProviderInput::ToolResults(outcomes) => {
                ChatMessage::user().tool_result(outcomes.clone()).build()
            }
        }
    }
}

#[derive(Deserialize, Debug)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug)]
struct WireChoice {
    finish_reason: Option<String>,
    message: WireMessage,
}

#[derive(Deserialize, Debug)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize, Serialize, Debug)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize, Serialize, Debug)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
}

#[derive(Deserialize, Debug, Default)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: u32,
}

fn parse_response(body: &str) -> CoreResult<ProviderResponse> {
    let wire: WireResponse = serde_json::from_str(body).map_err(|e| {
        CoreError::Model(format!("unparseable provider response: {} ({})", e, body))
    })?;
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::Model("provider returned no choices".into()))?;

    let finish_reason = choice.finish_reason.as_deref().map(|reason| match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        _ => FinishReason::Unknown,
    });

    Ok(ProviderResponse {
        text: choice.message.content.filter(|c| !c.is_empty()),
        thinking: None,
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect(),
        usage: wire.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cached_tokens: u.prompt_tokens_details.map(|d| d.cached_tokens),
        }),
        finish_reason,
    })
}

#[async_trait]
impl ModelProvider for OpenAiChatProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u64 {
        self.context_window_override
            .unwrap_or_else(|| context_window_for(&self.model))
    }

    fn bind_tools(&self, tools: Vec<Tool>) {
        *self.tools.write().unwrap() = tools;
    }

    async fn send(
        &self,
        session: &mut ChatSession,
        input: ProviderInput,
    ) -> CoreResult<ProviderResponse> {
        session.push(Self::input_to_message(&input));

        let mut body = json!({
            "model": self.model,
            "messages": Self::wire_messages(session),
        });
        let tools = self.tools.read().unwrap().clone();
        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(wire_tools);
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::Timeout(format!("provider request timed out: {}", e))
            } else {
                CoreError::Transport(format!("provider request failed: {}", e))
            }
        })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Transport(format!("reading provider response: {}", e)))?;
        if !status.is_success() {
            return Err(CoreError::Model(format!(
                "provider returned {}: {}",
                status, text
            )));
        }

        let parsed = parse_response(&text)?;
        if !parsed.tool_calls.is_empty() {
            session.push(
                ChatMessage::model()
                    .content(parsed.text.clone().unwrap_or_default())
                    .tool_use(parsed.tool_calls.clone())
                    .build(),
            );
        } else if let Some(text) = &parsed.text {
            session.push(ChatMessage::model().content(text.clone()).build());
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil::chat::ToolOutcome;

    #[test]
    fn parses_text_response_with_usage() {
        let response = parse_response(
            r#"{
                "choices": [{
                    "finish_reason": "stop",
                    "message": {"role": "assistant", "content": "hello world"}
                }],
                "usage": {
                    "prompt_tokens": 12,
                    "completion_tokens": 3,
                    "prompt_tokens_details": {"cached_tokens": 8}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(response.text.as_deref(), Some("hello world"));
        assert!(response.tool_calls.is_empty());
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.cached_tokens, Some(8));
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn parses_tool_call_response() {
        let response = parse_response(
            r#"{
                "choices": [{
                    "finish_reason": "tool_calls",
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "add", "arguments": "{\"a\":2,\"b\":3}"}
                        }]
                    }
                }]
            }"#,
        )
        .unwrap();

        assert!(response.text.is_none());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "add");
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn empty_choices_is_a_model_error() {
        let err = parse_response(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, CoreError::Model(_)));
    }

    #[test]
    fn wire_messages_place_system_history_and_tool_results() {
        let mut session = ChatSession::new(vec!["be helpful".into()], Vec::new());
        session.push(ChatMessage::user().content("hi").build());
        session.push(
            ChatMessage::model()
                .content("")
                .tool_use(vec![ToolCall {
                    id: "call_1".into(),
                    name: "add".into(),
                    arguments: "{}".into(),
                }])
                .build(),
        );
        session.push(
            ChatMessage::user()
                .tool_result(vec![ToolOutcome {
                    call_id: "call_1".into(),
                    name: "add".into(),
                    result: "5".into(),
                }])
                .build(),
        );

        let wire = OpenAiChatProvider::wire_messages(&session);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["role"], "assistant");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "add");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
        assert_eq!(wire[3]["content"], "5");
    }
}
