//! Chat message and tool types shared between providers and the runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ToolCall;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The user/human participant (also carries tool results back in).
    User,
    /// The model participant.
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ChatRole::User),
            "model" | "assistant" => Ok(ChatRole::Model),
            other => Err(format!("unknown chat role: '{}'", other)),
        }
    }
}

/// The content kind of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// The model requested one or more tool invocations.
    ToolUse(Vec<ToolCall>),
    /// Results being fed back for prior tool invocations.
    ToolResult(Vec<ToolOutcome>),
}

/// The outcome of one tool invocation, fed back into the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Id of the originating call.
    pub call_id: String,
    /// Sanitized tool name the model used.
    pub name: String,
    /// Result body, already rendered to text/JSON-text.
    pub result: String,
}

/// A single message in a provider session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub kind: MessageKind,
    pub content: String,
}

impl ChatMessage {
    pub fn user() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::User)
    }

    pub fn model() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::Model)
    }
}

/// Builder for [`ChatMessage`].
#[derive(Debug)]
pub struct ChatMessageBuilder {
    role: ChatRole,
    kind: MessageKind,
    content: String,
}

impl ChatMessageBuilder {
    pub fn new(role: ChatRole) -> Self {
        Self {
            role,
            kind: MessageKind::default(),
            content: String::new(),
        }
    }

    pub fn content<S: Into<String>>(mut self, content: S) -> Self {
        self.content = content.into();
        self
    }

    pub fn tool_use(mut self, calls: Vec<ToolCall>) -> Self {
        self.kind = MessageKind::ToolUse(calls);
        self
    }

    pub fn tool_result(mut self, outcomes: Vec<ToolOutcome>) -> Self {
        self.kind = MessageKind::ToolResult(outcomes);
        self
    }

    pub fn build(self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            kind: self.kind,
            content: self.content,
        }
    }
}

/// A callable tool as presented to the model.
///
/// `parameters` holds the JSON Schema for the arguments, already transformed
/// into the provider's dialect by [`crate::provider::prepare_tools`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Why the provider stopped generating.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_text() {
        let msg = ChatMessage::user().content("hello").build();
        assert_eq!(msg.role, ChatRole::User);
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn role_parses_assistant_alias() {
        assert_eq!("assistant".parse::<ChatRole>().unwrap(), ChatRole::Model);
        assert!("robot".parse::<ChatRole>().is_err());
    }

    #[test]
    fn tool_result_round_trips_through_serde() {
        let msg = ChatMessage::user()
            .tool_result(vec![ToolOutcome {
                call_id: "c1".into(),
                name: "add".into(),
                result: "5".into(),
            }])
            .build();
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, msg.kind);
    }
}
