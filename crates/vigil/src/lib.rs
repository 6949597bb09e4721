//! Vigil core: a unified surface for driving tool-using LLM conversations.
//!
//! This crate holds everything that is independent of the agent runtime:
//! chat message and tool types, the [`provider::ModelProvider`] abstraction,
//! tool-name sanitization and schema dialect transforms, and the MCP tool
//! layer ([`mcp::ToolClient`] / [`mcp::ToolBroker`]) that brokers calls to
//! external tool servers over stdio or SSE transports.

use serde::{Deserialize, Serialize};

/// Chat messages, roles and tool descriptors.
pub mod chat;

/// Error types and handling.
pub mod error;

/// MCP tool-server layer: config, transports, client and broker.
pub mod mcp;

/// Model provider abstraction and schema transforms.
pub mod provider;

/// A function call the model wants to make, standardized across providers.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned id of the call.
    pub id: String,
    /// The (sanitized) function name the model asked for.
    pub name: String,
    /// Arguments serialized as a JSON string.
    pub arguments: String,
}

impl ToolCall {
    /// Parse the argument string into a JSON value, tolerating empty input.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        if self.arguments.trim().is_empty() {
            return serde_json::Value::Object(serde_json::Map::new());
        }
        serde_json::from_str(&self.arguments)
            .unwrap_or(serde_json::Value::String(self.arguments.clone()))
    }
}

/// Token usage reported by a provider for a single request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Default)]
pub struct Usage {
    #[serde(alias = "prompt_tokens", alias = "promptTokenCount")]
    pub input_tokens: u32,
    #[serde(alias = "completion_tokens", alias = "candidatesTokenCount")]
    pub output_tokens: u32,
    /// Tokens served from the provider-side prompt cache, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u32>,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_arguments_parse_json_objects() {
        let call = ToolCall {
            id: "c1".into(),
            name: "add".into(),
            arguments: r#"{"a": 2, "b": 3}"#.into(),
        };
        let args = call.parsed_arguments();
        assert_eq!(args["a"], 2);
        assert_eq!(args["b"], 3);
    }

    #[test]
    fn tool_call_arguments_tolerate_empty_and_garbage() {
        let empty = ToolCall {
            id: "c1".into(),
            name: "noop".into(),
            arguments: "  ".into(),
        };
        assert!(empty.parsed_arguments().as_object().unwrap().is_empty());

        let garbage = ToolCall {
            id: "c2".into(),
            name: "noop".into(),
            arguments: "not json".into(),
        };
        assert_eq!(
            garbage.parsed_arguments(),
            serde_json::Value::String("not json".into())
        );
    }

    #[test]
    fn usage_accepts_provider_aliases() {
        let openai: Usage =
            serde_json::from_str(r#"{"prompt_tokens": 10, "completion_tokens": 5}"#).unwrap();
        assert_eq!(openai.input_tokens, 10);
        assert_eq!(openai.total_tokens(), 15);

        let google: Usage =
            serde_json::from_str(r#"{"promptTokenCount": 7, "candidatesTokenCount": 2}"#).unwrap();
        assert_eq!(google.output_tokens, 2);
    }
}
