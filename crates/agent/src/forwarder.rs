//! Event forwarding toward a live client connection.
//!
//! The runtime does not own a WebSocket; it owns a [`MessageSink`] seam. A
//! [`WebSocketForwarder`] subscribes to the bus and translates events into
//! the closed [`WsMessage`] wire union, dropping (and logging) sends that
//! fail so a dead client never disturbs a turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vigil::error::{CoreError, CoreResult};
use vigil::Usage;

use crate::event_bus::EventBus;
use crate::events::{AgentEvent, EventHandler, EventKind, EventName};

/// Everything a forwarder needs from a client connection.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_text(&self, text: String) -> CoreResult<()>;
}

/// Wire payloads, one variant per message type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsPayload {
    Status { message: String },
    Message { text: String },
    ToolUse { name: String, args: Value },
    ToolResult { name: String, result: Value },
    Thought { text: String },
    TokenUsage { usage: Usage },
    TokenEstimate { estimated_tokens: u64, source: String },
    Error { message: String },
}

/// One message on the wire, payload plus addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(flatten)]
    pub payload: WsPayload,
    pub session_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Event names a forwarder subscribes to.
pub const FORWARDED_EVENTS: &[EventName] = &[
    EventName::ChatStarted,
    EventName::MessageReceived,
    EventName::ToolUse,
    EventName::ToolResult,
    EventName::Thought,
    EventName::TokenUsage,
    EventName::TokenEstimate,
    EventName::TaskFailed,
];

pub struct WebSocketForwarder {
    sink: Arc<dyn MessageSink>,
}

impl WebSocketForwarder {
    pub fn new(sink: Arc<dyn MessageSink>) -> Arc<Self> {
        Arc::new(Self { sink })
    }

    /// Attach a forwarder to the bus for every forwarded event name.
    pub fn attach(bus: &EventBus, sink: Arc<dyn MessageSink>) -> Arc<Self> {
        let forwarder = Self::new(sink);
        bus.subscribe_all(FORWARDED_EVENTS, forwarder.clone());
        forwarder
    }

    fn translate(event: &AgentEvent) -> Option<WsPayload> {
        match &event.kind {
            EventKind::ChatStarted { chat_name } => Some(WsPayload::Status {
                message: match chat_name {
                    Some(name) => format!("chat started: {}", name),
                    None => "chat started".to_string(),
                },
            }),
            EventKind::MessageReceived { content } => Some(WsPayload::Message {
                text: content.clone(),
            }),
            EventKind::ToolUse { name, args } => Some(WsPayload::ToolUse {
                name: name.clone(),
                args: args.clone(),
            }),
            EventKind::ToolResult { name, result } => Some(WsPayload::ToolResult {
                name: name.clone(),
                result: result.clone(),
            }),
            EventKind::Thought { text } => Some(WsPayload::Thought { text: text.clone() }),
            EventKind::TokenUsage { usage } => Some(WsPayload::TokenUsage { usage: *usage }),
            EventKind::TokenEstimate {
                estimated_tokens,
                source,
            } => Some(WsPayload::TokenEstimate {
                estimated_tokens: *estimated_tokens,
                source: source.clone(),
            }),
            EventKind::TaskFailed { error, .. } => Some(WsPayload::Error {
                message: error.clone(),
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl EventHandler for WebSocketForwarder {
    async fn on_event(&self, event: &AgentEvent) -> Result<Option<Value>, CoreError> {
        let Some(payload) = Self::translate(event) else {
            return Ok(None);
        };
        let message = WsMessage {
            payload,
            session_id: event.scope.session_id.clone(),
            user_id: event.scope.user_id.clone(),
            chat_id: event.scope.chat_id.clone(),
            task_id: event.scope.task_id.clone(),
        };
        let text = serde_json::to_string(&message)?;
        if let Err(err) = self.sink.send_text(text).await {
            // A closed client is routine; never fail the dispatching turn.
            log::debug!(
                "dropping {} for session {}: {}",
                event.name,
                event.scope.session_id,
                err
            );
        }
        Ok(None)
    }
}
