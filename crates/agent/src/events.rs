//! Typed events flowing over the [`crate::event_bus::EventBus`].
//!
//! Event names form a closed set with `bot:`/`task:`/`knowledge:` wire
//! prefixes; payloads are a tagged union so consumers never dig through
//! untyped maps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use vigil::error::CoreError;
use vigil::Usage;

use crate::domain::TaskStatus;

/// Closed set of event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    // bot
    Load,
    ChatStarted,
    MessageSent,
    MessageReceived,
    TurnComplete,
    ToolUse,
    ToolResult,
    Thought,
    Summarized,
    TokenUsage,
    TokenEstimate,
    // task
    TaskAdded,
    TaskAvailable,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskStatusChanged,
    // knowledge
    MemorySaved,
    SummarizationStarted,
    SummarizationCompleted,
}

impl EventName {
    /// Wire name, `<namespace>:<event>`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Load => "bot:load",
            EventName::ChatStarted => "bot:chat_started",
            EventName::MessageSent => "bot:message_sent",
            EventName::MessageReceived => "bot:message_received",
            EventName::TurnComplete => "bot:turn_complete",
            EventName::ToolUse => "bot:tool_use",
            EventName::ToolResult => "bot:tool_result",
            EventName::Thought => "bot:thought",
            EventName::Summarized => "bot:summarized",
            EventName::TokenUsage => "bot:token_usage",
            EventName::TokenEstimate => "bot:token_estimate",
            EventName::TaskAdded => "task:added",
            EventName::TaskAvailable => "task:available",
            EventName::TaskStarted => "task:started",
            EventName::TaskCompleted => "task:completed",
            EventName::TaskFailed => "task:failed",
            EventName::TaskStatusChanged => "task:status_changed",
            EventName::MemorySaved => "knowledge:memory_saved",
            EventName::SummarizationStarted => "knowledge:summarization_started",
            EventName::SummarizationCompleted => "knowledge:summarization_completed",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Load,
    ChatStarted {
        chat_name: Option<String>,
    },
    MessageSent {
        content: String,
    },
    MessageReceived {
        content: String,
    },
    TurnComplete,
    ToolUse {
        name: String,
        args: Value,
    },
    ToolResult {
        name: String,
        result: Value,
    },
    Thought {
        text: String,
    },
    Summarized {
        summary_len: usize,
    },
    TokenUsage {
        usage: Usage,
    },
    TokenEstimate {
        estimated_tokens: u64,
        source: String,
    },
    TaskAdded {
        task_id: String,
    },
    TaskAvailable {
        task_id: String,
        instruction: String,
    },
    TaskStarted {
        task_id: String,
    },
    TaskCompleted {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskStatusChanged {
        task_id: String,
        status: TaskStatus,
    },
    MemorySaved {
        node_id: String,
    },
    SummarizationStarted,
    SummarizationCompleted,
}

impl EventKind {
    pub fn name(&self) -> EventName {
        match self {
            EventKind::Load => EventName::Load,
            EventKind::ChatStarted { .. } => EventName::ChatStarted,
            EventKind::MessageSent { .. } => EventName::MessageSent,
            EventKind::MessageReceived { .. } => EventName::MessageReceived,
            EventKind::TurnComplete => EventName::TurnComplete,
            EventKind::ToolUse { .. } => EventName::ToolUse,
            EventKind::ToolResult { .. } => EventName::ToolResult,
            EventKind::Thought { .. } => EventName::Thought,
            EventKind::Summarized { .. } => EventName::Summarized,
            EventKind::TokenUsage { .. } => EventName::TokenUsage,
            EventKind::TokenEstimate { .. } => EventName::TokenEstimate,
            EventKind::TaskAdded { .. } => EventName::TaskAdded,
            EventKind::TaskAvailable { .. } => EventName::TaskAvailable,
            EventKind::TaskStarted { .. } => EventName::TaskStarted,
            EventKind::TaskCompleted { .. } => EventName::TaskCompleted,
            EventKind::TaskFailed { .. } => EventName::TaskFailed,
            EventKind::TaskStatusChanged { .. } => EventName::TaskStatusChanged,
            EventKind::MemorySaved { .. } => EventName::MemorySaved,
            EventKind::SummarizationStarted => EventName::SummarizationStarted,
            EventKind::SummarizationCompleted => EventName::SummarizationCompleted,
        }
    }
}

/// Identifies which conversation an event belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventScope {
    pub session_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl EventScope {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            chat_id: None,
            task_id: None,
        }
    }

    pub fn chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn task(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }
}

/// A fully materialized event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub name: EventName,
    #[serde(flatten)]
    pub scope: EventScope,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: EventKind,
}

impl AgentEvent {
    pub fn new(scope: EventScope, kind: EventKind) -> Self {
        Self {
            name: kind.name(),
            scope,
            timestamp: OffsetDateTime::now_utc(),
            kind,
        }
    }
}

/// A bus subscriber. The optional value it returns is collected by
/// `dispatch`; a `None` slot marks a handler that failed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &AgentEvent) -> Result<Option<Value>, CoreError>;
}
