//! Typed graph entities: nodes, edges and their closed type sets.
//!
//! Everything the runtime persists goes through these types; untyped JSON is
//! decoded at this boundary and never travels further in.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use vigil::error::CoreError;

/// Closed, normalized node type set (PascalCase in storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Chat,
    ChatMessage,
    User,
    Session,
    Task,
    Memory,
    Concept,
    Summary,
    File,
    ToolCall,
    Ontology,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Chat => "Chat",
            NodeType::ChatMessage => "ChatMessage",
            NodeType::User => "User",
            NodeType::Session => "Session",
            NodeType::Task => "Task",
            NodeType::Memory => "Memory",
            NodeType::Concept => "Concept",
            NodeType::Summary => "Summary",
            NodeType::File => "File",
            NodeType::ToolCall => "ToolCall",
            NodeType::Ontology => "Ontology",
        }
    }
}

impl FromStr for NodeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Chat" => Ok(NodeType::Chat),
            "ChatMessage" => Ok(NodeType::ChatMessage),
            "User" => Ok(NodeType::User),
            "Session" => Ok(NodeType::Session),
            "Task" => Ok(NodeType::Task),
            "Memory" => Ok(NodeType::Memory),
            "Concept" => Ok(NodeType::Concept),
            "Summary" => Ok(NodeType::Summary),
            "File" => Ok(NodeType::File),
            "ToolCall" => Ok(NodeType::ToolCall),
            "Ontology" => Ok(NodeType::Ontology),
            other => Err(CoreError::Schema(format!("unknown node type: '{}'", other))),
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed edge type set (SCREAMING_SNAKE_CASE in storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    Contains,
    BelongsTo,
    RelatesTo,
    HasAttachment,
    InstanceOf,
    DependsOn,
    Summarizes,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Contains => "CONTAINS",
            EdgeType::BelongsTo => "BELONGS_TO",
            EdgeType::RelatesTo => "RELATES_TO",
            EdgeType::HasAttachment => "HAS_ATTACHMENT",
            EdgeType::InstanceOf => "INSTANCE_OF",
            EdgeType::DependsOn => "DEPENDS_ON",
            EdgeType::Summarizes => "SUMMARIZES",
        }
    }
}

impl FromStr for EdgeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTAINS" => Ok(EdgeType::Contains),
            "BELONGS_TO" => Ok(EdgeType::BelongsTo),
            "RELATES_TO" => Ok(EdgeType::RelatesTo),
            "HAS_ATTACHMENT" => Ok(EdgeType::HasAttachment),
            "INSTANCE_OF" => Ok(EdgeType::InstanceOf),
            "DEPENDS_ON" => Ok(EdgeType::DependsOn),
            "SUMMARIZES" => Ok(EdgeType::Summarizes),
            other => Err(CoreError::Schema(format!("unknown edge type: '{}'", other))),
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property map attached to nodes and edges. BTreeMap keeps serialization
/// stable for tests and FTS projections.
pub type Properties = BTreeMap<String, Value>;

/// A graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    pub content: Option<String>,
    pub properties: Properties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Node {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn property_bool(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A graph edge; `(source_id, target_id, edge_type)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_id: String,
    pub target_id: String,
    pub edge_type: EdgeType,
    pub properties: Properties,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Task lifecycle states; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(CoreError::Schema(format!("unknown task status: '{}'", other))),
        }
    }
}

/// Message content kinds stored on `ChatMessage` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMessageKind {
    Message,
    Summary,
    ToolUse,
    ToolResult,
    Internal,
}

impl ChatMessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMessageKind::Message => "message",
            ChatMessageKind::Summary => "summary",
            ChatMessageKind::ToolUse => "tool_use",
            ChatMessageKind::ToolResult => "tool_result",
            ChatMessageKind::Internal => "internal",
        }
    }
}

impl FromStr for ChatMessageKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(ChatMessageKind::Message),
            "summary" => Ok(ChatMessageKind::Summary),
            "tool_use" => Ok(ChatMessageKind::ToolUse),
            "tool_result" => Ok(ChatMessageKind::ToolResult),
            "internal" => Ok(ChatMessageKind::Internal),
            other => Err(CoreError::Schema(format!(
                "unknown message type: '{}'",
                other
            ))),
        }
    }
}

/// A task decoded from its `Node{type=Task}` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub metadata: Properties,
    pub response: Option<String>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TaskRecord {
    /// Decode a task from its node row. Missing or malformed fields are a
    /// schema error: tasks are only ever written by the queue.
    pub fn from_node(node: &Node) -> Result<Self, CoreError> {
        if node.node_type != NodeType::Task {
            return Err(CoreError::Schema(format!(
                "node '{}' is a {}, not a Task",
                node.id, node.node_type
            )));
        }
        let instruction = node
            .property_str("instruction")
            .map(str::to_string)
            .or_else(|| node.content.clone())
            .ok_or_else(|| CoreError::Schema(format!("task '{}' has no instruction", node.id)))?;
        let status = node
            .property_str("status")
            .unwrap_or("pending")
            .parse::<TaskStatus>()?;
        let metadata = node
            .properties
            .get("metadata")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Self {
            id: node.id.clone(),
            instruction,
            status,
            metadata,
            response: node.property_str("response").map(str::to_string),
            error: node.property_str("error").map(str::to_string),
            created_at: node.created_at,
            updated_at: node.updated_at,
        })
    }

    /// Name of the recurring spec that enqueued this task, if any.
    pub fn scheduled_task_name(&self) -> Option<&str> {
        self.metadata
            .get("scheduled_task_name")
            .and_then(Value::as_str)
    }
}

/// Row returned by chat listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: String,
    pub name: String,
    pub archived: bool,
    pub message_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Prefix an id with its node-type convention when the caller passed a bare
/// identifier (`chat:<uuid>`, `user:<name>`, `task:<uuid>`).
pub fn prefixed_id(prefix: &str, id: &str) -> String {
    if id.starts_with(&format!("{}:", prefix)) {
        id.to_string()
    } else {
        format!("{}:{}", prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_and_edge_types_round_trip() {
        for t in [
            NodeType::Chat,
            NodeType::ChatMessage,
            NodeType::Task,
            NodeType::Summary,
        ] {
            assert_eq!(t.as_str().parse::<NodeType>().unwrap(), t);
        }
        for e in [EdgeType::Contains, EdgeType::DependsOn, EdgeType::BelongsTo] {
            assert_eq!(e.as_str().parse::<EdgeType>().unwrap(), e);
        }
        assert!("chat".parse::<NodeType>().is_err());
        assert!("contains".parse::<EdgeType>().is_err());
    }

    #[test]
    fn task_status_transitions_and_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn prefixed_id_is_idempotent() {
        assert_eq!(prefixed_id("chat", "abc"), "chat:abc");
        assert_eq!(prefixed_id("chat", "chat:abc"), "chat:abc");
    }

    #[test]
    fn task_record_decodes_from_node() {
        let now = OffsetDateTime::now_utc();
        let mut properties = Properties::new();
        properties.insert("instruction".into(), Value::String("do sweep".into()));
        properties.insert("status".into(), Value::String("pending".into()));
        properties.insert(
            "metadata".into(),
            serde_json::json!({"scheduled_task_name": "sweep"}),
        );
        let node = Node {
            id: "task:1".into(),
            node_type: NodeType::Task,
            label: "Task: do sweep".into(),
            content: Some("do sweep".into()),
            properties,
            embedding: None,
            created_at: now,
            updated_at: now,
        };

        let task = TaskRecord::from_node(&node).unwrap();
        assert_eq!(task.instruction, "do sweep");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.scheduled_task_name(), Some("sweep"));
    }
}
