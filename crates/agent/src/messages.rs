//! Token-budgeted history assembly over the knowledge store.
//!
//! Pure logic layer: persistence of chat messages, token estimation, window
//! selection and summary-aware slicing. The orchestrator never touches
//! message nodes directly.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use vigil::chat::ChatRole;
use vigil::error::{CoreError, CoreResult};

use crate::domain::{prefixed_id, ChatMessageKind, EdgeType, Node, NodeType, Properties};
use crate::store::{KnowledgeStore, NewNode};

/// Framing overhead added per message (role + structure).
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Extra overhead for a user message's role and formatting.
const USER_MESSAGE_OVERHEAD_TOKENS: u64 = 10;

/// Overhead for a function-call structure (name + framing).
const TOOL_CALL_OVERHEAD_TOKENS: u64 = 15;

/// Overhead for a tool result wrapper.
const TOOL_RESULT_OVERHEAD_TOKENS: u64 = 10;

/// Tool results are frequently truncated downstream; cap their contribution.
const TOOL_RESULT_TOKEN_CAP: u64 = 10_000;

/// Overhead for reasoning text.
const THOUGHT_OVERHEAD_TOKENS: u64 = 5;

/// Pluggable token estimation strategy.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

/// `ceil(len / chars_per_token)`, at least 1 for non-empty text. A rough
/// heuristic that tracks English text closely enough for budgeting.
pub struct CharacterBasedEstimator {
    chars_per_token: usize,
}

impl CharacterBasedEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self { chars_per_token }
    }
}

impl Default for CharacterBasedEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharacterBasedEstimator {
    fn estimate(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        (text.len().div_ceil(self.chars_per_token)).max(1) as u64
    }
}

/// Parameters for [`MessageService::save_message`].
#[derive(Debug, Clone)]
pub struct SaveMessage {
    pub chat_id: String,
    pub content: String,
    pub role: ChatRole,
    pub kind: ChatMessageKind,
    pub internal: bool,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub attachments: Vec<String>,
}

impl SaveMessage {
    pub fn new(
        chat_id: impl Into<String>,
        content: impl Into<String>,
        role: ChatRole,
        kind: ChatMessageKind,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            content: content.into(),
            role,
            kind,
            internal: false,
            tool_name: None,
            tool_args: None,
            attachments: Vec::new(),
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn tool(mut self, name: impl Into<String>, args: Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_args = Some(args);
        self
    }

    pub fn attachment(mut self, file_id: impl Into<String>) -> Self {
        self.attachments.push(file_id.into());
        self
    }
}

#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn KnowledgeStore>,
    estimator: Arc<dyn TokenEstimator>,
}

impl MessageService {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            store,
            estimator: Arc::new(CharacterBasedEstimator::default()),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Persist a `ChatMessage` node and link it into the chat. The chat node
    /// is verified first: a missing chat is logged (the write still goes
    /// through so no turn output is lost).
    pub async fn save_message(&self, save: SaveMessage) -> CoreResult<Node> {
        let chat_node_id = prefixed_id("chat", &save.chat_id);
        if self.store.get_node(&chat_node_id).await?.is_none() {
            log::warn!(
                "saving message into chat '{}' which has no chat node",
                chat_node_id
            );
        }

        let message_id = format!("message:{}", Uuid::new_v4());
        let mut properties = Properties::new();
        properties.insert("role".into(), Value::String(save.role.as_str().to_string()));
        properties.insert(
            "message_type".into(),
            Value::String(save.kind.as_str().to_string()),
        );
        properties.insert("internal".into(), Value::Bool(save.internal));
        if let Some(tool_name) = &save.tool_name {
            properties.insert("tool_name".into(), Value::String(tool_name.clone()));
        }
        if let Some(tool_args) = &save.tool_args {
            properties.insert("tool_args".into(), tool_args.clone());
        }

        let label = format!("Chat Message {}", &message_id[..21.min(message_id.len())]);
        let node = self
            .store
            .add_node(
                NewNode::new(&message_id, NodeType::ChatMessage, label)
                    .content(&save.content)
                    .properties(properties),
            )
            .await?;

        self.store
            .add_edge(&chat_node_id, &message_id, EdgeType::Contains, Properties::new())
            .await?;

        for file_id in &save.attachments {
            self.store
                .add_edge(&message_id, file_id, EdgeType::HasAttachment, Properties::new())
                .await?;
        }

        Ok(node)
    }

    fn message_kind(node: &Node) -> ChatMessageKind {
        node.property_str("message_type")
            .and_then(|s| ChatMessageKind::from_str(s).ok())
            .unwrap_or(ChatMessageKind::Message)
    }

    fn is_internal(node: &Node) -> bool {
        node.property_bool("internal")
    }

    /// Estimated tokens one stored message contributes to the context.
    pub fn estimate_message_tokens(&self, node: &Node) -> u64 {
        let content = node.content.as_deref().unwrap_or("");
        let base = self.estimator.estimate(content);
        match Self::message_kind(node) {
            ChatMessageKind::ToolUse => {
                let args_len = node
                    .properties
                    .get("tool_args")
                    .map(|v| v.to_string().len() as u64 / 4)
                    .unwrap_or(0);
                base + args_len + TOOL_CALL_OVERHEAD_TOKENS
            }
            ChatMessageKind::ToolResult => {
                base.min(TOOL_RESULT_TOKEN_CAP) + TOOL_RESULT_OVERHEAD_TOKENS
            }
            _ => base + MESSAGE_OVERHEAD_TOKENS,
        }
    }

    /// Estimated tokens for an outgoing user message, including framing.
    pub fn estimate_user_message(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.estimator.estimate(text) + USER_MESSAGE_OVERHEAD_TOKENS
    }

    /// Estimated tokens for reasoning text.
    pub fn estimate_thought(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.estimator.estimate(text) + THOUGHT_OVERHEAD_TOKENS
    }

    async fn load_all(&self, chat_id: &str) -> CoreResult<Vec<Node>> {
        self.store.get_chat_messages(chat_id, None, 0, true).await
    }

    /// The last `n` visible (non-internal) messages. If a summary checkpoint
    /// falls inside that window, the window starts at the checkpoint instead:
    /// the summary stands in for everything older.
    pub async fn get_recent_messages(&self, chat_id: &str, n: usize) -> CoreResult<Vec<Node>> {
        let all = self.load_all(chat_id).await?;
        let visible: Vec<Node> = all
            .into_iter()
            .filter(|m| !Self::is_internal(m))
            .filter(|m| {
                matches!(
                    Self::message_kind(m),
                    ChatMessageKind::Message | ChatMessageKind::Summary
                )
            })
            .collect();

        let start = visible.len().saturating_sub(n);
        let window = &visible[start..];
        if let Some(pos) = window
            .iter()
            .rposition(|m| Self::message_kind(m) == ChatMessageKind::Summary)
        {
            return Ok(window[pos..].to_vec());
        }
        Ok(window.to_vec())
    }

    /// Walk messages newest-to-oldest accumulating estimated tokens until the
    /// budget is reached. With `prefer_summaries`, a summary checkpoint is
    /// included (budget permitting) and the walk stops there — it stands in
    /// for everything earlier. Returns oldest-first.
    pub async fn get_messages_within_token_limit(
        &self,
        chat_id: &str,
        max_tokens: u64,
        prefer_summaries: bool,
    ) -> CoreResult<Vec<Node>> {
        let all = self.load_all(chat_id).await?;
        let mut selected: Vec<Node> = Vec::new();
        let mut used: u64 = 0;

        for node in all.into_iter().rev() {
            let cost = self.estimate_message_tokens(&node);
            let is_summary = Self::message_kind(&node) == ChatMessageKind::Summary;
            if used + cost > max_tokens {
                break;
            }
            used += cost;
            selected.push(node);
            if is_summary && prefer_summaries {
                break;
            }
        }

        selected.reverse();
        Ok(selected)
    }

    /// Estimated total tokens of everything after the newest summary
    /// checkpoint (the whole chat when no checkpoint exists).
    pub async fn estimate_tokens_since_summary(&self, chat_id: &str) -> CoreResult<u64> {
        let all = self.load_all(chat_id).await?;
        let start = all
            .iter()
            .rposition(|m| Self::message_kind(m) == ChatMessageKind::Summary)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        Ok(all[start..]
            .iter()
            .map(|m| self.estimate_message_tokens(m))
            .sum())
    }

    /// Plain-text transcript of the conversation since the last summary,
    /// suitable as summarization input. Internal bootstrap messages and tool
    /// plumbing are left out.
    pub async fn format_for_summary(&self, chat_id: &str) -> CoreResult<String> {
        let all = self.load_all(chat_id).await?;
        let start = all
            .iter()
            .rposition(|m| Self::message_kind(m) == ChatMessageKind::Summary)
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let mut lines = Vec::new();
        for node in &all[start..] {
            if Self::is_internal(node) {
                continue;
            }
            if Self::message_kind(node) != ChatMessageKind::Message {
                continue;
            }
            let role = node.property_str("role").unwrap_or("user");
            let content = node.content.as_deref().unwrap_or("");
            lines.push(format!("{}: {}", role, content));
        }
        Ok(lines.join("\n"))
    }

    /// The newest summary checkpoint of a chat, if any.
    pub async fn latest_summary(&self, chat_id: &str) -> CoreResult<Option<Node>> {
        let all = self.load_all(chat_id).await?;
        Ok(all
            .into_iter()
            .rev()
            .find(|m| Self::message_kind(m) == ChatMessageKind::Summary))
    }
}

// Conversion helper used by the orchestrator to rebuild provider history.
pub fn node_to_chat_message(node: &Node) -> vigil::chat::ChatMessage {
    let role = node
        .property_str("role")
        .and_then(|r| ChatRole::from_str(r).ok())
        .unwrap_or(ChatRole::User);
    let content = node.content.clone().unwrap_or_default();
    match role {
        ChatRole::User => vigil::chat::ChatMessage::user().content(content).build(),
        ChatRole::Model => vigil::chat::ChatMessage::model().content(content).build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteKnowledgeStore;

    async fn service() -> (MessageService, Arc<dyn KnowledgeStore>) {
        let store: Arc<dyn KnowledgeStore> =
            Arc::new(SqliteKnowledgeStore::connect_in_memory().await.unwrap());
        store.create_chat("c1", "ada", "test chat").await.unwrap();
        (MessageService::new(store.clone()), store)
    }

    fn user_message(content: &str) -> SaveMessage {
        SaveMessage::new("c1", content, ChatRole::User, ChatMessageKind::Message)
    }

    fn model_message(content: &str) -> SaveMessage {
        SaveMessage::new("c1", content, ChatRole::Model, ChatMessageKind::Message)
    }

    #[test]
    fn character_estimator_is_ceil_len_over_four() {
        let estimator = CharacterBasedEstimator::default();
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
        assert_eq!(estimator.estimate(&"x".repeat(400)), 100);
    }

    #[tokio::test]
    async fn save_message_links_into_chat_with_properties() {
        let (service, store) = service().await;
        let node = service
            .save_message(user_message("hello world"))
            .await
            .unwrap();

        assert_eq!(node.property_str("role"), Some("user"));
        assert_eq!(node.property_str("message_type"), Some("message"));
        assert!(!node.property_bool("internal"));

        let edges = store
            .get_edges(Some("chat:c1"), Some(node.id.as_str()), Some(EdgeType::Contains))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[tokio::test]
    async fn tool_messages_carry_name_and_args_as_properties() {
        let (service, _) = service().await;
        let node = service
            .save_message(
                SaveMessage::new("c1", "calling add", ChatRole::Model, ChatMessageKind::ToolUse)
                    .tool("add", serde_json::json!({"a": 2, "b": 3})),
            )
            .await
            .unwrap();

        assert_eq!(node.property_str("tool_name"), Some("add"));
        assert_eq!(node.properties["tool_args"]["a"], 2);
    }

    #[tokio::test]
    async fn recent_messages_prefer_the_summary_checkpoint() {
        let (service, _) = service().await;
        for i in 0..4 {
            service
                .save_message(user_message(&format!("old {}", i)))
                .await
                .unwrap();
        }
        service
            .save_message(SaveMessage::new(
                "c1",
                "summary of the past",
                ChatRole::Model,
                ChatMessageKind::Summary,
            ))
            .await
            .unwrap();
        service.save_message(user_message("new question")).await.unwrap();
        service.save_message(model_message("new answer")).await.unwrap();

        let recent = service.get_recent_messages("c1", 10).await.unwrap();
        // Summary + everything after it; nothing older.
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content.as_deref(), Some("summary of the past"));
        assert!(recent
            .iter()
            .all(|m| m.content.as_deref() != Some("old 0")));
    }

    #[tokio::test]
    async fn token_limit_walk_never_exceeds_budget() {
        let (service, _) = service().await;
        for i in 0..10 {
            service
                .save_message(user_message(&format!("message number {}", i)))
                .await
                .unwrap();
        }

        let budget = 40;
        let window = service
            .get_messages_within_token_limit("c1", budget, true)
            .await
            .unwrap();
        assert!(!window.is_empty());
        let spent: u64 = window
            .iter()
            .map(|m| service.estimate_message_tokens(m))
            .sum();
        assert!(spent <= budget, "{} > {}", spent, budget);

        // Oldest-first ordering, and it is the newest slice of the chat.
        let last = window.last().unwrap();
        assert_eq!(last.content.as_deref(), Some("message number 9"));
    }

    #[tokio::test]
    async fn token_limit_walk_stops_at_summary() {
        let (service, _) = service().await;
        for i in 0..5 {
            service
                .save_message(user_message(&format!("ancient {}", i)))
                .await
                .unwrap();
        }
        service
            .save_message(SaveMessage::new(
                "c1",
                "checkpoint",
                ChatRole::Model,
                ChatMessageKind::Summary,
            ))
            .await
            .unwrap();
        service.save_message(user_message("fresh")).await.unwrap();

        let window = service
            .get_messages_within_token_limit("c1", 1_000_000, true)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content.as_deref(), Some("checkpoint"));
        assert_eq!(window[1].content.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn format_for_summary_covers_only_post_checkpoint_visible_turns() {
        let (service, _) = service().await;
        service.save_message(user_message("before")).await.unwrap();
        service
            .save_message(SaveMessage::new(
                "c1",
                "old summary",
                ChatRole::Model,
                ChatMessageKind::Summary,
            ))
            .await
            .unwrap();
        service
            .save_message(user_message("what is 2+2?"))
            .await
            .unwrap();
        service
            .save_message(
                SaveMessage::new("c1", "bootstrap", ChatRole::User, ChatMessageKind::Internal)
                    .internal(),
            )
            .await
            .unwrap();
        service.save_message(model_message("4")).await.unwrap();

        let transcript = service.format_for_summary("c1").await.unwrap();
        assert_eq!(transcript, "user: what is 2+2?\nmodel: 4");
    }

    #[tokio::test]
    async fn tokens_since_summary_reset_at_checkpoint() {
        let (service, _) = service().await;
        service
            .save_message(user_message(&"long ".repeat(100)))
            .await
            .unwrap();
        let before = service.estimate_tokens_since_summary("c1").await.unwrap();
        assert!(before > 100);

        service
            .save_message(SaveMessage::new(
                "c1",
                "s",
                ChatRole::Model,
                ChatMessageKind::Summary,
            ))
            .await
            .unwrap();
        let after = service.estimate_tokens_since_summary("c1").await.unwrap();
        assert_eq!(after, 0);
    }
}
