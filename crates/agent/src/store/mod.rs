//! Persistent typed-graph store.
//!
//! [`KnowledgeStore`] is the single serialization point for graph writes; the
//! SQLite implementation lives in [`sqlite`]. Callers never see SQL — they
//! speak nodes, edges and the chat specializations.

mod schema;
mod sqlite;

pub use sqlite::SqliteKnowledgeStore;

use async_trait::async_trait;
use serde_json::Value;

use vigil::error::CoreResult;

use crate::domain::{ChatSummary, Edge, EdgeType, Node, NodeType, Properties};

/// Insert payload for a node. `add_node` upserts by id: an existing row gets
/// its properties merged and `updated_at` advanced; `id` is immutable.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    pub content: Option<String>,
    pub properties: Properties,
    pub embedding: Option<Vec<f32>>,
}

impl NewNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            label: label.into(),
            content: None,
            properties: Properties::new(),
            embedding: None,
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Partial update for a node; `properties` merges key-wise.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub label: Option<String>,
    pub content: Option<String>,
    pub properties: Option<Properties>,
    pub embedding: Option<Vec<f32>>,
}

/// Insert payload for an edge; upserts by `(source, target, type)`.
#[derive(Debug, Clone)]
pub struct NewEdge {
    pub source_id: String,
    pub target_id: String,
    pub edge_type: EdgeType,
    pub properties: Properties,
}

impl NewEdge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: EdgeType,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type,
            properties: Properties::new(),
        }
    }
}

/// Per-record outcome report for bulk operations. Errors never abort the
/// batch; they are collected here instead.
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub added: u64,
    pub updated: u64,
    pub failed: Vec<(String, String)>,
}

/// Transactional typed-graph store contract.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn add_node(&self, node: NewNode) -> CoreResult<Node>;
    async fn get_node(&self, id: &str) -> CoreResult<Option<Node>>;
    async fn update_node(&self, id: &str, patch: NodePatch) -> CoreResult<Node>;
    /// Delete a node; its edges cascade. Idempotent: a missing id succeeds.
    async fn delete_node(&self, id: &str) -> CoreResult<()>;

    async fn add_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeType,
        properties: Properties,
    ) -> CoreResult<Edge>;
    async fn get_edges(
        &self,
        source_id: Option<&str>,
        target_id: Option<&str>,
        edge_type: Option<EdgeType>,
    ) -> CoreResult<Vec<Edge>>;

    /// Full-text search over the weighted projection
    /// (`label > content > type > properties`), newest first when no query
    /// text is given. Returns the page plus the total match count.
    async fn search_nodes(
        &self,
        node_type: Option<NodeType>,
        text_query: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> CoreResult<(Vec<Node>, u64)>;

    /// Cosine-similarity search over stored embeddings.
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        type_filter: Option<NodeType>,
    ) -> CoreResult<Vec<(Node, f32)>>;

    /// Atomically set `key` to `new_value` iff its current value equals
    /// `expected`. Returns whether the swap happened. This is the claim
    /// primitive behind single-winner task dispatch.
    async fn cas_node_property(
        &self,
        id: &str,
        key: &str,
        expected: &Value,
        new_value: &Value,
    ) -> CoreResult<bool>;

    // Chat specializations.

    async fn create_chat(&self, chat_id: &str, user_id: &str, name: &str) -> CoreResult<Node>;
    async fn get_user_chats(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
        include_archived: bool,
    ) -> CoreResult<Vec<ChatSummary>>;
    /// Messages of a chat in insertion order. With `use_session_fallback`,
    /// a chat with no linked messages falls back to messages linked from the
    /// pre-migration session node of the same id.
    async fn get_chat_messages(
        &self,
        chat_id: &str,
        limit: Option<u32>,
        offset: u32,
        use_session_fallback: bool,
    ) -> CoreResult<Vec<Node>>;
    async fn archive_chat(&self, chat_id: &str) -> CoreResult<()>;
    async fn unarchive_chat(&self, chat_id: &str) -> CoreResult<()>;
    async fn update_chat_name(&self, chat_id: &str, name: &str) -> CoreResult<()>;
    /// Delete a chat and, by ownership cascade, all its messages.
    async fn delete_chat(&self, chat_id: &str) -> CoreResult<()>;

    // Bulk operations; per-record errors are reported, not fatal.

    async fn bulk_add_nodes(&self, nodes: Vec<NewNode>) -> CoreResult<BulkReport>;
    async fn bulk_add_edges(&self, edges: Vec<NewEdge>) -> CoreResult<BulkReport>;
}
