//! SQLite implementation of [`KnowledgeStore`].
//!
//! A single connection behind `Arc<Mutex<_>>`; every operation runs on the
//! blocking pool so the async runtime is never stalled by disk I/O. The lock
//! is held only for the duration of one statement or transaction, which also
//! makes it the write-serialization point the rest of the runtime relies on.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use time::OffsetDateTime;

use vigil::error::{CoreError, CoreResult};

use super::schema;
use super::{BulkReport, KnowledgeStore, NewEdge, NewNode, NodePatch};
use crate::domain::{
    prefixed_id, ChatSummary, Edge, EdgeType, Node, NodeType, Properties,
};

/// Default embedding dimensionality; writes with any other length fail with
/// a schema error.
pub const DEFAULT_EMBEDDING_DIM: usize = 768;

#[derive(Clone)]
pub struct SqliteKnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    embedding_dim: usize,
}

fn now_micros() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}

fn micros_to_time(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos((micros as i128) * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Escape user text into an FTS5 query: each whitespace-separated term is
/// quoted so operators and punctuation cannot break the parse.
fn fts_query(text: &str) -> String {
    text.split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

const NODE_COLUMNS: &str = "id, type, label, content, properties, embedding, created_at, updated_at";

fn row_to_node(row: &rusqlite::Row<'_>) -> Result<Node, rusqlite::Error> {
    let type_str: String = row.get(1)?;
    let node_type = NodeType::from_str(&type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let properties_json: String = row.get(4)?;
    let properties: Properties = serde_json::from_str(&properties_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let embedding: Option<Vec<u8>> = row.get(5)?;

    Ok(Node {
        id: row.get(0)?,
        node_type,
        label: row.get(2)?,
        content: row.get(3)?,
        properties,
        embedding: embedding.map(|blob| blob_to_embedding(&blob)),
        created_at: micros_to_time(row.get(6)?),
        updated_at: micros_to_time(row.get(7)?),
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> Result<Edge, rusqlite::Error> {
    let type_str: String = row.get(2)?;
    let edge_type = EdgeType::from_str(&type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let properties_json: String = row.get(3)?;
    let properties: Properties = serde_json::from_str(&properties_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Edge {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        edge_type,
        properties,
        created_at: micros_to_time(row.get(4)?),
    })
}

/// Upsert a node inside an open transaction. Returns (node, was_insert).
fn upsert_node_tx(
    tx: &Transaction<'_>,
    node: &NewNode,
    embedding_dim: usize,
) -> CoreResult<(Node, bool)> {
    if let Some(embedding) = &node.embedding {
        if embedding.len() != embedding_dim {
            return Err(CoreError::Schema(format!(
                "embedding for '{}' has dimension {}, expected {}",
                node.id,
                embedding.len(),
                embedding_dim
            )));
        }
    }

    let now = now_micros();
    let existing: Option<(String, i64)> = tx
        .query_row(
            "SELECT properties, updated_at FROM nodes WHERE id = ?1",
            params![node.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;

    let was_insert = existing.is_none();
    match existing {
        None => {
            let properties_json = serde_json::to_string(&node.properties)?;
            tx.execute(
                "INSERT INTO nodes (id, type, label, content, properties, embedding, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    node.id,
                    node.node_type.as_str(),
                    node.label,
                    node.content,
                    properties_json,
                    node.embedding.as_deref().map(embedding_to_blob),
                    now,
                ],
            )
            .map_err(db_err)?;
        }
        Some((properties_json, prev_updated)) => {
            // Merge: incoming keys override, everything else is preserved.
            let mut merged: Properties = serde_json::from_str(&properties_json)?;
            for (key, value) in &node.properties {
                merged.insert(key.clone(), value.clone());
            }
            // `updated_at` must advance strictly even within one microsecond.
            let updated_at = now.max(prev_updated + 1);
            tx.execute(
                "UPDATE nodes SET type = ?2, label = ?3,
                        content = coalesce(?4, content),
                        properties = ?5,
                        embedding = coalesce(?6, embedding),
                        updated_at = ?7
                 WHERE id = ?1",
                params![
                    node.id,
                    node.node_type.as_str(),
                    node.label,
                    node.content,
                    serde_json::to_string(&merged)?,
                    node.embedding.as_deref().map(embedding_to_blob),
                    updated_at,
                ],
            )
            .map_err(db_err)?;
        }
    }

    let stored = tx
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![node.id],
            row_to_node,
        )
        .map_err(db_err)?;
    Ok((stored, was_insert))
}

/// Upsert an edge inside an open transaction; a duplicate triple updates
/// properties in place.
fn upsert_edge_tx(tx: &Transaction<'_>, edge: &NewEdge) -> CoreResult<Edge> {
    let properties_json = serde_json::to_string(&edge.properties)?;
    tx.execute(
        "INSERT INTO edges (source_id, target_id, type, properties, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(source_id, target_id, type)
         DO UPDATE SET properties = excluded.properties",
        params![
            edge.source_id,
            edge.target_id,
            edge.edge_type.as_str(),
            properties_json,
            now_micros(),
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CoreError::Schema(format!(
                "edge ({} -> {} [{}]) references a missing node",
                edge.source_id, edge.target_id, edge.edge_type
            ))
        }
        other => db_err(other),
    })?;

    tx.query_row(
        "SELECT source_id, target_id, type, properties, created_at FROM edges
         WHERE source_id = ?1 AND target_id = ?2 AND type = ?3",
        params![edge.source_id, edge.target_id, edge.edge_type.as_str()],
        row_to_edge,
    )
    .map_err(db_err)
}

fn db_err(err: rusqlite::Error) -> CoreError {
    CoreError::Internal(format!("database operation failed: {}", err))
}

impl SqliteKnowledgeStore {
    pub async fn connect(path: std::path::PathBuf) -> CoreResult<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let mut conn = Connection::open(&path)?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            schema::init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("failed to spawn blocking task: {}", e)))?
        .map_err(db_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub async fn connect_in_memory() -> CoreResult<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, rusqlite::Error> {
            let mut conn = Connection::open_in_memory()?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            schema::init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("failed to spawn blocking task: {}", e)))?
        .map_err(db_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        })
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    async fn run_blocking<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut Connection) -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn_arc = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn_arc.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("task execution failed: {}", e)))?
    }

    fn chat_node_id(chat_id: &str) -> String {
        prefixed_id("chat", chat_id)
    }

    fn user_node_id(user_id: &str) -> String {
        prefixed_id("user", user_id)
    }
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn add_node(&self, node: NewNode) -> CoreResult<Node> {
        let dim = self.embedding_dim;
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let (stored, _) = upsert_node_tx(&tx, &node, dim)?;
            tx.commit().map_err(db_err)?;
            Ok(stored)
        })
        .await
    }

    async fn get_node(&self, id: &str) -> CoreResult<Option<Node>> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id],
                row_to_node,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn update_node(&self, id: &str, patch: NodePatch) -> CoreResult<Node> {
        let id = id.to_string();
        let dim = self.embedding_dim;
        self.run_blocking(move |conn| {
            if let Some(embedding) = &patch.embedding {
                if embedding.len() != dim {
                    return Err(CoreError::Schema(format!(
                        "embedding for '{}' has dimension {}, expected {}",
                        id,
                        embedding.len(),
                        dim
                    )));
                }
            }

            let tx = conn.transaction().map_err(db_err)?;
            let current = tx
                .query_row(
                    "SELECT properties, updated_at FROM nodes WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((properties_json, prev_updated)) = current else {
                return Err(CoreError::NotFound(format!("node '{}' not found", id)));
            };

            let mut merged: Properties = serde_json::from_str(&properties_json)?;
            if let Some(props) = &patch.properties {
                for (key, value) in props {
                    merged.insert(key.clone(), value.clone());
                }
            }
            let updated_at = now_micros().max(prev_updated + 1);
            tx.execute(
                "UPDATE nodes SET label = coalesce(?2, label),
                        content = coalesce(?3, content),
                        properties = ?4,
                        embedding = coalesce(?5, embedding),
                        updated_at = ?6
                 WHERE id = ?1",
                params![
                    id,
                    patch.label,
                    patch.content,
                    serde_json::to_string(&merged)?,
                    patch.embedding.as_deref().map(embedding_to_blob),
                    updated_at,
                ],
            )
            .map_err(db_err)?;

            let stored = tx
                .query_row(
                    &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                    params![id],
                    row_to_node,
                )
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(stored)
        })
        .await
    }

    async fn delete_node(&self, id: &str) -> CoreResult<()> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn add_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeType,
        properties: Properties,
    ) -> CoreResult<Edge> {
        let edge = NewEdge {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            edge_type,
            properties,
        };
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let stored = upsert_edge_tx(&tx, &edge)?;
            tx.commit().map_err(db_err)?;
            Ok(stored)
        })
        .await
    }

    async fn get_edges(
        &self,
        source_id: Option<&str>,
        target_id: Option<&str>,
        edge_type: Option<EdgeType>,
    ) -> CoreResult<Vec<Edge>> {
        let source = source_id.map(str::to_string);
        let target = target_id.map(str::to_string);
        self.run_blocking(move |conn| {
            let mut sql = String::from(
                "SELECT source_id, target_id, type, properties, created_at FROM edges WHERE 1=1",
            );
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(source) = &source {
                sql.push_str(" AND source_id = ?");
                args.push(Box::new(source.clone()));
            }
            if let Some(target) = &target {
                sql.push_str(" AND target_id = ?");
                args.push(Box::new(target.clone()));
            }
            if let Some(edge_type) = edge_type {
                sql.push_str(" AND type = ?");
                args.push(Box::new(edge_type.as_str().to_string()));
            }
            sql.push_str(" ORDER BY created_at ASC, id ASC");

            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), row_to_edge)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
        .await
    }

    async fn search_nodes(
        &self,
        node_type: Option<NodeType>,
        text_query: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> CoreResult<(Vec<Node>, u64)> {
        let query = text_query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(fts_query);
        self.run_blocking(move |conn| match query {
            Some(match_expr) => {
                let (sql, count_sql) = match node_type {
                    Some(_) => (
                        format!(
                            "SELECT {cols} FROM nodes_fts
                             JOIN nodes n ON n.rowid = nodes_fts.rowid
                             WHERE nodes_fts MATCH ?1 AND n.type = ?2
                             ORDER BY bm25(nodes_fts, 0.0, 4.0, 2.0, 1.0, 0.5)
                             LIMIT ?3 OFFSET ?4",
                            cols = "n.id, n.type, n.label, n.content, n.properties, n.embedding, n.created_at, n.updated_at"
                        ),
                        "SELECT count(*) FROM nodes_fts
                         JOIN nodes n ON n.rowid = nodes_fts.rowid
                         WHERE nodes_fts MATCH ?1 AND n.type = ?2"
                            .to_string(),
                    ),
                    None => (
                        format!(
                            "SELECT {cols} FROM nodes_fts
                             JOIN nodes n ON n.rowid = nodes_fts.rowid
                             WHERE nodes_fts MATCH ?1
                             ORDER BY bm25(nodes_fts, 0.0, 4.0, 2.0, 1.0, 0.5)
                             LIMIT ?2 OFFSET ?3",
                            cols = "n.id, n.type, n.label, n.content, n.properties, n.embedding, n.created_at, n.updated_at"
                        ),
                        "SELECT count(*) FROM nodes_fts
                         JOIN nodes n ON n.rowid = nodes_fts.rowid
                         WHERE nodes_fts MATCH ?1"
                            .to_string(),
                    ),
                };

                let (nodes, total) = match node_type {
                    Some(t) => {
                        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
                        let nodes = stmt
                            .query_map(
                                params![match_expr, t.as_str(), limit, offset],
                                row_to_node,
                            )
                            .map_err(db_err)?
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(db_err)?;
                        let total: u64 = conn
                            .query_row(&count_sql, params![match_expr, t.as_str()], |row| {
                                row.get(0)
                            })
                            .map_err(db_err)?;
                        (nodes, total)
                    }
                    None => {
                        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
                        let nodes = stmt
                            .query_map(params![match_expr, limit, offset], row_to_node)
                            .map_err(db_err)?
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(db_err)?;
                        let total: u64 = conn
                            .query_row(&count_sql, params![match_expr], |row| row.get(0))
                            .map_err(db_err)?;
                        (nodes, total)
                    }
                };
                Ok((nodes, total))
            }
            None => {
                let (nodes, total) = match node_type {
                    Some(t) => {
                        let mut stmt = conn
                            .prepare(&format!(
                                "SELECT {NODE_COLUMNS} FROM nodes WHERE type = ?1
                                 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
                            ))
                            .map_err(db_err)?;
                        let nodes = stmt
                            .query_map(params![t.as_str(), limit, offset], row_to_node)
                            .map_err(db_err)?
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(db_err)?;
                        let total: u64 = conn
                            .query_row(
                                "SELECT count(*) FROM nodes WHERE type = ?1",
                                params![t.as_str()],
                                |row| row.get(0),
                            )
                            .map_err(db_err)?;
                        (nodes, total)
                    }
                    None => {
                        let mut stmt = conn
                            .prepare(&format!(
                                "SELECT {NODE_COLUMNS} FROM nodes
                                 ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
                            ))
                            .map_err(db_err)?;
                        let nodes = stmt
                            .query_map(params![limit, offset], row_to_node)
                            .map_err(db_err)?
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(db_err)?;
                        let total: u64 = conn
                            .query_row("SELECT count(*) FROM nodes", [], |row| row.get(0))
                            .map_err(db_err)?;
                        (nodes, total)
                    }
                };
                Ok((nodes, total))
            }
        })
        .await
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        type_filter: Option<NodeType>,
    ) -> CoreResult<Vec<(Node, f32)>> {
        if embedding.len() != self.embedding_dim {
            return Err(CoreError::Schema(format!(
                "query embedding has dimension {}, expected {}",
                embedding.len(),
                self.embedding_dim
            )));
        }
        let query = embedding.to_vec();
        self.run_blocking(move |conn| {
            let sql = match type_filter {
                Some(_) => format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE embedding IS NOT NULL AND type = ?1"
                ),
                None => format!("SELECT {NODE_COLUMNS} FROM nodes WHERE embedding IS NOT NULL"),
            };
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let candidates = match type_filter {
                Some(t) => stmt
                    .query_map(params![t.as_str()], row_to_node)
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?,
                None => stmt
                    .query_map([], row_to_node)
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?,
            };

            let mut scored: Vec<(Node, f32)> = candidates
                .into_iter()
                .filter_map(|node| {
                    let score = node
                        .embedding
                        .as_ref()
                        .map(|e| cosine_similarity(&query, e))?;
                    Some((node, score))
                })
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
            Ok(scored)
        })
        .await
    }

    async fn cas_node_property(
        &self,
        id: &str,
        key: &str,
        expected: &Value,
        new_value: &Value,
    ) -> CoreResult<bool> {
        let id = id.to_string();
        let key = key.to_string();
        let expected = expected.clone();
        let new_value = new_value.clone();
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let current = tx
                .query_row(
                    "SELECT properties, updated_at FROM nodes WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((properties_json, prev_updated)) = current else {
                return Ok(false);
            };
            let mut properties: Properties = serde_json::from_str(&properties_json)?;
            if properties.get(&key) != Some(&expected) {
                return Ok(false);
            }
            properties.insert(key, new_value);
            tx.execute(
                "UPDATE nodes SET properties = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id,
                    serde_json::to_string(&properties)?,
                    now_micros().max(prev_updated + 1)
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(true)
        })
        .await
    }

    async fn create_chat(&self, chat_id: &str, user_id: &str, name: &str) -> CoreResult<Node> {
        let chat_node_id = Self::chat_node_id(chat_id);
        let user_node_id = Self::user_node_id(user_id);
        let name = name.to_string();
        let user_label = user_id.to_string();
        let dim = self.embedding_dim;
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let user = NewNode::new(&user_node_id, NodeType::User, &user_label);
            upsert_node_tx(&tx, &user, dim)?;
            let chat = NewNode::new(&chat_node_id, NodeType::Chat, &name)
                .property("archived", Value::Bool(false));
            let (stored, _) = upsert_node_tx(&tx, &chat, dim)?;
            upsert_edge_tx(
                &tx,
                &NewEdge::new(&chat_node_id, &user_node_id, EdgeType::BelongsTo),
            )?;
            tx.commit().map_err(db_err)?;
            Ok(stored)
        })
        .await
    }

    async fn get_user_chats(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
        include_archived: bool,
    ) -> CoreResult<Vec<ChatSummary>> {
        let user_node_id = Self::user_node_id(user_id);
        self.run_blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT n.id, n.label, n.properties, n.updated_at,
                            (SELECT count(*) FROM edges m
                              WHERE m.source_id = n.id AND m.type = 'CONTAINS') AS message_count
                     FROM nodes n
                     JOIN edges e ON e.source_id = n.id AND e.type = 'BELONGS_TO'
                     WHERE e.target_id = ?1 AND n.type = 'Chat'
                     ORDER BY n.updated_at DESC
                     LIMIT ?2 OFFSET ?3",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![user_node_id, limit, offset], |row| {
                    let properties_json: String = row.get(2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        properties_json,
                        row.get::<_, i64>(3)?,
                        row.get::<_, u64>(4)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let mut chats = Vec::new();
            for (id, label, properties_json, updated_at, message_count) in rows {
                let properties: Properties =
                    serde_json::from_str(&properties_json).unwrap_or_default();
                let archived = properties
                    .get("archived")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if archived && !include_archived {
                    continue;
                }
                chats.push(ChatSummary {
                    chat_id: id,
                    name: label,
                    archived,
                    message_count,
                    updated_at: micros_to_time(updated_at),
                });
            }
            Ok(chats)
        })
        .await
    }

    async fn get_chat_messages(
        &self,
        chat_id: &str,
        limit: Option<u32>,
        offset: u32,
        use_session_fallback: bool,
    ) -> CoreResult<Vec<Node>> {
        let chat_node_id = Self::chat_node_id(chat_id);
        // Pre-migration rows linked messages from a session node carrying the
        // bare id; the fallback path reads those.
        let session_source = chat_id.to_string();
        self.run_blocking(move |conn| {
            let fetch = |conn: &Connection, source: &str| -> CoreResult<Vec<Node>> {
                let sql = format!(
                    "SELECT {cols} FROM nodes n
                     JOIN edges e ON e.target_id = n.id AND e.type = 'CONTAINS'
                     WHERE e.source_id = ?1 AND n.type = 'ChatMessage'
                     ORDER BY n.created_at ASC, n.rowid ASC
                     LIMIT ?2 OFFSET ?3",
                    cols = "n.id, n.type, n.label, n.content, n.properties, n.embedding, n.created_at, n.updated_at"
                );
                let mut stmt = conn.prepare(&sql).map_err(db_err)?;
                let rows = stmt
                    .query_map(
                        params![source, limit.map(i64::from).unwrap_or(-1), offset],
                        row_to_node,
                    )
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                Ok(rows)
            };

            let messages = fetch(conn, &chat_node_id)?;
            if messages.is_empty() && use_session_fallback && session_source != chat_node_id {
                return fetch(conn, &session_source);
            }
            Ok(messages)
        })
        .await
    }

    async fn archive_chat(&self, chat_id: &str) -> CoreResult<()> {
        self.update_node(
            &Self::chat_node_id(chat_id),
            NodePatch {
                properties: Some(Properties::from([(
                    "archived".to_string(),
                    Value::Bool(true),
                )])),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    async fn unarchive_chat(&self, chat_id: &str) -> CoreResult<()> {
        self.update_node(
            &Self::chat_node_id(chat_id),
            NodePatch {
                properties: Some(Properties::from([(
                    "archived".to_string(),
                    Value::Bool(false),
                )])),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    async fn update_chat_name(&self, chat_id: &str, name: &str) -> CoreResult<()> {
        self.update_node(
            &Self::chat_node_id(chat_id),
            NodePatch {
                label: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    async fn delete_chat(&self, chat_id: &str) -> CoreResult<()> {
        let chat_node_id = Self::chat_node_id(chat_id);
        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            // Ownership cascade: a chat's messages die with it.
            tx.execute(
                "DELETE FROM nodes WHERE id IN (
                    SELECT target_id FROM edges
                    WHERE source_id = ?1 AND type = 'CONTAINS'
                ) AND type = 'ChatMessage'",
                params![chat_node_id],
            )
            .map_err(db_err)?;
            tx.execute("DELETE FROM nodes WHERE id = ?1", params![chat_node_id])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn bulk_add_nodes(&self, nodes: Vec<NewNode>) -> CoreResult<BulkReport> {
        let dim = self.embedding_dim;
        self.run_blocking(move |conn| {
            let mut report = BulkReport::default();
            for node in nodes {
                let id = node.id.clone();
                let tx = match conn.transaction() {
                    Ok(tx) => tx,
                    Err(e) => {
                        report.failed.push((id, e.to_string()));
                        continue;
                    }
                };
                match upsert_node_tx(&tx, &node, dim).and_then(|r| {
                    tx.commit().map_err(db_err)?;
                    Ok(r)
                }) {
                    Ok((_, true)) => report.added += 1,
                    Ok((_, false)) => report.updated += 1,
                    Err(e) => report.failed.push((id, e.to_string())),
                }
            }
            Ok(report)
        })
        .await
    }

    async fn bulk_add_edges(&self, edges: Vec<NewEdge>) -> CoreResult<BulkReport> {
        self.run_blocking(move |conn| {
            let mut report = BulkReport::default();
            for edge in edges {
                let key = format!("{}->{}", edge.source_id, edge.target_id);
                let tx = match conn.transaction() {
                    Ok(tx) => tx,
                    Err(e) => {
                        report.failed.push((key, e.to_string()));
                        continue;
                    }
                };
                match upsert_edge_tx(&tx, &edge).and_then(|r| {
                    tx.commit().map_err(db_err)?;
                    Ok(r)
                }) {
                    Ok(_) => report.added += 1,
                    Err(e) => report.failed.push((key, e.to_string())),
                }
            }
            Ok(report)
        })
        .await
    }
}
