//! Identity block assembly.
//!
//! The orchestrator injects a compact persona prompt derived from stored
//! knowledge. Identity lives in `Memory` nodes flagged `identity=true`; when
//! none exist the agent falls back to a neutral default so a fresh store
//! still boots.

use std::sync::Arc;

use vigil::error::CoreResult;
use vigil::provider::ModelProvider;

use crate::domain::NodeType;
use crate::store::KnowledgeStore;

const DEFAULT_IDENTITY: &str =
    "## Identity\n\nYou are a proactive background agent that maintains a knowledge graph \
     of everything it learns and acts on scheduled and queued tasks autonomously.";

const SUMMARIZE_IDENTITY_PROMPT: &str = "Summarize the following identity document into a \
     concise paragraph, retaining the core concepts, purpose, and values:\n\n";

#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn KnowledgeStore>,
}

impl IdentityService {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store }
    }

    /// Assemble the full identity document from `Memory{identity=true}`
    /// nodes, newest last so later memories refine earlier ones.
    pub async fn get_identity_memory(&self) -> CoreResult<String> {
        let (nodes, _) = self
            .store
            .search_nodes(Some(NodeType::Memory), None, 200, 0)
            .await?;

        let mut sections: Vec<(time::OffsetDateTime, String)> = nodes
            .into_iter()
            .filter(|n| n.property_bool("identity"))
            .map(|n| {
                let body = n.content.unwrap_or_default();
                (n.created_at, format!("## {}\n\n{}", n.label, body))
            })
            .collect();

        if sections.is_empty() {
            return Ok(DEFAULT_IDENTITY.to_string());
        }
        sections.sort_by_key(|(created_at, _)| *created_at);
        Ok(sections
            .into_iter()
            .map(|(_, section)| section)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    /// Reduce the identity document to a compact system-prompt paragraph.
    /// A provider failure falls back to the raw document so the chat can
    /// still start.
    pub async fn summarize_identity(
        &self,
        identity_memory: &str,
        provider: &dyn ModelProvider,
    ) -> CoreResult<String> {
        let prompt = format!("{}{}", SUMMARIZE_IDENTITY_PROMPT, identity_memory);
        match provider.generate(&prompt).await {
            Ok(summary) if !summary.trim().is_empty() => Ok(summary),
            Ok(_) => {
                log::warn!("identity summarization returned empty text, using raw document");
                Ok(identity_memory.to_string())
            }
            Err(err) => {
                log::error!("identity summarization failed: {}", err);
                Ok(identity_memory.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewNode, SqliteKnowledgeStore};
    use crate::test_utils::ScriptedProvider;
    use serde_json::json;

    async fn store() -> Arc<dyn KnowledgeStore> {
        Arc::new(SqliteKnowledgeStore::connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn empty_store_yields_default_identity() {
        let service = IdentityService::new(store().await);
        let identity = service.get_identity_memory().await.unwrap();
        assert!(identity.contains("proactive background agent"));
    }

    #[tokio::test]
    async fn identity_memories_are_concatenated_in_creation_order() {
        let store = store().await;
        store
            .add_node(
                NewNode::new("memory:core", NodeType::Memory, "Core values")
                    .content("Curiosity first.")
                    .property("identity", json!(true)),
            )
            .await
            .unwrap();
        store
            .add_node(
                NewNode::new("memory:other", NodeType::Memory, "Not identity")
                    .content("irrelevant"),
            )
            .await
            .unwrap();
        store
            .add_node(
                NewNode::new("memory:style", NodeType::Memory, "Voice")
                    .content("Terse and precise.")
                    .property("identity", json!(true)),
            )
            .await
            .unwrap();

        let service = IdentityService::new(store);
        let identity = service.get_identity_memory().await.unwrap();
        assert!(identity.contains("Curiosity first."));
        assert!(identity.contains("Terse and precise."));
        assert!(!identity.contains("irrelevant"));
        assert!(identity.find("Curiosity").unwrap() < identity.find("Terse").unwrap());
    }

    #[tokio::test]
    async fn summarize_falls_back_to_raw_document_on_provider_failure() {
        let service = IdentityService::new(store().await);
        let provider = ScriptedProvider::failing("model offline");
        let summary = service
            .summarize_identity("## Identity\n\nLong document.", &provider)
            .await
            .unwrap();
        assert_eq!(summary, "## Identity\n\nLong document.");
    }
}
