//! Vigil agent runtime.
//!
//! A long-running service that keeps a graph-structured working memory of
//! conversations and derived knowledge, schedules autonomous tasks, brokers
//! model tool calls through a fleet of tool servers, and keeps each dialogue
//! inside its token budget via on-line summarization.
//!
//! The pieces compose without globals: build a [`store::SqliteKnowledgeStore`],
//! an [`event_bus::EventBus`], a [`vigil::mcp::ToolBroker`] and a model
//! provider, then hand them to a [`scheduler::Scheduler`] (for the proactive
//! loop) or drive a [`orchestrator::ConversationOrchestrator`] directly.

pub mod config;
pub mod domain;
pub mod event_bus;
pub mod events;
pub mod forwarder;
pub mod identity;
pub mod messages;
pub mod middleware;
pub mod orchestrator;
pub mod recurring;
pub mod scheduler;
pub mod store;
pub mod task_queue;
pub mod test_utils;

#[cfg(test)]
mod orchestrator_tests;

pub use config::RuntimeConfig;
pub use domain::{
    ChatMessageKind, ChatSummary, Edge, EdgeType, Node, NodeType, TaskRecord, TaskStatus,
};
pub use event_bus::EventBus;
pub use events::{AgentEvent, EventHandler, EventKind, EventName, EventScope};
pub use messages::{MessageService, SaveMessage};
pub use orchestrator::{ConversationOrchestrator, OrchestratorConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{KnowledgeStore, SqliteKnowledgeStore};
pub use task_queue::TaskQueue;
