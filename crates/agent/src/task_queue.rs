//! Persistent task queue over the knowledge store.
//!
//! Tasks are `Node{type=Task}` rows with `DEPENDS_ON` edges. Dispatch is
//! single-winner: claiming a task is an atomic compare-and-set of its status,
//! so concurrent pollers always receive disjoint tasks.

use std::sync::Arc;

use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use vigil::error::{CoreError, CoreResult};

use crate::domain::{EdgeType, NodeType, Properties, TaskRecord, TaskStatus};
use crate::event_bus::EventBus;
use crate::events::{EventKind, EventScope};
use crate::store::{KnowledgeStore, NewNode};

/// How many task rows one queue scan considers.
const SCAN_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn KnowledgeStore>,
    bus: Arc<EventBus>,
    scope: EventScope,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn KnowledgeStore>, bus: Arc<EventBus>, scope: EventScope) -> Self {
        Self { store, bus, scope }
    }

    async fn load_tasks(&self) -> CoreResult<Vec<TaskRecord>> {
        let (nodes, _) = self
            .store
            .search_nodes(Some(NodeType::Task), None, SCAN_LIMIT, 0)
            .await?;
        let mut tasks = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match TaskRecord::from_node(node) {
                Ok(task) => tasks.push(task),
                Err(err) => log::warn!("skipping malformed task row '{}': {}", node.id, err),
            }
        }
        Ok(tasks)
    }

    /// Enqueue an instruction. With `allow_duplicates=false`, a task carrying
    /// `metadata.scheduled_task_name` is de-duplicated against any live
    /// (pending or in-progress) task of the same name — the existing task is
    /// returned instead of a new row.
    pub async fn add_task(
        &self,
        instruction: &str,
        metadata: Option<Value>,
        depends_on: &[String],
        allow_duplicates: bool,
    ) -> CoreResult<TaskRecord> {
        if instruction.trim().is_empty() {
            return Err(CoreError::Validation(
                "task instruction must not be empty".into(),
            ));
        }

        let metadata = metadata.unwrap_or_else(|| json!({}));
        let scheduled_name = metadata
            .get("scheduled_task_name")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !allow_duplicates {
            if let Some(name) = &scheduled_name {
                let live = self.load_tasks().await?.into_iter().find(|t| {
                    t.scheduled_task_name() == Some(name.as_str()) && !t.status.is_terminal()
                });
                if let Some(existing) = live {
                    log::info!(
                        "task '{}' already live as {} ({}), not enqueueing a duplicate",
                        name,
                        existing.id,
                        existing.status.as_str()
                    );
                    return Ok(existing);
                }
            }
        }

        let task_id = format!("task:{}", Uuid::new_v4());
        let short: String = instruction.chars().take(60).collect();
        let mut properties = Properties::new();
        properties.insert("instruction".into(), Value::String(instruction.to_string()));
        properties.insert(
            "status".into(),
            Value::String(TaskStatus::Pending.as_str().to_string()),
        );
        properties.insert("metadata".into(), metadata);

        let node = self
            .store
            .add_node(
                NewNode::new(&task_id, NodeType::Task, format!("Task: {}", short))
                    .content(instruction)
                    .properties(properties),
            )
            .await?;

        for dependency in depends_on {
            if self.store.get_node(dependency).await?.is_none() {
                return Err(CoreError::Validation(format!(
                    "dependency '{}' does not exist",
                    dependency
                )));
            }
            self.store
                .add_edge(&task_id, dependency, EdgeType::DependsOn, Properties::new())
                .await?;
        }

        let task = TaskRecord::from_node(&node)?;
        self.bus
            .emit(
                self.scope.clone().task(Some(task_id.clone())),
                EventKind::TaskAdded {
                    task_id: task_id.clone(),
                },
            )
            .await;
        log::info!("enqueued task {} ({:?})", task_id, scheduled_name);
        Ok(task)
    }

    /// Whether every `DEPENDS_ON` target of a task is completed.
    async fn dependencies_satisfied(&self, task_id: &str) -> CoreResult<bool> {
        let edges = self
            .store
            .get_edges(Some(task_id), None, Some(EdgeType::DependsOn))
            .await?;
        for edge in edges {
            let Some(dependency) = self.store.get_node(&edge.target_id).await? else {
                // A vanished dependency can never complete.
                return Ok(false);
            };
            let status = dependency
                .property_str("status")
                .unwrap_or("pending")
                .parse::<TaskStatus>()?;
            if status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pop the oldest dispatchable pending task, atomically transitioning it
    /// to `in_progress`. Racing callers receive disjoint tasks: the CAS on
    /// the status property has exactly one winner per task.
    pub async fn get_next_pending_task(&self) -> CoreResult<Option<TaskRecord>> {
        let mut pending: Vec<TaskRecord> = self
            .load_tasks()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by_key(|t| t.created_at);

        for task in pending {
            if !self.dependencies_satisfied(&task.id).await? {
                continue;
            }
            let claimed = self
                .store
                .cas_node_property(
                    &task.id,
                    "status",
                    &json!(TaskStatus::Pending.as_str()),
                    &json!(TaskStatus::InProgress.as_str()),
                )
                .await?;
            if !claimed {
                // Another poller won this task; try the next one.
                continue;
            }

            let mut task = task;
            task.status = TaskStatus::InProgress;
            self.bus
                .emit(
                    self.scope.clone().task(Some(task.id.clone())),
                    EventKind::TaskAvailable {
                        task_id: task.id.clone(),
                        instruction: task.instruction.clone(),
                    },
                )
                .await;
            return Ok(Some(task));
        }
        Ok(None)
    }

    /// Record a terminal (or corrected) status. Returns false when the task
    /// does not exist.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        response: Option<&str>,
        error: Option<&str>,
    ) -> CoreResult<bool> {
        if self.store.get_node(task_id).await?.is_none() {
            log::warn!("status update for unknown task '{}'", task_id);
            return Ok(false);
        }

        let mut properties = Properties::new();
        properties.insert("status".into(), json!(status.as_str()));
        if let Some(response) = response {
            properties.insert("response".into(), Value::String(response.to_string()));
        }
        if let Some(error) = error {
            properties.insert("error".into(), Value::String(error.to_string()));
        }
        self.store
            .update_node(
                task_id,
                crate::store::NodePatch {
                    properties: Some(properties),
                    ..Default::default()
                },
            )
            .await?;

        let scope = self.scope.clone().task(Some(task_id.to_string()));
        self.bus
            .emit(
                scope.clone(),
                EventKind::TaskStatusChanged {
                    task_id: task_id.to_string(),
                    status,
                },
            )
            .await;
        match status {
            TaskStatus::Completed => {
                self.bus
                    .emit(
                        scope,
                        EventKind::TaskCompleted {
                            task_id: task_id.to_string(),
                            response: response.map(str::to_string),
                        },
                    )
                    .await;
            }
            TaskStatus::Failed => {
                self.bus
                    .emit(
                        scope,
                        EventKind::TaskFailed {
                            task_id: task_id.to_string(),
                            error: error.unwrap_or("unknown error").to_string(),
                        },
                    )
                    .await;
            }
            _ => {}
        }
        Ok(true)
    }

    /// `created_at` of the most recent task enqueued under a recurring spec
    /// name; the recurrence gate keys off this.
    pub async fn get_last_scheduled_task_execution(
        &self,
        name: &str,
    ) -> CoreResult<Option<OffsetDateTime>> {
        Ok(self
            .load_tasks()
            .await?
            .into_iter()
            .filter(|t| t.scheduled_task_name() == Some(name))
            .map(|t| t.created_at)
            .max())
    }

    pub async fn get_task(&self, task_id: &str) -> CoreResult<Option<TaskRecord>> {
        match self.store.get_node(task_id).await? {
            Some(node) => Ok(Some(TaskRecord::from_node(&node)?)),
            None => Ok(None),
        }
    }

    /// Tasks this task depends on.
    pub async fn get_task_dependencies(&self, task_id: &str) -> CoreResult<Vec<TaskRecord>> {
        let edges = self
            .store
            .get_edges(Some(task_id), None, Some(EdgeType::DependsOn))
            .await?;
        let mut tasks = Vec::new();
        for edge in edges {
            if let Some(task) = self.get_task(&edge.target_id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Tasks that depend on this task.
    pub async fn get_dependent_tasks(&self, task_id: &str) -> CoreResult<Vec<TaskRecord>> {
        let edges = self
            .store
            .get_edges(None, Some(task_id), Some(EdgeType::DependsOn))
            .await?;
        let mut tasks = Vec::new();
        for edge in edges {
            if let Some(task) = self.get_task(&edge.source_id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> CoreResult<Vec<TaskRecord>> {
        let mut tasks = self.load_tasks().await?;
        if let Some(status) = status {
            tasks.retain(|t| t.status == status);
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    pub async fn task_stats(&self) -> CoreResult<TaskStats> {
        let mut stats = TaskStats::default();
        for task in self.load_tasks().await? {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteKnowledgeStore;

    async fn queue() -> TaskQueue {
        let store: Arc<dyn KnowledgeStore> =
            Arc::new(SqliteKnowledgeStore::connect_in_memory().await.unwrap());
        TaskQueue::new(
            store,
            Arc::new(EventBus::new()),
            EventScope::new("sched", "agent"),
        )
    }

    #[tokio::test]
    async fn empty_instruction_is_rejected() {
        let queue = queue().await;
        let err = queue.add_task("   ", None, &[], false).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn fifo_order_by_creation_time() {
        let queue = queue().await;
        let a = queue.add_task("first", None, &[], false).await.unwrap();
        let b = queue.add_task("second", None, &[], false).await.unwrap();

        let popped = queue.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(popped.id, a.id);
        let popped = queue.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(popped.id, b.id);
        assert!(queue.get_next_pending_task().await.unwrap().is_none());
    }

    // De-duplication of live scheduled tasks.
    #[tokio::test]
    async fn scheduled_tasks_are_deduplicated_while_live() {
        let queue = queue().await;
        let metadata = json!({"scheduled_task_name": "sweep"});

        let first = queue
            .add_task("do sweep", Some(metadata.clone()), &[], false)
            .await
            .unwrap();
        let second = queue
            .add_task("do sweep", Some(metadata.clone()), &[], false)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(queue.list_tasks(None).await.unwrap().len(), 1);

        // Still deduplicated while in progress.
        queue.get_next_pending_task().await.unwrap().unwrap();
        let third = queue
            .add_task("do sweep", Some(metadata.clone()), &[], false)
            .await
            .unwrap();
        assert_eq!(third.id, first.id);

        // Once completed, a new row may be enqueued.
        queue
            .update_task_status(&first.id, TaskStatus::Completed, Some("done"), None)
            .await
            .unwrap();
        let fourth = queue
            .add_task("do sweep", Some(metadata), &[], false)
            .await
            .unwrap();
        assert_ne!(fourth.id, first.id);
    }

    // Dependencies must be completed, not merely terminal.
    #[tokio::test]
    async fn dependencies_gate_dispatch_on_completion() {
        let queue = queue().await;
        let a = queue.add_task("A", None, &[], false).await.unwrap();
        let b = queue
            .add_task("B", None, std::slice::from_ref(&a.id), false)
            .await
            .unwrap();

        let popped = queue.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(popped.id, a.id);

        // A failed: B must not dispatch.
        queue
            .update_task_status(&a.id, TaskStatus::Failed, None, Some("boom"))
            .await
            .unwrap();
        assert!(queue.get_next_pending_task().await.unwrap().is_none());

        // Completed retroactively: B becomes dispatchable.
        queue
            .update_task_status(&a.id, TaskStatus::Completed, Some("ok"), None)
            .await
            .unwrap();
        let popped = queue.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(popped.id, b.id);
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected_at_enqueue() {
        let queue = queue().await;
        let err = queue
            .add_task("B", None, &["task:ghost".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    // Concurrent pollers get disjoint tasks.
    #[tokio::test]
    async fn concurrent_pollers_claim_disjoint_tasks() {
        let store: Arc<dyn KnowledgeStore> =
            Arc::new(SqliteKnowledgeStore::connect_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let queue = TaskQueue::new(store, bus, EventScope::new("sched", "agent"));

        for i in 0..8 {
            queue
                .add_task(&format!("task {}", i), None, &[], false)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = queue.get_next_pending_task().await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), 8, "every task claimed exactly once");
        assert_eq!(unique.len(), 8, "no task claimed twice");
    }

    #[tokio::test]
    async fn last_scheduled_execution_tracks_newest_row() {
        let queue = queue().await;
        assert!(queue
            .get_last_scheduled_task_execution("sweep")
            .await
            .unwrap()
            .is_none());

        let first = queue
            .add_task("sweep once", Some(json!({"scheduled_task_name": "sweep"})), &[], true)
            .await
            .unwrap();
        let second = queue
            .add_task("sweep again", Some(json!({"scheduled_task_name": "sweep"})), &[], true)
            .await
            .unwrap();

        let last = queue
            .get_last_scheduled_task_execution("sweep")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last, second.created_at.max(first.created_at));
    }

    #[tokio::test]
    async fn dependency_queries_resolve_both_directions() {
        let queue = queue().await;
        let a = queue.add_task("A", None, &[], false).await.unwrap();
        let b = queue
            .add_task("B", None, std::slice::from_ref(&a.id), false)
            .await
            .unwrap();

        let deps = queue.get_task_dependencies(&b.id).await.unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, a.id);

        let dependents = queue.get_dependent_tasks(&a.id).await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, b.id);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let queue = queue().await;
        let a = queue.add_task("A", None, &[], false).await.unwrap();
        queue.add_task("B", None, &[], false).await.unwrap();
        queue.get_next_pending_task().await.unwrap().unwrap();
        queue
            .update_task_status(&a.id, TaskStatus::Completed, None, None)
            .await
            .unwrap();

        let stats = queue.task_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_progress, 0);
    }
}
