//! The proactive loop: recurrence expansion and serial task dispatch.
//!
//! One scheduler instance runs one tick loop. Each tick expands due
//! recurring specs into queued tasks, then dispatches at most one task to
//! completion. Tasks never overlap within an instance, which keeps the
//! reused per-recurring-task conversations single-writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vigil::error::CoreResult;
use vigil::mcp::ToolBroker;
use vigil::provider::ModelProvider;

use crate::domain::{TaskRecord, TaskStatus};
use crate::event_bus::EventBus;
use crate::events::{EventKind, EventScope};
use crate::identity::IdentityService;
use crate::middleware::MiddlewareSet;
use crate::orchestrator::{ConversationOrchestrator, OrchestratorConfig};
use crate::recurring::RecurringTaskSpec;
use crate::task_queue::TaskQueue;
use crate::store::KnowledgeStore;

const BOOTSTRAP_USER_MESSAGE: &str = "You are this agent's subconscious, handling background \
tasks autonomously. Consult the knowledge graph for context before starting, avoid repeating \
work that is already done, and write your results and insights back when you finish.";

const BOOTSTRAP_MODEL_MESSAGE: &str = "Acknowledged. I will complete background tasks \
independently, consulting the knowledge graph first, avoiding duplicate work, and recording \
outcomes when done.";

/// Sleep after a processed task before the next tick; keeps a busy queue
/// draining without a hot spin.
const DRAIN_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub enable_scheduled_tasks: bool,
    /// Base directory for `file(...)` prompt resolution.
    pub base_path: PathBuf,
    /// Optional wall-clock ceiling per task turn. Unset, a turn runs to its
    /// model/tool outcome; set, an overrun records the task as failed
    /// instead of leaving it in progress.
    pub task_timeout: Option<Duration>,
    pub orchestrator: OrchestratorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            enable_scheduled_tasks: true,
            base_path: PathBuf::from("."),
            task_timeout: None,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Point-in-time snapshot of loop progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub tasks_processed: u64,
    pub scheduled_specs: Vec<(String, bool, Option<String>)>,
}

pub struct Scheduler {
    store: Arc<dyn KnowledgeStore>,
    broker: Arc<ToolBroker>,
    bus: Arc<EventBus>,
    provider: Arc<dyn ModelProvider>,
    middleware: MiddlewareSet,
    queue: TaskQueue,
    config: SchedulerConfig,
    specs: Vec<RecurringTaskSpec>,
    /// Recurring tasks keep their chat and orchestrator across firings.
    scheduled_task_chats: HashMap<String, (String, Arc<ConversationOrchestrator>)>,
    /// Loaded once per scheduler session and reused by every task.
    identity: Option<String>,
    session_id: String,
    user_id: String,
    cycle_count: u64,
    tasks_processed: u64,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        broker: Arc<ToolBroker>,
        bus: Arc<EventBus>,
        provider: Arc<dyn ModelProvider>,
        specs: Vec<RecurringTaskSpec>,
        config: SchedulerConfig,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let user_id = "agent".to_string();
        let queue = TaskQueue::new(
            store.clone(),
            bus.clone(),
            EventScope::new(session_id.as_str(), user_id.as_str()),
        );
        log::info!(
            "scheduler session {} created with {} recurring specs",
            session_id,
            specs.len()
        );
        Self {
            store,
            broker,
            bus,
            provider,
            middleware: MiddlewareSet::new(),
            queue,
            config,
            specs,
            scheduled_task_chats: HashMap::new(),
            identity: None,
            session_id,
            user_id,
            cycle_count: 0,
            tasks_processed: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_middleware(mut self, middleware: MiddlewareSet) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            cycles: self.cycle_count,
            tasks_processed: self.tasks_processed,
            scheduled_specs: self
                .specs
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        s.enabled,
                        s.last_execution.map(|t| t.to_string()),
                    )
                })
                .collect(),
        }
    }

    /// Load the identity block once per session.
    async fn identity_block(&mut self) -> String {
        if let Some(identity) = &self.identity {
            return identity.clone();
        }
        log::info!("[{}] loading identity for scheduler session", self.session_id);
        let service = IdentityService::new(self.store.clone());
        let memory = match service.get_identity_memory().await {
            Ok(memory) => memory,
            Err(err) => {
                log::error!("failed to load identity: {}", err);
                "## Identity\n\nBackground task processing agent.".to_string()
            }
        };
        let summary = service
            .summarize_identity(&memory, self.provider.as_ref())
            .await
            .unwrap_or(memory);
        self.identity = Some(summary.clone());
        summary
    }

    /// Enqueue every due recurring spec. Expansion failures are logged and
    /// never abort the tick.
    async fn expand_recurring(&mut self, now: OffsetDateTime) {
        if !self.config.enable_scheduled_tasks {
            return;
        }

        for index in 0..self.specs.len() {
            let (name, due) = {
                let spec = &self.specs[index];
                (spec.name.clone(), spec.should_run(self.cycle_count, now))
            };
            if !due {
                continue;
            }

            // The database is the authority on the last firing; the in-memory
            // timestamp only survives within this process.
            let scheduled_name = self.specs[index].scheduled_task_name();
            let last_recorded = match self
                .queue
                .get_last_scheduled_task_execution(&scheduled_name)
                .await
            {
                Ok(last) => last,
                Err(err) => {
                    log::error!("could not read last execution of '{}': {}", name, err);
                    continue;
                }
            };
            let gate_passed = match (&self.specs[index].interval, last_recorded) {
                (_, None) => true,
                (crate::recurring::IntervalSpec::Every(period), Some(last)) => {
                    now - last >= time::Duration::try_from(*period).unwrap_or_default()
                }
                (crate::recurring::IntervalSpec::Cron(_), Some(last)) => {
                    let mut probe = self.specs[index].clone();
                    probe.last_execution = Some(last);
                    probe.should_run(self.cycle_count, now)
                }
                (crate::recurring::IntervalSpec::Cycles(_), Some(_)) => true,
            };
            if !gate_passed {
                log::debug!("skipping '{}': interval not yet elapsed", name);
                continue;
            }

            let prompt = match self.specs[index]
                .prompt
                .resolve(&self.config.base_path)
                .await
            {
                Ok(prompt) => prompt,
                Err(err) => {
                    log::error!("error resolving prompt for '{}': {}", name, err);
                    continue;
                }
            };

            let mut metadata = self.specs[index].metadata.clone();
            if !metadata.is_object() {
                metadata = json!({});
            }
            metadata["scheduled_task_name"] = Value::String(scheduled_name.clone());

            match self
                .queue
                .add_task(&prompt, Some(metadata), &[], false)
                .await
            {
                Ok(task) => {
                    self.specs[index].mark_executed(now);
                    log::info!(
                        "recurring task '{}' expanded into {} (cycle {})",
                        name,
                        task.id,
                        self.cycle_count
                    );
                }
                Err(err) => {
                    log::error!("error enqueueing recurring task '{}': {}", name, err);
                }
            }
        }
    }

    /// Get or create the `(chat, orchestrator)` pair for a task. Recurring
    /// tasks reuse theirs across firings; manual tasks always get a fresh
    /// pair.
    async fn orchestrator_for(
        &mut self,
        task: &TaskRecord,
    ) -> CoreResult<(String, Arc<ConversationOrchestrator>, bool)> {
        let scheduled_name = task.scheduled_task_name().map(str::to_string);

        if let Some(name) = &scheduled_name {
            if let Some((chat_id, orchestrator)) = self.scheduled_task_chats.get(name) {
                log::info!("reusing chat {} for scheduled task '{}'", chat_id, name);
                return Ok((chat_id.clone(), orchestrator.clone(), true));
            }
        }

        let chat_id = Uuid::new_v4().to_string();
        let orchestrator = Arc::new(
            ConversationOrchestrator::new(
                self.provider.clone(),
                self.store.clone(),
                self.broker.clone(),
                self.bus.clone(),
            )
            .with_middleware(self.middleware.clone())
            .with_config(self.config.orchestrator),
        );

        let chat_name = scheduled_name
            .as_deref()
            .map(|name| format!("Task: {}", name))
            .unwrap_or_else(|| {
                format!("Task: {}", task.instruction.chars().take(40).collect::<String>())
            });

        let identity = self.identity_block().await;
        orchestrator
            .start_chat(
                &self.session_id,
                &self.user_id,
                &chat_id,
                Some(chat_name.as_str()),
                Some(identity),
            )
            .await?;
        orchestrator
            .inject_internal_exchange(BOOTSTRAP_USER_MESSAGE, BOOTSTRAP_MODEL_MESSAGE)
            .await?;

        if let Some(name) = &scheduled_name {
            self.scheduled_task_chats
                .insert(name.clone(), (chat_id.clone(), orchestrator.clone()));
            log::info!("stored chat {} for scheduled task '{}'", chat_id, name);
        }
        Ok((chat_id, orchestrator, false))
    }

    /// Execute one claimed task to completion.
    async fn run_task(&mut self, task: TaskRecord) {
        let scope = EventScope::new(self.session_id.as_str(), self.user_id.as_str())
            .task(Some(task.id.clone()));
        self.bus
            .emit(
                scope,
                EventKind::TaskStarted {
                    task_id: task.id.clone(),
                },
            )
            .await;
        log::info!(
            "executing task {}: {}",
            task.id,
            task.instruction.chars().take(80).collect::<String>()
        );

        let task_timeout = self.config.task_timeout;
        let result: CoreResult<String> = async {
            let (_chat_id, orchestrator, _reused) = self.orchestrator_for(&task).await?;
            let turn = orchestrator.send_message(&task.instruction, Some(task.id.as_str()));
            match task_timeout {
                None => turn.await,
                Some(limit) => match tokio::time::timeout(limit, turn).await {
                    Ok(result) => result,
                    Err(_) => Err(vigil::error::CoreError::Timeout(format!(
                        "task failed: timeout after {:?}",
                        limit
                    ))),
                },
            }
        }
        .await;

        match result {
            Ok(response) => {
                if let Err(err) = self
                    .queue
                    .update_task_status(&task.id, TaskStatus::Completed, Some(response.as_str()), None)
                    .await
                {
                    log::error!("failed to record completion of {}: {}", task.id, err);
                }
                self.tasks_processed += 1;
                log::info!("task {} completed", task.id);
            }
            Err(err) => {
                log::error!("task {} failed: {}", task.id, err);
                let error_text = err.to_string();
                if let Err(update_err) = self
                    .queue
                    .update_task_status(&task.id, TaskStatus::Failed, None, Some(error_text.as_str()))
                    .await
                {
                    log::error!("failed to record failure of {}: {}", task.id, update_err);
                }
                match task.scheduled_task_name() {
                    Some(name) => {
                        // Keep the conversation: the next firing retries with
                        // context.
                        log::warn!(
                            "chat retained for scheduled task '{}' after failure",
                            name
                        );
                    }
                    None => {
                        // Manual task orchestrators die with their task; they
                        // were never recorded in the reuse map.
                    }
                }
            }
        }
    }

    /// One tick: expand recurrence, dispatch at most one task. Returns
    /// whether a task ran.
    pub async fn tick(&mut self) -> bool {
        self.cycle_count += 1;
        let now = OffsetDateTime::now_utc();
        log::debug!(
            "tick {} (processed {} so far)",
            self.cycle_count,
            self.tasks_processed
        );

        self.expand_recurring(now).await;

        match self.queue.get_next_pending_task().await {
            Ok(Some(task)) => {
                self.run_task(task).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                log::error!("error polling task queue: {}", err);
                false
            }
        }
    }

    /// Run until cancelled. The in-flight turn always completes; pending
    /// tasks are left pending for the next run.
    pub async fn run(&mut self) -> CoreResult<()> {
        log::info!(
            "scheduler loop starting ({} recurring specs, poll every {:?})",
            self.specs.len(),
            self.config.poll_interval
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let processed = self.tick().await;
            let pause = if processed {
                DRAIN_PAUSE
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        log::info!(
            "scheduler stopped after {} cycles, {} tasks processed",
            self.cycle_count,
            self.tasks_processed
        );
        Ok(())
    }

    /// Request cooperative shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
