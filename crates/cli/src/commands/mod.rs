//! Command implementations over a shared runtime bundle.

mod run_scheduler;
mod tasks;
mod tools;
mod validate;

pub use run_scheduler::run_scheduler;
pub use tasks::{cancel_task, enqueue_task, list_tasks};
pub use tools::reload_tool;
pub use validate::validate_config;

use std::sync::Arc;

use vigil::error::CoreResult;
use vigil::mcp::{FleetConfig, RmcpTransportFactory, ToolBroker};
use vigil_agent::event_bus::EventBus;
use vigil_agent::events::EventScope;
use vigil_agent::store::{KnowledgeStore, SqliteKnowledgeStore};
use vigil_agent::{RuntimeConfig, TaskQueue};

use crate::cli_args::CliArgs;

/// Everything a command needs, assembled once at startup. No globals: tests
/// build their own bundle with in-memory stores.
pub struct CliRuntime {
    pub config: RuntimeConfig,
    pub store: Arc<dyn KnowledgeStore>,
    pub bus: Arc<EventBus>,
    pub broker: Arc<ToolBroker>,
    pub queue: TaskQueue,
}

pub async fn build_runtime(args: &CliArgs) -> CoreResult<CliRuntime> {
    let config = RuntimeConfig::load(&args.config)?;
    let db_path = args.db.clone().unwrap_or_else(|| config.database.clone());
    let store: Arc<dyn KnowledgeStore> =
        Arc::new(SqliteKnowledgeStore::connect(db_path).await?);
    let bus = Arc::new(EventBus::new());

    let fleet = FleetConfig::discover(config.mcp_config.as_deref())?;
    let broker = Arc::new(ToolBroker::new(
        fleet,
        Arc::new(RmcpTransportFactory::new("vigil")),
    ));

    let queue = TaskQueue::new(
        store.clone(),
        bus.clone(),
        EventScope::new("cli", "agent"),
    );

    Ok(CliRuntime {
        config,
        store,
        bus,
        broker,
        queue,
    })
}
