use std::path::PathBuf;
use std::sync::Arc;

use vigil::error::CoreResult;
use vigil_agent::middleware::{
    CommandPromptMiddleware, MiddlewareSet, ResourceFetchingMiddleware, SelfModificationGuard,
};
use vigil_agent::recurring::load_scheduled_tasks;
use vigil_agent::Scheduler;

use super::CliRuntime;
use crate::provider::OpenAiChatProvider;

pub async fn run_scheduler(
    runtime: CliRuntime,
    scheduled_tasks: Option<PathBuf>,
    no_recurring: bool,
) -> CoreResult<()> {
    let provider = Arc::new(
        OpenAiChatProvider::new(&runtime.config.model)?
            .with_context_window_override(runtime.config.context_window_override),
    );

    let specs_path = scheduled_tasks.unwrap_or_else(|| runtime.config.scheduled_tasks.clone());
    let specs = if no_recurring {
        Vec::new()
    } else {
        load_scheduled_tasks(&specs_path)
    };

    let base_path = specs_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut scheduler_config = runtime.config.scheduler_config(base_path);
    scheduler_config.enable_scheduled_tasks = !no_recurring;

    let middleware = MiddlewareSet::new()
        .with_message(CommandPromptMiddleware)
        .with_message(ResourceFetchingMiddleware)
        .with_tool(SelfModificationGuard::new(runtime.config.guard_config()));

    let mut scheduler = Scheduler::new(
        runtime.store,
        runtime.broker,
        runtime.bus,
        provider,
        specs,
        scheduler_config,
    )
    .with_middleware(middleware);

    // Cooperative shutdown: first Ctrl-C lets the in-flight turn finish.
    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested, finishing in-flight work");
            token.cancel();
        }
    });

    scheduler.run().await
}
