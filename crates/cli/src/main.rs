//! `vigil` binary: the operational surface over the agent runtime.
//!
//! Exit codes: 0 success, 1 validation/configuration error, 2 runtime
//! failure.

use clap::Parser;

use vigil::error::CoreError;

mod cli_args;
mod commands;
mod provider;

use cli_args::{CliArgs, Commands};

fn exit_code_for(err: &CoreError) -> i32 {
    match err {
        CoreError::Validation(_) | CoreError::Schema(_) | CoreError::NotFound(_) => 1,
        _ => 2,
    }
}

async fn run(args: CliArgs) -> Result<(), CoreError> {
    match &args.command {
        Commands::ValidateConfig => commands::validate_config(&args).await,
        Commands::RunScheduler {
            scheduled_tasks,
            no_recurring,
        } => {
            let runtime = commands::build_runtime(&args).await?;
            commands::run_scheduler(runtime, scheduled_tasks.clone(), *no_recurring).await
        }
        Commands::EnqueueTask {
            instruction,
            depends_on,
            metadata,
            allow_duplicates,
        } => {
            let runtime = commands::build_runtime(&args).await?;
            commands::enqueue_task(runtime, instruction, depends_on, metadata, *allow_duplicates)
                .await
        }
        Commands::ListTasks { status } => {
            let runtime = commands::build_runtime(&args).await?;
            commands::list_tasks(runtime, status.as_deref()).await
        }
        Commands::CancelTask { id } => {
            let runtime = commands::build_runtime(&args).await?;
            commands::cancel_task(runtime, id).await
        }
        Commands::ReloadTool { name } => {
            let runtime = commands::build_runtime(&args).await?;
            commands::reload_tool(runtime, name).await
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    if let Err(err) = run(args).await {
        eprintln!("error: {}", err);
        std::process::exit(exit_code_for(&err));
    }
}
