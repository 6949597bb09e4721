//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Proactive agent runtime")]
pub struct CliArgs {
    /// Runtime config file (TOML).
    #[arg(long, global = true, default_value = "vigil.toml")]
    pub config: PathBuf,

    /// Database path override.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the proactive scheduler loop until interrupted.
    RunScheduler {
        /// Recurring-task YAML override.
        #[arg(long)]
        scheduled_tasks: Option<PathBuf>,

        /// Dispatch queued tasks but skip recurrence expansion.
        #[arg(long)]
        no_recurring: bool,
    },

    /// Add a task to the queue.
    EnqueueTask {
        /// Natural-language instruction for the task.
        instruction: String,

        /// Task ids this task depends on (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Metadata entries as key=value (repeatable).
        #[arg(long, value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Skip scheduled-name de-duplication.
        #[arg(long)]
        allow_duplicates: bool,
    },

    /// List tasks, optionally filtered by status.
    ListTasks {
        #[arg(long)]
        status: Option<String>,
    },

    /// Mark a task as failed before it runs.
    CancelTask { id: String },

    /// Force-reload one tool server, bypassing its cache TTL.
    ReloadTool { name: String },

    /// Check the runtime, tool fleet and recurring-task configs.
    ValidateConfig,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_parses_key_value_pairs() {
        assert_eq!(
            parse_key_value("scheduled_task_name=sweep").unwrap(),
            ("scheduled_task_name".to_string(), "sweep".to_string())
        );
        assert!(parse_key_value("no-equals").is_err());
    }

    #[test]
    fn enqueue_accepts_repeatable_flags() {
        let args = CliArgs::parse_from([
            "vigil",
            "enqueue-task",
            "do the thing",
            "--depends-on",
            "task:1",
            "--depends-on",
            "task:2",
            "--metadata",
            "priority=low",
        ]);
        match args.command {
            Commands::EnqueueTask {
                instruction,
                depends_on,
                metadata,
                allow_duplicates,
            } => {
                assert_eq!(instruction, "do the thing");
                assert_eq!(depends_on.len(), 2);
                assert_eq!(metadata[0].0, "priority");
                assert!(!allow_duplicates);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
