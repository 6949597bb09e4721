//! Runtime configuration file (`vigil.toml`).
//!
//! Everything is optional; defaults match the orchestrator and scheduler
//! constants. `${VAR}` / `${VAR:-default}` occurrences in string values are
//! substituted from the environment at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Deserialize;

use vigil::error::{CoreError, CoreResult};

use crate::middleware::GuardConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub database: PathBuf,

    /// Tool fleet config path; discovered when unset.
    #[serde(default)]
    pub mcp_config: Option<PathBuf>,

    /// Recurring-task YAML path.
    #[serde(default = "default_scheduled_tasks_path")]
    pub scheduled_tasks: PathBuf,

    /// Model identifier handed to the provider.
    #[serde(default = "default_model")]
    pub model: String,

    /// Overrides the provider's context-window registry when set.
    #[serde(default)]
    pub context_window_override: Option<u64>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Optional wall-clock ceiling per task turn, in seconds.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    #[serde(default = "default_token_budget_percent")]
    pub token_budget_percent: f64,

    #[serde(default = "default_summary_token_threshold")]
    pub summary_token_threshold: f64,

    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Self-modification guard settings.
    #[serde(default)]
    pub protected_branches: Option<Vec<String>>,
    #[serde(default)]
    pub source_paths: Option<Vec<String>>,
    #[serde(default)]
    pub branch_tool: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("vigil.db")
}

fn default_scheduled_tasks_path() -> PathBuf {
    PathBuf::from("scheduled_tasks.yaml")
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_token_budget_percent() -> f64 {
    0.8
}

fn default_summary_token_threshold() -> f64 {
    0.85
}

fn default_max_tool_iterations() -> u32 {
    20
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database: default_db_path(),
            mcp_config: None,
            scheduled_tasks: default_scheduled_tasks_path(),
            model: default_model(),
            context_window_override: None,
            poll_interval_secs: default_poll_interval_secs(),
            task_timeout_secs: None,
            token_budget_percent: default_token_budget_percent(),
            summary_token_threshold: default_summary_token_threshold(),
            max_tool_iterations: default_max_tool_iterations(),
            protected_branches: None,
            source_paths: None,
            branch_tool: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                log::debug!("no runtime config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CoreResult<Self> {
        let mut value: toml::Value = content
            .parse()
            .map_err(|e| CoreError::Validation(format!("invalid config TOML: {}", e)))?;
        interpolate_toml_value(&mut value);
        Self::deserialize(value)
            .map_err(|e| CoreError::Validation(format!("invalid config: {}", e)))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            token_budget_percent: self.token_budget_percent,
            summary_token_threshold: self.summary_token_threshold,
            max_tool_iterations: self.max_tool_iterations,
        }
        .clamped()
    }

    pub fn scheduler_config(&self, base_path: PathBuf) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            enable_scheduled_tasks: true,
            base_path,
            task_timeout: self.task_timeout_secs.map(Duration::from_secs),
            orchestrator: self.orchestrator_config(),
        }
    }

    pub fn guard_config(&self) -> GuardConfig {
        let mut guard = GuardConfig::default();
        if let Some(branches) = &self.protected_branches {
            guard.protected_branches = branches.clone();
        }
        if let Some(paths) = &self.source_paths {
            guard.source_paths = paths.clone();
        }
        if let Some(tool) = &self.branch_tool {
            guard.branch_tool = tool.clone();
        }
        guard
    }
}

/// Recursively interpolate environment variables in string values.
fn interpolate_toml_value(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => *s = interpolate_env_vars(s),
        toml::Value::Array(arr) => {
            for item in arr {
                interpolate_toml_value(item);
            }
        }
        toml::Value::Table(table) => {
            for (_key, val) in table.iter_mut() {
                interpolate_toml_value(val);
            }
        }
        _ => {}
    }
}

fn interpolate_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex is valid");
    re.replace_all(content, |caps: &Captures| {
        let default = caps.get(2).map(|m| m.as_str());
        match (std::env::var(&caps[1]), default) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => String::new(),
        }
    })
    .into_owned()
}
