//! Recurring-task specifications and their YAML config file.
//!
//! A spec names an instruction (inline or `file(path)`) and an interval:
//! a bare integer counts scheduler cycles, `every(...)` is a wall-clock
//! period, `cron(...)` a five-field cron expression.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use serde::Deserialize;
use time::OffsetDateTime;

use vigil::error::{CoreError, CoreResult};

/// Grace window for a cron spec's first ever firing: run only when the most
/// recent scheduled time is under a minute old, so old schedules do not all
/// fire on startup.
const CRON_FIRST_RUN_WINDOW: Duration = Duration::from_secs(60);

/// When a recurring task runs.
#[derive(Debug, Clone)]
pub enum IntervalSpec {
    /// Every N scheduler cycles.
    Cycles(u64),
    /// Every fixed wall-clock period.
    Every(Duration),
    /// On a cron schedule.
    Cron(Box<Schedule>),
}

fn to_chrono(ts: OffsetDateTime) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.unix_timestamp(), ts.nanosecond())
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(ts.unix_timestamp(), 0).unwrap())
}

/// The `cron` crate wants a seconds field; config files use the common
/// five-field form.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

impl IntervalSpec {
    pub fn parse_str(raw: &str) -> CoreResult<Self> {
        let trimmed = raw.trim();

        if let Some(inner) = trimmed
            .strip_prefix("every(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            // humantime wants units attached to their numbers.
            let compact: String = inner.chars().filter(|c| !c.is_whitespace()).collect();
            let duration = humantime::parse_duration(&compact).map_err(|e| {
                CoreError::Validation(format!("invalid duration '{}': {}", inner, e))
            })?;
            return Ok(IntervalSpec::Every(duration));
        }

        if let Some(inner) = trimmed
            .strip_prefix("cron(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let schedule = Schedule::from_str(&normalize_cron(inner.trim())).map_err(|e| {
                CoreError::Validation(format!("invalid cron expression '{}': {}", inner, e))
            })?;
            return Ok(IntervalSpec::Cron(Box::new(schedule)));
        }

        if let Ok(cycles) = trimmed.parse::<u64>() {
            if cycles == 0 {
                return Err(CoreError::Validation("cycle interval must be > 0".into()));
            }
            return Ok(IntervalSpec::Cycles(cycles));
        }

        Err(CoreError::Validation(format!(
            "invalid interval specification: '{}'",
            raw
        )))
    }

    fn from_yaml(value: &serde_yaml::Value) -> CoreResult<Self> {
        match value {
            serde_yaml::Value::Number(n) => {
                let cycles = n
                    .as_u64()
                    .ok_or_else(|| CoreError::Validation(format!("invalid interval: {:?}", n)))?;
                if cycles == 0 {
                    return Err(CoreError::Validation("cycle interval must be > 0".into()));
                }
                Ok(IntervalSpec::Cycles(cycles))
            }
            serde_yaml::Value::String(s) => Self::parse_str(s),
            other => Err(CoreError::Validation(format!(
                "invalid interval specification: {:?}",
                other
            ))),
        }
    }
}

/// Where a spec's prompt text comes from.
#[derive(Debug, Clone)]
pub enum PromptSpec {
    Literal(String),
    /// Loaded lazily from disk on each firing, relative to the config base.
    File(PathBuf),
}

impl PromptSpec {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Validation("empty prompt specification".into()));
        }
        if let Some(path) = trimmed
            .strip_prefix("file(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Ok(PromptSpec::File(PathBuf::from(path.trim())));
        }
        Ok(PromptSpec::Literal(trimmed.to_string()))
    }

    /// Resolve to prompt text. File prompts are read lazily so edits on disk
    /// take effect at the next firing.
    pub async fn resolve(&self, base_path: &Path) -> CoreResult<String> {
        match self {
            PromptSpec::Literal(text) => Ok(text.clone()),
            PromptSpec::File(relative) => {
                let full = if relative.is_absolute() {
                    relative.clone()
                } else {
                    base_path.join(relative)
                };
                let content = tokio::fs::read_to_string(&full).await.map_err(|e| {
                    CoreError::Validation(format!(
                        "failed to read prompt file {}: {}",
                        full.display(),
                        e
                    ))
                })?;
                let content = content.trim().to_string();
                if content.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "prompt file is empty: {}",
                        full.display()
                    )));
                }
                Ok(content)
            }
        }
    }
}

/// One recurring task, parsed from the YAML config.
#[derive(Debug, Clone)]
pub struct RecurringTaskSpec {
    pub name: String,
    pub interval: IntervalSpec,
    pub prompt: PromptSpec,
    pub metadata: serde_json::Value,
    pub enabled: bool,
    pub last_execution: Option<OffsetDateTime>,
}

impl RecurringTaskSpec {
    /// Whether the spec is due at `(cycle_count, now)`.
    pub fn should_run(&self, cycle_count: u64, now: OffsetDateTime) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.interval {
            IntervalSpec::Cycles(n) => cycle_count % n == 0,
            IntervalSpec::Every(period) => match self.last_execution {
                None => true,
                Some(last) => now - last >= time::Duration::try_from(*period).unwrap_or_default(),
            },
            IntervalSpec::Cron(schedule) => {
                let now_utc = to_chrono(now);
                match self.last_execution {
                    None => {
                        // Fire only if a scheduled time just passed.
                        let window_start = now_utc
                            - chrono::Duration::from_std(CRON_FIRST_RUN_WINDOW)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        schedule
                            .after(&window_start)
                            .next()
                            .is_some_and(|t| t <= now_utc)
                    }
                    Some(last) => schedule
                        .after(&to_chrono(last))
                        .next()
                        .is_some_and(|t| now_utc >= t),
                }
            }
        }
    }

    pub fn mark_executed(&mut self, now: OffsetDateTime) {
        self.last_execution = Some(now);
    }

    /// Name carried in task metadata, defaulting to the spec name.
    pub fn scheduled_task_name(&self) -> String {
        self.metadata
            .get("scheduled_task_name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&self.name)
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    name: String,
    interval: serde_yaml::Value,
    prompt: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    enabled: Option<bool>,
}

impl TryFrom<RawSpec> for RecurringTaskSpec {
    type Error = CoreError;

    fn try_from(raw: RawSpec) -> Result<Self, Self::Error> {
        Ok(RecurringTaskSpec {
            interval: IntervalSpec::from_yaml(&raw.interval)?,
            prompt: PromptSpec::parse(&raw.prompt)?,
            metadata: raw.metadata.unwrap_or_else(|| serde_json::json!({})),
            enabled: raw.enabled.unwrap_or(true),
            last_execution: None,
            name: raw.name,
        })
    }
}

/// Load specs from the YAML file. Per-entry errors are logged and skipped;
/// a missing file yields no specs.
pub fn load_scheduled_tasks(path: &Path) -> Vec<RecurringTaskSpec> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            log::warn!("scheduled tasks config not readable ({}): {}", path.display(), err);
            return Vec::new();
        }
    };
    parse_scheduled_tasks(&content)
}

pub fn parse_scheduled_tasks(content: &str) -> Vec<RecurringTaskSpec> {
    let root: serde_yaml::Value = match serde_yaml::from_str(content) {
        Ok(root) => root,
        Err(err) => {
            log::error!("invalid scheduled tasks YAML: {}", err);
            return Vec::new();
        }
    };
    let Some(entries) = root.get("scheduled_tasks").and_then(|v| v.as_sequence()) else {
        log::warn!("no 'scheduled_tasks' key in config");
        return Vec::new();
    };

    let mut specs = Vec::new();
    for entry in entries {
        let name = entry
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        match serde_yaml::from_value::<RawSpec>(entry.clone())
            .map_err(|e| CoreError::Validation(e.to_string()))
            .and_then(RecurringTaskSpec::try_from)
        {
            Ok(spec) => {
                log::info!("loaded scheduled task '{}'", spec.name);
                specs.push(spec);
            }
            Err(err) => {
                log::error!("error loading scheduled task '{}': {}", name, err);
            }
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(interval: IntervalSpec) -> RecurringTaskSpec {
        RecurringTaskSpec {
            name: "sweep".into(),
            interval,
            prompt: PromptSpec::Literal("do sweep".into()),
            metadata: serde_json::json!({}),
            enabled: true,
            last_execution: None,
        }
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[test]
    fn interval_parsing_covers_all_forms() {
        assert!(matches!(
            IntervalSpec::parse_str("12").unwrap(),
            IntervalSpec::Cycles(12)
        ));
        match IntervalSpec::parse_str("every(1 hour)").unwrap() {
            IntervalSpec::Every(d) => assert_eq!(d, Duration::from_secs(3600)),
            other => panic!("expected Every, got {:?}", other),
        }
        match IntervalSpec::parse_str("every(30 seconds)").unwrap() {
            IntervalSpec::Every(d) => assert_eq!(d, Duration::from_secs(30)),
            other => panic!("expected Every, got {:?}", other),
        }
        assert!(matches!(
            IntervalSpec::parse_str("cron(*/5 * * * *)").unwrap(),
            IntervalSpec::Cron(_)
        ));
        assert!(IntervalSpec::parse_str("whenever").is_err());
        assert!(IntervalSpec::parse_str("cron(not a cron)").is_err());
        assert!(IntervalSpec::parse_str("every(sideways)").is_err());
    }

    #[test]
    fn cycle_intervals_fire_on_modulo() {
        let spec = spec(IntervalSpec::Cycles(3));
        let now = at(1_700_000_000);
        assert!(spec.should_run(0, now));
        assert!(!spec.should_run(1, now));
        assert!(!spec.should_run(2, now));
        assert!(spec.should_run(3, now));
    }

    // every(1 minute) across ticks at +0s, +30s, +70s, +140s.
    #[test]
    fn time_intervals_gate_on_elapsed_period() {
        let mut spec = spec(IntervalSpec::Every(Duration::from_secs(60)));
        let t0 = at(1_700_000_000);

        assert!(spec.should_run(1, t0), "never run before");
        spec.mark_executed(t0);

        assert!(!spec.should_run(2, t0 + time::Duration::seconds(30)));
        assert!(spec.should_run(3, t0 + time::Duration::seconds(70)));
        spec.mark_executed(t0 + time::Duration::seconds(70));
        assert!(spec.should_run(4, t0 + time::Duration::seconds(140)));
    }

    #[test]
    fn cron_first_run_requires_recent_occurrence() {
        // Every minute at second 0.
        let spec = spec(IntervalSpec::parse_str("cron(* * * * *)").unwrap());
        // 30s past the minute: last occurrence 30s ago, inside the window.
        let near = at(1_700_000_000 - (1_700_000_000 % 60) + 30);
        assert!(spec.should_run(1, near));

        // Hourly schedule checked mid-hour: last occurrence is stale.
        let hourly = self::spec(IntervalSpec::parse_str("cron(0 * * * *)").unwrap());
        let mid_hour = at(1_700_000_000 - (1_700_000_000 % 3600) + 1800);
        assert!(!hourly.should_run(1, mid_hour));
    }

    #[test]
    fn cron_fires_once_a_schedule_point_passes() {
        let mut spec = spec(IntervalSpec::parse_str("cron(0 * * * *)").unwrap());
        let hour_start = at(1_700_000_000 - (1_700_000_000 % 3600));
        spec.mark_executed(hour_start + time::Duration::seconds(5));

        assert!(!spec.should_run(1, hour_start + time::Duration::minutes(30)));
        assert!(spec.should_run(2, hour_start + time::Duration::minutes(61)));
    }

    #[test]
    fn disabled_specs_never_run() {
        let mut spec = spec(IntervalSpec::Cycles(1));
        spec.enabled = false;
        assert!(!spec.should_run(0, at(1_700_000_000)));
    }

    #[test]
    fn prompt_spec_distinguishes_literals_and_files() {
        assert!(matches!(
            PromptSpec::parse("do the thing").unwrap(),
            PromptSpec::Literal(_)
        ));
        match PromptSpec::parse("file(prompts/sweep.md)").unwrap() {
            PromptSpec::File(path) => assert_eq!(path, PathBuf::from("prompts/sweep.md")),
            other => panic!("expected File, got {:?}", other),
        }
        assert!(PromptSpec::parse("   ").is_err());
    }

    #[tokio::test]
    async fn file_prompts_resolve_lazily_and_reject_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.md");
        tokio::fs::write(&path, "sweep everything\n").await.unwrap();

        let prompt = PromptSpec::parse("file(sweep.md)").unwrap();
        assert_eq!(prompt.resolve(dir.path()).await.unwrap(), "sweep everything");

        tokio::fs::write(&path, "").await.unwrap();
        assert!(prompt.resolve(dir.path()).await.is_err());

        let missing = PromptSpec::parse("file(gone.md)").unwrap();
        assert!(missing.resolve(dir.path()).await.is_err());
    }

    #[test]
    fn yaml_loading_tolerates_bad_entries() {
        let specs = parse_scheduled_tasks(
            r#"
scheduled_tasks:
  - name: sweep
    interval: "every(1 minute)"
    prompt: "do sweep"
    metadata:
      scheduled_task_name: sweep
  - name: broken
    interval: "whenever"
    prompt: "nope"
  - name: cycles
    interval: 5
    prompt: "file(prompts/cycle.md)"
    enabled: false
"#,
        );
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "sweep");
        assert_eq!(specs[0].scheduled_task_name(), "sweep");
        assert!(!specs[1].enabled);
    }

    #[test]
    fn missing_root_key_yields_no_specs() {
        assert!(parse_scheduled_tasks("other: thing").is_empty());
        assert!(parse_scheduled_tasks(": not yaml :::").is_empty());
    }
}
