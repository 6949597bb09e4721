use serde_json::Value;

use vigil::error::{CoreError, CoreResult};
use vigil_agent::TaskStatus;

use super::CliRuntime;

pub async fn enqueue_task(
    runtime: CliRuntime,
    instruction: &str,
    depends_on: &[String],
    metadata: &[(String, String)],
    allow_duplicates: bool,
) -> CoreResult<()> {
    let metadata_value = if metadata.is_empty() {
        None
    } else {
        let map: serde_json::Map<String, Value> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Some(Value::Object(map))
    };

    let task = runtime
        .queue
        .add_task(instruction, metadata_value, depends_on, allow_duplicates)
        .await?;
    println!("{}", task.id);
    Ok(())
}

pub async fn list_tasks(runtime: CliRuntime, status: Option<&str>) -> CoreResult<()> {
    let filter = status.map(str::parse::<TaskStatus>).transpose()?;
    let tasks = runtime.queue.list_tasks(filter).await?;

    for task in &tasks {
        let instruction: String = task.instruction.chars().take(60).collect();
        println!(
            "{}  {:<12}  {}  {}",
            task.id,
            task.status.as_str(),
            task.created_at,
            instruction
        );
    }
    if tasks.is_empty() {
        println!("no tasks");
    }
    Ok(())
}

pub async fn cancel_task(runtime: CliRuntime, id: &str) -> CoreResult<()> {
    let task = runtime
        .queue
        .get_task(id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task '{}' not found", id)))?;

    if task.status.is_terminal() {
        return Err(CoreError::Validation(format!(
            "task '{}' is already {}",
            id,
            task.status.as_str()
        )));
    }

    runtime
        .queue
        .update_task_status(id, TaskStatus::Failed, None, Some("cancelled by operator"))
        .await?;
    println!("cancelled {}", id);
    Ok(())
}
