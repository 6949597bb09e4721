use vigil::error::CoreResult;

use super::CliRuntime;

pub async fn reload_tool(runtime: CliRuntime, name: &str) -> CoreResult<()> {
    runtime.broker.force_reload(name).await?;

    let status = runtime.broker.cache_status().await;
    if let Some(server) = status.iter().find(|s| s.name == name) {
        println!(
            "{}: reloaded (ttl {}s, load #{})",
            server.name, server.ttl_secs, server.load_count
        );
    }
    Ok(())
}
