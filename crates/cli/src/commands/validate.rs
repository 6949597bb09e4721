use vigil::error::CoreResult;
use vigil::mcp::FleetConfig;
use vigil_agent::recurring::load_scheduled_tasks;
use vigil_agent::RuntimeConfig;

use crate::cli_args::CliArgs;

/// Load every config surface and report what was found. Errors propagate as
/// validation failures (exit code 1).
pub async fn validate_config(args: &CliArgs) -> CoreResult<()> {
    let config = RuntimeConfig::load(&args.config)?;
    println!("runtime config: ok (model {})", config.model);

    let fleet = FleetConfig::discover(config.mcp_config.as_deref())?;
    println!("tool fleet: {} server(s)", fleet.servers.len());
    for server in &fleet.servers {
        let kind = if server.is_stdio() { "stdio" } else { "sse" };
        println!("  - {} ({})", server.name, kind);
    }

    let specs = load_scheduled_tasks(&config.scheduled_tasks);
    println!("scheduled tasks: {} spec(s)", specs.len());
    for spec in &specs {
        println!(
            "  - {} ({})",
            spec.name,
            if spec.enabled { "enabled" } else { "disabled" }
        );
    }

    Ok(())
}
