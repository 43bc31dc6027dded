//! Vault Agent - delegated rebalancing service for the yield vault.

use anyhow::Result;
use vault_common::config::Config;
use vault_common::logging::init_logging_with_exclusions;
use vault_agent::AgentService;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_and_validate()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Vault Agent v{}", env!("CARGO_PKG_VERSION"));

    let service = AgentService::new(config).await?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}
