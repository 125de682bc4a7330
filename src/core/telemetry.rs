use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;

/// Initialize logging with an env-filter level directive.
pub fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))
}
