//! Start command - launches the broker and the device gateway.

use crate::cli::StartArgs;
use crate::config::Config;
use crate::runtime::Runtime;
use crate::telemetry;
use anyhow::Result;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::from_env()?;
    config.validate()?;

    let level = args.log_level.as_deref().or(config.log_level.as_deref());
    telemetry::init_tracing(level)?;

    let runtime = Runtime::new(config)?;
    runtime.run().await
}
