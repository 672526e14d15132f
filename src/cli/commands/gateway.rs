//! Gateway command - runs the UDP gateway.

use anyhow::Result;

use crate::cli::args::GatewayArgs;
use crate::core::config::Config;
use crate::core::runtime;
use crate::ops::telemetry;

pub async fn run_gateway(args: GatewayArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_from_env()?,
    };
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    runtime::run_gateway(config, Some(log_handle)).await
}
