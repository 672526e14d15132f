//! MQTT-SN - unified CLI entrypoint.
//!
//! Usage:
//!   mqttsn gateway --config config/gateway.toml
//!   mqttsn publish --topic sensors/temp --message 21.5
//!   mqttsn subscribe --topic "sensors/#"

use anyhow::Result;
use clap::Parser;
use mqttsn::cli::commands::{run_gateway, run_publish, run_subscribe};
use mqttsn::cli::{Cli, Commands};
use mqttsn::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The gateway sizes its worker pool from configuration, so the runtime
    // is built by hand rather than via the macro.
    let worker_threads = match &cli.command {
        Commands::Gateway(args) => {
            let config = match &args.config {
                Some(path) => Config::load(path)?,
                None => Config::load_from_env()?,
            };
            config.state.queue_processor_thread_count.max(2)
        }
        _ => 2,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Gateway(args) => run_gateway(args).await,
            Commands::Publish(args) => run_publish(args).await,
            Commands::Subscribe(args) => run_subscribe(args).await,
        }
    })
}
