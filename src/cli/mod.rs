//! MQTT-SN CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `mqttsn gateway` - Run the UDP gateway
//! - `mqttsn publish` - Publish a message through a gateway
//! - `mqttsn subscribe` - Subscribe and stream messages to stdout

mod args;
pub mod commands;

pub use args::{Cli, Commands, GatewayArgs, PublishArgs, QosLevel, SubscribeArgs};
