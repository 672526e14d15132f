//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// MQTT-SN gateway and client tools.
#[derive(Parser)]
#[command(name = "mqttsn")]
#[command(version)]
#[command(about = "MQTT-SN gateway, publisher, and subscriber")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the UDP gateway
    Gateway(GatewayArgs),

    /// Publish a message through a gateway (kcat-style)
    Publish(PublishArgs),

    /// Subscribe to a topic and stream messages to stdout (kcat-style)
    Subscribe(SubscribeArgs),
}

// -----------------------------------------------------------------------------
// Gateway command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct GatewayArgs {
    /// Path to a configuration file (TOML or JSON); defaults apply when
    /// omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

// -----------------------------------------------------------------------------
// Client commands
// -----------------------------------------------------------------------------

/// QoS as a CLI flag.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QosLevel {
    /// Fire-and-forget without a connection
    #[value(name = "-1")]
    MinusOne,
    #[value(name = "0")]
    AtMostOnce,
    #[value(name = "1")]
    AtLeastOnce,
    #[value(name = "2")]
    ExactlyOnce,
}

impl QosLevel {
    pub fn to_qos(self) -> crate::codec::Qos {
        match self {
            QosLevel::MinusOne => crate::codec::Qos::MinusOne,
            QosLevel::AtMostOnce => crate::codec::Qos::AtMostOnce,
            QosLevel::AtLeastOnce => crate::codec::Qos::AtLeastOnce,
            QosLevel::ExactlyOnce => crate::codec::Qos::ExactlyOnce,
        }
    }
}

/// Connection arguments shared by publish/subscribe.
#[derive(Args, Clone)]
pub struct ConnectionArgs {
    /// Gateway hostname or IP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Gateway UDP port
    #[arg(long, default_value_t = 2442)]
    pub port: u16,

    /// Client id; derived from the process id when omitted
    #[arg(long)]
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds
    #[arg(long, default_value_t = 60)]
    pub keep_alive: u16,

    /// Open the session with clean-session set
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub clean_session: bool,

    /// Optional config file for state-core and security options
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Topic to publish to
    #[arg(short, long)]
    pub topic: String,

    /// QoS level
    #[arg(short, long, value_enum, default_value = "1")]
    pub qos: QosLevel,

    /// Retain flag
    #[arg(long)]
    pub retain: bool,

    /// Message payload; read from stdin when omitted
    #[arg(short, long)]
    pub message: Option<String>,
}

#[derive(Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Topic filter to subscribe to
    #[arg(short, long)]
    pub topic: String,

    /// Requested QoS level
    #[arg(short, long, value_enum, default_value = "1")]
    pub qos: QosLevel,

    /// Exit after receiving this many messages
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}
