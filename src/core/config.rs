use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::ProtocolVersion;
use crate::state::StateOptions;

/// Top-level configuration for the MQTT-SN runtime. All time-valued options
/// are milliseconds.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Client id of this runtime (the gateway's own context id, or the
    /// default client id for the client CLI).
    #[serde(default = "default_context_id")]
    pub context_id: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: ProtocolVersion,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            context_id: default_context_id(),
            protocol_version: default_protocol_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// UDP bind address for the gateway listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Admin console bind address; disabled when absent.
    #[serde(default)]
    pub console_bind: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            console_bind: None,
        }
    }
}

/// Message state core options. All durations are milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_max_messages_inflight")]
    pub max_messages_inflight: usize,
    #[serde(default = "default_max_error_retries")]
    pub max_error_retries: u32,
    #[serde(default = "default_max_error_retry_time")]
    pub max_error_retry_time: u64,
    #[serde(default = "default_max_time_inflight")]
    pub max_time_inflight: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait: u64,
    #[serde(default = "default_msg_id_start")]
    pub msg_id_start: u16,
    #[serde(default = "default_min_flush_time")]
    pub min_flush_time: u64,
    #[serde(default = "default_active_context_timeout")]
    pub active_context_timeout: u64,
    #[serde(default = "default_state_loop_timeout")]
    pub state_loop_timeout: u64,
    #[serde(default = "default_queue_processor_thread_count")]
    pub queue_processor_thread_count: usize,
    #[serde(default = "default_requeue_on_inflight_timeout")]
    pub requeue_on_inflight_timeout: bool,
    #[serde(default)]
    pub reap_receiving_messages: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_messages_inflight: default_max_messages_inflight(),
            max_error_retries: default_max_error_retries(),
            max_error_retry_time: default_max_error_retry_time(),
            max_time_inflight: default_max_time_inflight(),
            max_wait: default_max_wait(),
            msg_id_start: default_msg_id_start(),
            min_flush_time: default_min_flush_time(),
            active_context_timeout: default_active_context_timeout(),
            state_loop_timeout: default_state_loop_timeout(),
            queue_processor_thread_count: default_queue_processor_thread_count(),
            requeue_on_inflight_timeout: default_requeue_on_inflight_timeout(),
            reap_receiving_messages: false,
        }
    }
}

impl StateConfig {
    pub fn to_options(&self) -> StateOptions {
        StateOptions {
            max_messages_inflight: self.max_messages_inflight,
            max_error_retries: self.max_error_retries,
            max_error_retry_time: Duration::from_millis(self.max_error_retry_time),
            max_time_inflight: Duration::from_millis(self.max_time_inflight),
            max_wait: Duration::from_millis(self.max_wait),
            msg_id_start: self.msg_id_start,
            min_flush_time: Duration::from_millis(self.min_flush_time),
            active_context_timeout: Duration::from_millis(self.active_context_timeout),
            state_loop_timeout: Duration::from_millis(self.state_loop_timeout),
            requeue_on_inflight_timeout: self.requeue_on_inflight_timeout,
            reap_receiving_messages: self.reap_receiving_messages,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_messages_in_queue")]
    pub max_messages_in_queue: usize,
    #[serde(default = "default_message_registry_ttl")]
    pub message_registry_ttl: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_messages_in_queue: default_max_messages_in_queue(),
            message_registry_ttl: default_message_registry_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// When set, publish payloads carry an integrity digest.
    #[serde(default)]
    pub integrity_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TopicConfig {
    /// Predefined topic table: full path -> 16-bit topic id.
    #[serde(default)]
    pub predefined: HashMap<String, u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via `MQTTSN_CONFIG`, falling
    /// back to built-in defaults when neither is present.
    pub fn load_from_env() -> Result<Self> {
        match std::env::var("MQTTSN_CONFIG") {
            Ok(path) => Self::load(PathBuf::from(path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific file (TOML or JSON by extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let cfg: Self = if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate schema-level invariants before startup.
    pub fn validate(&self) -> Result<()> {
        if self.identity.context_id.is_empty() {
            bail!("identity.context_id must be non-empty");
        }
        if self.state.max_messages_inflight == 0 {
            bail!("state.max_messages_inflight must be > 0");
        }
        if self.state.msg_id_start == 0 {
            bail!("state.msg_id_start must be >= 1");
        }
        if self.state.state_loop_timeout == 0 {
            bail!("state.state_loop_timeout must be > 0");
        }
        if self.state.queue_processor_thread_count == 0 {
            bail!("state.queue_processor_thread_count must be > 0");
        }
        if self.queue.max_messages_in_queue == 0 {
            bail!("queue.max_messages_in_queue must be > 0");
        }
        self.network
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("network.bind {} is not an address", self.network.bind))?;
        if let Some(console) = &self.network.console_bind {
            console
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("network.console_bind {console} is not an address"))?;
            if console == &self.network.bind {
                bail!("network.console_bind must differ from network.bind");
            }
        }
        for (path, id) in &self.topics.predefined {
            if path.is_empty() || *id == 0 {
                bail!("topics.predefined entries need a non-empty path and a non-zero id");
            }
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn default_context_id() -> String {
    "mqttsn-gateway".to_string()
}

fn default_protocol_version() -> ProtocolVersion {
    ProtocolVersion::V1_2
}

fn default_bind() -> String {
    "0.0.0.0:2442".to_string()
}

fn default_max_messages_inflight() -> usize {
    1
}

fn default_max_error_retries() -> u32 {
    3
}

fn default_max_error_retry_time() -> u64 {
    5_000
}

fn default_max_time_inflight() -> u64 {
    20_000
}

fn default_max_wait() -> u64 {
    10_000
}

fn default_msg_id_start() -> u16 {
    1
}

fn default_min_flush_time() -> u64 {
    25
}

fn default_active_context_timeout() -> u64 {
    20_000
}

fn default_state_loop_timeout() -> u64 {
    50
}

fn default_queue_processor_thread_count() -> usize {
    2
}

fn default_requeue_on_inflight_timeout() -> bool {
    true
}

fn default_max_messages_in_queue() -> usize {
    100
}

fn default_message_registry_ttl() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_apply() {
        let doc = r#"
            [identity]
            context_id = "gw-1"
            protocol_version = "v2_0"

            [state]
            max_messages_inflight = 4
            msg_id_start = 100

            [topics.predefined]
            "control/reboot" = 42
        "#;
        let cfg: Config = toml::from_str(doc).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.identity.context_id, "gw-1");
        assert_eq!(cfg.identity.protocol_version, ProtocolVersion::V2_0);
        assert_eq!(cfg.state.max_messages_inflight, 4);
        assert_eq!(cfg.state.msg_id_start, 100);
        assert_eq!(cfg.topics.predefined["control/reboot"], 42);
        // Untouched options keep their defaults.
        assert_eq!(cfg.state.max_wait, 10_000);
        assert!(cfg.state.requeue_on_inflight_timeout);
    }

    #[test]
    fn zero_msg_id_start_is_rejected() {
        let cfg = Config {
            state: StateConfig {
                msg_id_start: 0,
                ..StateConfig::default()
            },
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn console_bind_must_differ_from_listener() {
        let cfg = Config {
            network: NetworkConfig {
                bind: "127.0.0.1:2442".into(),
                console_bind: Some("127.0.0.1:2442".into()),
            },
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
