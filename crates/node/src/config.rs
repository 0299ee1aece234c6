use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

fn default_max_requests() -> usize {
    10
}
fn default_ping_deadline_ms() -> u64 {
    600_000
}
fn default_ping_sleep_ms() -> u64 {
    10_000
}
fn default_ping_floor_ms() -> u64 {
    2_000
}
fn default_job_expiry_ms() -> u64 {
    120_000
}
fn default_close_no_reply_ms() -> u64 {
    120_000
}
fn default_init_deadline_ms() -> u64 {
    30_000
}
fn default_batch_throttle_ms() -> u64 {
    2_000
}
fn default_block_throttle_ms() -> u64 {
    1_000
}
fn default_tx_throttle_ms() -> u64 {
    1_000
}
fn default_dial_backoff_start_ms() -> u64 {
    1_000
}
fn default_dial_backoff_cap_ms() -> u64 {
    300_000
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_ping_deadline_ms")]
    pub ping_deadline_ms: u64,
    #[serde(default = "default_ping_sleep_ms")]
    pub ping_sleep_ms: u64,
    #[serde(default = "default_ping_floor_ms")]
    pub ping_floor_ms: u64,
    #[serde(default = "default_job_expiry_ms")]
    pub job_expiry_ms: u64,
    #[serde(default = "default_close_no_reply_ms")]
    pub close_no_reply_ms: u64,
    #[serde(default = "default_init_deadline_ms")]
    pub init_deadline_ms: u64,
    #[serde(default = "default_batch_throttle_ms")]
    pub batch_throttle_ms: u64,
    #[serde(default = "default_block_throttle_ms")]
    pub block_throttle_ms: u64,
    #[serde(default = "default_tx_throttle_ms")]
    pub tx_throttle_ms: u64,
    #[serde(default = "default_dial_backoff_start_ms")]
    pub dial_backoff_start_ms: u64,
    #[serde(default = "default_dial_backoff_cap_ms")]
    pub dial_backoff_cap_ms: u64,
    #[serde(default)]
    pub connect: Vec<SocketAddr>,
    #[serde(default)]
    pub log_communication: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            ping_deadline_ms: default_ping_deadline_ms(),
            ping_sleep_ms: default_ping_sleep_ms(),
            ping_floor_ms: default_ping_floor_ms(),
            job_expiry_ms: default_job_expiry_ms(),
            close_no_reply_ms: default_close_no_reply_ms(),
            init_deadline_ms: default_init_deadline_ms(),
            batch_throttle_ms: default_batch_throttle_ms(),
            block_throttle_ms: default_block_throttle_ms(),
            tx_throttle_ms: default_tx_throttle_ms(),
            dial_backoff_start_ms: default_dial_backoff_start_ms(),
            dial_backoff_cap_ms: default_dial_backoff_cap_ms(),
            connect: Vec::new(),
            log_communication: false,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError {
            message: format!("bad node config: {err}"),
        })
    }

    // Shrunk timings for local debugging, matching the one-minute ping
    // deadline variant.
    pub fn local_debug() -> Self {
        Self {
            ping_deadline_ms: 60_000,
            ..Self::default()
        }
    }

    pub fn ping_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_deadline_ms)
    }

    pub fn ping_sleep(&self) -> Duration {
        Duration::from_millis(self.ping_sleep_ms)
    }

    pub fn ping_floor(&self) -> Duration {
        Duration::from_millis(self.ping_floor_ms)
    }

    pub fn job_expiry(&self) -> Duration {
        Duration::from_millis(self.job_expiry_ms)
    }

    pub fn close_no_reply(&self) -> Duration {
        Duration::from_millis(self.close_no_reply_ms)
    }

    pub fn init_deadline(&self) -> Duration {
        Duration::from_millis(self.init_deadline_ms)
    }

    pub fn batch_throttle(&self) -> Duration {
        Duration::from_millis(self.batch_throttle_ms)
    }

    pub fn block_throttle(&self) -> Duration {
        Duration::from_millis(self.block_throttle_ms)
    }

    pub fn tx_throttle(&self) -> Duration {
        Duration::from_millis(self.tx_throttle_ms)
    }

    pub fn dial_backoff_start(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_start_ms)
    }

    pub fn dial_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = NodeConfig::default();
        assert_eq!(config.max_requests, 10);
        assert_eq!(config.ping_deadline(), Duration::from_secs(600));
        assert!(config.connect.is_empty());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = NodeConfig::from_toml_str(
            r#"
            max_requests = 4
            connect = ["127.0.0.1:9186"]
            log_communication = true
            "#,
        )
        .expect("parse");
        assert_eq!(config.max_requests, 4);
        assert_eq!(config.connect.len(), 1);
        assert!(config.log_communication);
        assert_eq!(config.ping_sleep_ms, default_ping_sleep_ms());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(NodeConfig::from_toml_str("max_requests = \"ten\"").is_err());
    }
}
