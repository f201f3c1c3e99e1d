//! Node configuration with layered loading.
//!
//! Later sources override earlier ones:
//!
//! 1. Compiled defaults (the `Default` impls below)
//! 2. A TOML file, by default `bitname.toml` or the path in `BITNAME_CONFIG`
//! 3. `BITNAME__*` environment variables, `__` separating nested keys
//!    (e.g. `BITNAME__CHANNEL__MIN_NAME_DIFFICULTY=20`)
//!
//! ```toml
//! [channel]
//! name_db_dir = "data/names"
//! min_name_difficulty = 24
//!
//! [network]
//! listen_addr = "0.0.0.0:9876"
//! seeds = ["203.0.113.5:9876"]
//! ```

use crate::consensus::ConsensusRules;
use crate::constants::{
    DEFAULT_MINING_THREADS, DEFAULT_RPC_PORT, DEFAULT_SERVER_PORT, DESIRED_PEER_COUNT,
    INVENTORY_WINDOW_SECS, MAX_BLOCK_TRXS, MAX_HEADERS_PER_MESSAGE, MAX_MESSAGE_SIZE,
    MIN_BLOCK_DIFFICULTY, MIN_NAME_DIFFICULTY,
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings consumed by the name channel and its chain state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Registry and block storage; `None` keeps everything in memory
    pub name_db_dir: Option<PathBuf>,
    pub min_name_difficulty: u8,
    pub min_block_difficulty: u8,
    pub max_message_size: usize,
    pub inventory_window_secs: u64,
    pub max_headers_per_message: usize,
    pub max_block_trxs: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name_db_dir: None,
            min_name_difficulty: MIN_NAME_DIFFICULTY,
            min_block_difficulty: MIN_BLOCK_DIFFICULTY,
            max_message_size: MAX_MESSAGE_SIZE,
            inventory_window_secs: INVENTORY_WINDOW_SECS,
            max_headers_per_message: MAX_HEADERS_PER_MESSAGE,
            max_block_trxs: MAX_BLOCK_TRXS,
        }
    }
}

impl ChannelConfig {
    pub fn rules(&self) -> ConsensusRules {
        ConsensusRules {
            min_name_difficulty: self.min_name_difficulty,
            min_block_difficulty: self.min_block_difficulty,
            max_block_trxs: self.max_block_trxs,
        }
    }

    pub fn inventory_window(&self) -> Duration {
        Duration::from_secs(self.inventory_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// Peers dialed at startup
    pub seeds: Vec<String>,
    pub desired_peer_count: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_SERVER_PORT),
            seeds: Vec::new(),
            desired_peer_count: DESIRED_PEER_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub enabled: bool,
    pub threads: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: DEFAULT_MINING_THREADS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub channel: ChannelConfig,
    pub network: NetworkConfig,
    pub mining: MiningConfig,
    pub rpc: RpcConfig,
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Load from a TOML file (optional) with `BITNAME__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("BITNAME")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("network.seeds"),
            )
            .build()?
            .try_deserialize()
    }

    /// Load from `BITNAME_CONFIG`, falling back to `bitname.toml`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("BITNAME_CONFIG").unwrap_or_else(|_| "bitname.toml".to_string());
        Self::from_file(config_path)
    }

    pub fn validate(&self) -> Result<(), String> {
        let channel = &self.channel;
        if channel.max_message_size == 0 {
            return Err("channel.max_message_size must be greater than 0".to_string());
        }
        if channel.inventory_window_secs == 0 {
            return Err("channel.inventory_window_secs must be greater than 0".to_string());
        }
        if channel.max_headers_per_message == 0 {
            return Err("channel.max_headers_per_message must be greater than 0".to_string());
        }
        if channel.max_headers_per_message > MAX_HEADERS_PER_MESSAGE {
            return Err(format!(
                "channel.max_headers_per_message may not exceed {}",
                MAX_HEADERS_PER_MESSAGE
            ));
        }
        if channel.max_block_trxs == 0 {
            return Err("channel.max_block_trxs must be greater than 0".to_string());
        }
        if self.network.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("invalid network.listen_addr: {}", self.network.listen_addr));
        }
        if self.network.desired_peer_count == 0 {
            return Err("network.desired_peer_count must be greater than 0".to_string());
        }
        if self.mining.enabled && self.mining.threads == 0 {
            return Err("mining.threads must be greater than 0".to_string());
        }
        if self.rpc.enabled && self.rpc.port == 0 {
            return Err("rpc.port must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            ));
        }
        Ok(())
    }
}
