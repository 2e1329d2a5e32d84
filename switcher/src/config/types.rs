use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::protocol::ChainType;
use crate::session::SessionIdPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub coordinator: CoordinatorConfig,
    /// Coin name -> upstream stratum server. Immutable at runtime.
    #[serde(default)]
    pub coins: HashMap<String, StratumServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeder: Option<SeederConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener bind address (default: 0.0.0.0:3333)
    pub bind_address: SocketAddr,
    /// Numeric identifier embedded in miner-visible error messages
    pub id: u8,
    /// Chain family served by this instance
    pub chain: ChainType,
    /// Upper bound of the session id domain
    #[serde(default = "default_max_session_id")]
    pub max_session_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Directory of per-sub-account coin assignments, with trailing slash
    pub switcher_watch_dir: String,
    /// Directory of pending auto-registration slots, with trailing slash
    pub auto_register_watch_dir: String,
    /// Directory of the lower-cased sub-account index; empty disables it
    #[serde(default)]
    pub user_case_insensitive_index: String,
    /// Whether upstream servers treat sub-account names case-insensitively
    #[serde(default)]
    pub stratum_server_case_insensitive: bool,
    /// Attempt auto-registration for unknown sub-accounts
    #[serde(default)]
    pub auto_register: bool,
    /// Cap on concurrently pending auto-registrations
    #[serde(default = "default_auto_register_max_pending")]
    pub auto_register_max_pending: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumServerInfo {
    /// host:port of the upstream server
    pub url: String,
    /// Suffix appended to the sub-account on the authorize retry; the coin
    /// name is used when empty
    #[serde(default)]
    pub user_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeederConfig {
    /// Coin name -> user-enumeration endpoint
    pub user_list_api: HashMap<String, String>,
    /// Seconds between polling iterations
    pub interval_seconds: u64,
}

fn default_max_session_id() -> u32 {
    SessionIdPool::DEFAULT_MAX
}

fn default_auto_register_max_pending() -> u32 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3333".parse().unwrap(),
            id: 1,
            chain: ChainType::Bitcoin,
            max_session_id: default_max_session_id(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            switcher_watch_dir: "/switcher/coins/".to_string(),
            auto_register_watch_dir: "/switcher/autoreg/".to_string(),
            user_case_insensitive_index: String::new(),
            stratum_server_case_insensitive: true,
            auto_register: false,
            auto_register_max_pending: default_auto_register_max_pending(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            coins: HashMap::new(),
            seeder: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::SwitcherError::Config(format!("failed to read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::SwitcherError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// A populated example, used by the `init` subcommand.
    pub fn example() -> Self {
        let mut config = Config::default();
        config.coins.insert(
            "btc".to_string(),
            StratumServerInfo {
                url: "10.0.0.1:3333".to_string(),
                user_suffix: "btc".to_string(),
            },
        );
        config.coins.insert(
            "bch".to_string(),
            StratumServerInfo {
                url: "10.0.0.2:3333".to_string(),
                user_suffix: "bch".to_string(),
            },
        );
        config.seeder = Some(SeederConfig {
            user_list_api: HashMap::from([
                (
                    "btc".to_string(),
                    "http://127.0.0.1:8000/userlist-btc".to_string(),
                ),
                (
                    "bch".to_string(),
                    "http://127.0.0.1:8000/userlist-bch".to_string(),
                ),
            ]),
            interval_seconds: 10,
        });
        config
    }
}
