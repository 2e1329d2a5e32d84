pub mod adapter;
pub mod types;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils;

/// Client user-agent prefix identifying a BTCAgent.
pub const BTC_AGENT_USER_AGENT_PREFIX: &str = "btccom-agent/";

/// Client user-agent prefix identifying a NiceHash client.
pub const NICEHASH_USER_AGENT_PREFIX: &str = "nicehash/";

/// Protocol tag prefix of the NiceHash Ethereum Stratum dialect.
pub const ETHEREUM_STRATUM_NICEHASH_PREFIX: &str = "ethereumstratum/";

/// Version string answered to NiceHash Ethereum clients.
pub const ETHEREUM_STRATUM_NICEHASH_VERSION: &str = "EthereumStratum/1.0.0";

/// Protocol string sent upstream on behalf of ETHProxy clients.
pub const ETH_PROXY_VERSION: &str = "ETHProxy/1.0.0";

/// User agent sent upstream when the miner did not supply one.
pub const DEFAULT_USER_AGENT: &str = "loka-switcher";

/// How long the first client byte may take to arrive.
pub const PROTOCOL_DETECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the client handshake may take to reach authorize.
pub const FIND_WORKER_NAME_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the upstream may take to answer subscribe and authorize.
pub const UPSTREAM_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy loops give up a blocked read or write this often to re-check that
/// their incarnation is still current.
pub const IO_CYCLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Extra dial attempts after an upstream drops, spaced by the retry delay.
pub const UPSTREAM_RETRY_ATTEMPTS: u32 = 10;
pub const UPSTREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Back-off of the coin watcher when the coordinator misbehaves.
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Read buffers are kept small so little data sits buffered at handoff.
pub const IO_BUFFER_SIZE: usize = 128;

/// The Stratum dialect a session speaks, settled during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolKind {
    BitcoinStratum,
    EthereumStratum,
    EthereumStratumNiceHash,
    EthereumProxy,
    #[default]
    Unknown,
}

/// Chain family served by a proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainType {
    Bitcoin,
    DecredNormal,
    DecredGoMiner,
    Ethereum,
}

impl ChainType {
    /// The protocol assumed before the handshake provides evidence. Ethereum
    /// defaults to the proxy dialect because it has no subscribe phase; a
    /// subscribe upgrades it to one of the stratum variants.
    pub fn default_protocol(self) -> ProtocolKind {
        match self {
            // Decred speaks a protocol nearly identical to Bitcoin's.
            ChainType::Bitcoin | ChainType::DecredNormal | ChainType::DecredGoMiner => {
                ProtocolKind::BitcoinStratum
            }
            ChainType::Ethereum => ProtocolKind::EthereumProxy,
        }
    }

    /// Chain-specific rendering of the session id, used as the miner's
    /// ExtraNonce1 and correlated against upstream subscribe replies.
    pub fn session_id_string(self, session_id: u32) -> String {
        match self {
            ChainType::Bitcoin => utils::u32_to_hex_be(session_id),
            ChainType::DecredNormal => {
                format!("0000000000000000{}", utils::u32_to_hex_le(session_id))
            }
            ChainType::DecredGoMiner => utils::u32_to_hex_le(session_id),
            // Ethereum session ids are 24 bit.
            ChainType::Ethereum => utils::u32_to_hex_be(session_id)[2..].to_string(),
        }
    }
}
