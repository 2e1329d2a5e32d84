use serde::{Deserialize, Serialize};

use crate::protocol::types::{JsonRpcVersion, Request};
use crate::protocol::ProtocolKind;

/// Mutable per-session state captured during the handshake and replayed on
/// every migration. Guarded by the session's state lock; proxy tasks
/// snapshot what they need at spawn time.
#[derive(Debug, Default)]
pub struct SessionState {
    pub protocol: ProtocolKind,
    pub is_btc_agent: bool,
    pub is_nicehash_client: bool,
    pub rpc_version: JsonRpcVersion,
    /// Version-rolling mask requested by the miner; zero when absent.
    pub version_mask: u32,
    pub full_worker_name: String,
    pub subaccount_name: String,
    /// Miner part of the worker name, including the leading dot.
    pub miner_name_with_dot: String,
    pub subscribe_request: Option<Request>,
    pub authorize_request: Option<Request>,
    pub mining_coin: String,
    pub watch_path: String,
}

/// Snapshot handed over when an established session is resumed together
/// with an already-connected upstream socket (controlled handover).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub version_mask: u32,
    pub subscribe_request: Option<Request>,
    pub authorize_request: Option<Request>,
    pub mining_coin: String,
}
