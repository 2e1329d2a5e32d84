use serde_json::{json, Value};
use thiserror::Error;

/// Error types of the switching proxy.
#[derive(Error, Debug)]
pub enum SwitcherError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{phase} timed out")]
    Timeout { phase: &'static str },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown protocol from client")]
    UnknownProtocol,

    #[error("coordinator error: {0}")]
    Coordinator(#[from] crate::coordinator::StoreError),

    #[error("too many pending auto-register requests")]
    TooManyPendingAutoReg,

    #[error("session id mismatch: upstream sent {got}, expected {expected}")]
    SessionIdMismatch { got: String, expected: String },

    #[error("cannot parse upstream subscribe response")]
    ParseSubscribeResponse,

    #[error("upstream rejected authorization")]
    AuthorizeFailed,

    #[error("stratum error: {0}")]
    Stratum(#[from] StratumError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for the switcher.
pub type Result<T> = std::result::Result<T, SwitcherError>;

/// An error in the shape miners understand: `[code, message, extra]` inside
/// the `error` member of a response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct StratumError {
    pub code: i32,
    pub message: &'static str,
}

impl StratumError {
    pub const fn new(code: i32, message: &'static str) -> Self {
        Self { code, message }
    }

    pub const UNKNOWN_CHAIN_TYPE: StratumError = StratumError::new(101, "Unknown Chain Type");
    pub const DUPLICATE_SUBSCRIBED: StratumError = StratumError::new(102, "Duplicate Subscribed");
    pub const NEED_SUBSCRIBED: StratumError = StratumError::new(103, "Need Subscribed");
    pub const TOO_FEW_PARAMS: StratumError = StratumError::new(104, "Too Few Params");
    pub const WORKER_NAME_MUST_BE_STRING: StratumError =
        StratumError::new(105, "Worker Name Must be a String");
    pub const WORKER_NAME_START_WRONG: StratumError =
        StratumError::new(106, "Worker Name Cannot Start with '.'");
    pub const INVALID_SUB_ACCOUNT_NAME: StratumError =
        StratumError::new(201, "Invalid Sub-account Name");
    pub const STRATUM_SERVER_NOT_FOUND: StratumError =
        StratumError::new(301, "Stratum Server Not Found");
    pub const CONNECT_STRATUM_SERVER_FAILED: StratumError =
        StratumError::new(302, "Connect Stratum Server Failed");
    pub const TOO_MANY_PENDING_AUTO_REG: StratumError =
        StratumError::new(303, "Too Many Pending Auto Register Requests");

    /// Renders the error for the wire. `server_id` identifies this proxy
    /// instance in miner-visible messages.
    pub fn to_rpc_array(&self, server_id: u8) -> Value {
        json!([
            self.code,
            format!("{} (switcher {})", self.message, server_id),
            Value::Null
        ])
    }
}
