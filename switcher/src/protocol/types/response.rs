use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JsonRpcVersion;

/// A Stratum JSON-RPC response. Every member is optional on the wire; a
/// decoded response with a null `id` must be dispatched as a notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
}

/// JSON-RPC 2.0 rendering used toward ETHProxy clients.
#[derive(Serialize)]
struct V2Response<'a> {
    id: &'a Value,
    jsonrpc: &'static str,
    result: &'a Value,
    error: &'a Value,
}

impl Response {
    pub fn new(id: Value, result: Value, error: Value) -> Self {
        Self { id, result, error }
    }

    pub fn from_line(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line)
    }

    /// Serializes to a newline-terminated wire frame in the given dialect.
    pub fn to_line(&self, version: JsonRpcVersion) -> serde_json::Result<String> {
        let mut line = match version {
            JsonRpcVersion::V1 => serde_json::to_string(self)?,
            JsonRpcVersion::V2 => serde_json::to_string(&V2Response {
                id: &self.id,
                jsonrpc: "2.0",
                result: &self.result,
                error: &self.error,
            })?,
        };
        line.push('\n');
        Ok(line)
    }
}
