use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A Stratum JSON-RPC request. A request with a null `id` is a notification.
///
/// The `worker` member is an extension some Ethereum miners attach to
/// `eth_submitLogin`; the `jsonrpc` tag is decoded and re-emitted verbatim
/// so round-tripping a v2 request preserves it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker: String,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: &str, params: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            jsonrpc: None,
            method: method.to_string(),
            params,
            worker: String::new(),
        }
    }

    pub fn notification(method: &str, params: Vec<Value>) -> Self {
        Self::new(Value::Null, method, params)
    }

    pub fn from_line(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line)
    }

    /// Serializes to a newline-terminated wire frame.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }

    /// String parameter at `index`, if present.
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index)?.as_str()
    }
}
