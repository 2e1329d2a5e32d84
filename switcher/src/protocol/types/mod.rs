mod request;
mod response;

pub use request::Request;
pub use response::Response;

/// JSON-RPC wire version used toward the client. ETHProxy clients expect
/// version 2 framing on responses; everything else stays on version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonRpcVersion {
    #[default]
    V1,
    V2,
}
