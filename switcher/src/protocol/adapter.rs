//! Per-chain handshake logic: parsing the client's subscribe/authorize
//! sequence, rewriting the cached requests for an upstream, and validating
//! the upstream's replies against the session identity.

use std::net::IpAddr;

use serde_json::{json, Value};

use crate::error::{Result, StratumError, SwitcherError};
use crate::protocol::types::{JsonRpcVersion, Request, Response};
use crate::protocol::{
    ChainType, ProtocolKind, BTC_AGENT_USER_AGENT_PREFIX, DEFAULT_USER_AGENT,
    ETHEREUM_STRATUM_NICEHASH_PREFIX, ETHEREUM_STRATUM_NICEHASH_VERSION, ETH_PROXY_VERSION,
    NICEHASH_USER_AGENT_PREFIX,
};
use crate::session::SessionState;
use crate::utils;

/// Client authorization progress during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorizeStat {
    #[default]
    Connected,
    Subscribed,
    Authorized,
}

/// Per-session inputs the handshake dispatch needs besides the mutable state.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub chain: ChainType,
    pub session_id: u32,
    pub session_id_string: String,
    /// Whether sub-account names are regularised by lower-casing.
    pub case_insensitive: bool,
}

pub fn version_mask_str(mask: u32) -> String {
    format!("{mask:08x}")
}

/// The ExtraNonce announced to a NiceHash-variant client. NiceHash Ethereum
/// miners only accept up to two bytes, so they get a truncated one.
pub fn nicehash_extra_nonce(state: &SessionState, ctx: &AdapterContext) -> String {
    if state.is_nicehash_client {
        ctx.session_id_string[..4].to_string()
    } else {
        ctx.session_id_string.clone()
    }
}

pub fn regular_subaccount_name(name: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

/// Handshake method dispatch. Returns the result to answer the client with,
/// or `None` when no reply is due (authorize waits for the upstream's
/// verdict). Unknown methods are ignored.
pub fn handle_request(
    state: &mut SessionState,
    ctx: &AdapterContext,
    request: &Request,
    stat: &mut AuthorizeStat,
) -> std::result::Result<Option<Value>, StratumError> {
    match request.method.as_str() {
        "mining.subscribe" => {
            if *stat != AuthorizeStat::Connected {
                return Err(StratumError::DUPLICATE_SUBSCRIBED);
            }
            let result = parse_subscribe(state, ctx, request)?;
            *stat = AuthorizeStat::Subscribed;
            Ok(Some(result))
        }
        "eth_submitLogin" | "mining.authorize" => {
            if request.method == "eth_submitLogin" && state.protocol == ProtocolKind::EthereumProxy
            {
                // ETHProxy has no subscribe phase: manufacture one so the
                // upstream handshake has something to replay, and switch the
                // client to JSON-RPC 2.0 replies.
                make_eth_proxy_subscribe(state);
                state.rpc_version = JsonRpcVersion::V2;
                *stat = AuthorizeStat::Subscribed;
            }
            if *stat != AuthorizeStat::Subscribed {
                return Err(StratumError::NEED_SUBSCRIBED);
            }
            parse_authorize(state, ctx, request)?;
            *stat = AuthorizeStat::Authorized;
            Ok(None)
        }
        "mining.configure" => {
            if state.protocol == ProtocolKind::BitcoinStratum {
                parse_configure(state, request)
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

fn parse_subscribe(
    state: &mut SessionState,
    ctx: &AdapterContext,
    request: &Request,
) -> std::result::Result<Value, StratumError> {
    // Kept verbatim for replay against upstreams.
    state.subscribe_request = Some(request.clone());

    match ctx.chain {
        ChainType::Bitcoin | ChainType::DecredNormal | ChainType::DecredGoMiner => {
            if let Some(agent) = request.param_str(0) {
                if agent.to_lowercase().starts_with(BTC_AGENT_USER_AGENT_PREFIX) {
                    state.is_btc_agent = true;
                }
            }
            let sid = &ctx.session_id_string;
            Ok(json!([
                [["mining.set_difficulty", sid], ["mining.notify", sid]],
                sid,
                8
            ]))
        }
        ChainType::Ethereum => {
            // A real subscribe phase rules out the proxy dialect.
            state.protocol = ProtocolKind::EthereumStratum;
            if let Some(agent) = request.param_str(0) {
                let agent = agent.to_lowercase();
                if agent.starts_with(NICEHASH_USER_AGENT_PREFIX) {
                    state.is_nicehash_client = true;
                }
                if agent.starts_with(BTC_AGENT_USER_AGENT_PREFIX) {
                    state.is_btc_agent = true;
                    state.protocol = ProtocolKind::EthereumStratumNiceHash;
                }
            }
            if let Some(protocol) = request.param_str(1) {
                if protocol
                    .to_lowercase()
                    .starts_with(ETHEREUM_STRATUM_NICEHASH_PREFIX)
                {
                    state.protocol = ProtocolKind::EthereumStratumNiceHash;
                }
            }

            if state.protocol == ProtocolKind::EthereumStratumNiceHash {
                let extra_nonce = nicehash_extra_nonce(state, ctx);
                Ok(json!([
                    [
                        "mining.notify",
                        ctx.session_id_string,
                        ETHEREUM_STRATUM_NICEHASH_VERSION
                    ],
                    extra_nonce
                ]))
            } else {
                Ok(Value::Bool(true))
            }
        }
    }
}

/// ETHProxy never subscribes; this synthetic request carries the session id
/// and miner address to the upstream in its stead.
fn make_eth_proxy_subscribe(state: &mut SessionState) {
    state.subscribe_request = Some(Request::new(
        Value::Null,
        "mining.subscribe",
        vec![json!("ETHProxy"), json!(ETH_PROXY_VERSION)],
    ));
}

fn parse_authorize(
    state: &mut SessionState,
    ctx: &AdapterContext,
    request: &Request,
) -> std::result::Result<(), StratumError> {
    state.authorize_request = Some(request.clone());

    if request.params.is_empty() {
        return Err(StratumError::TOO_FEW_PARAMS);
    }
    let Some(full_name) = request.params[0].as_str() else {
        return Err(StratumError::WORKER_NAME_MUST_BE_STRING);
    };

    let mut full_worker_name = utils::filter_worker_name(full_name);

    // Ethereum names may carry a wallet address, and the miner name itself
    // may sit in the extension field.
    if state.protocol != ProtocolKind::BitcoinStratum {
        if !request.worker.is_empty() {
            full_worker_name.push('.');
            full_worker_name.push_str(&utils::filter_worker_name(&request.worker));
        }
        full_worker_name = utils::strip_eth_addr_from_full_name(&full_worker_name).to_string();
    }

    if let Some(pos) = full_worker_name.find('.') {
        state.subaccount_name =
            regular_subaccount_name(&full_worker_name[..pos], ctx.case_insensitive);
        state.miner_name_with_dot = full_worker_name[pos..].to_string();
    } else {
        state.subaccount_name = regular_subaccount_name(&full_worker_name, ctx.case_insensitive);
        state.miner_name_with_dot = String::new();
    }
    state.full_worker_name = format!("{}{}", state.subaccount_name, state.miner_name_with_dot);

    if state.subaccount_name.is_empty() {
        return Err(StratumError::WORKER_NAME_START_WRONG);
    }

    // No reply here: the upstream's authorize verdict is forwarded instead.
    Ok(())
}

fn parse_configure(
    state: &mut SessionState,
    request: &Request,
) -> std::result::Result<Option<Value>, StratumError> {
    if request.params.len() < 2 {
        return Err(StratumError::TOO_FEW_PARAMS);
    }
    if let Some(options) = request.params[1].as_object() {
        if let Some(mask) = options.get("version-rolling.mask").and_then(Value::as_str) {
            if let Ok(mask) = u32::from_str_radix(mask, 16) {
                state.version_mask = mask;
            }
        }
    }

    if state.version_mask != 0 {
        // Provisional: the negotiated mask follows as a
        // mining.set_version_mask notification once the upstream answered.
        return Ok(Some(json!({
            "version-rolling": true,
            "version-rolling.mask": version_mask_str(state.version_mask),
        })));
    }

    // Unrecognized configure content gets no reply at all.
    Ok(None)
}

/// mining.configure sent upstream before subscribe when the miner asked for
/// version rolling.
pub fn build_configure_request(version_mask: u32) -> Request {
    Request::new(
        json!("configure"),
        "mining.configure",
        vec![
            json!(["version-rolling"]),
            json!({"version-rolling.mask": version_mask_str(version_mask)}),
        ],
    )
}

/// Rewrites the cached subscribe for a fresh upstream, carrying the session
/// id and the miner's packed IPv4 address.
pub fn build_subscribe_request(
    state: &SessionState,
    ctx: &AdapterContext,
    client_ip: IpAddr,
) -> Result<Request> {
    let cached = state
        .subscribe_request
        .as_ref()
        .ok_or_else(|| SwitcherError::Internal("subscribe request not captured".into()))?;

    let user_agent = cached.param_str(0).unwrap_or(DEFAULT_USER_AGENT).to_string();
    let ip = utils::ip_to_u32(client_ip);

    let mut request = cached.clone();
    request.id = json!("subscribe");
    match state.protocol {
        ProtocolKind::BitcoinStratum => {
            // Always the raw big-endian rendering here: Decred ids are padded
            // and byte-swapped for miners, but upstreams expect the raw form.
            request.params = vec![
                json!(user_agent),
                json!(utils::u32_to_hex_be(ctx.session_id)),
                json!(ip),
            ];
        }
        ProtocolKind::EthereumStratum
        | ProtocolKind::EthereumStratumNiceHash
        | ProtocolKind::EthereumProxy => {
            let protocol = cached.param_str(1).unwrap_or("Stratum").to_string();
            request.params = vec![
                json!(user_agent),
                json!(protocol),
                json!(ctx.session_id_string),
                json!(ip),
            ];
        }
        ProtocolKind::Unknown => {
            return Err(SwitcherError::Internal(
                "subscribe rewrite on unknown protocol".into(),
            ));
        }
    }
    Ok(request)
}

/// mining.authorize toward an upstream. With `with_suffix` the sub-account
/// gets the per-coin user suffix appended (the retry attempt). Returns the
/// request and the worker name placed in it.
pub fn build_authorize_request(
    state: &SessionState,
    with_suffix: bool,
    user_suffix: &str,
) -> Result<(Request, String)> {
    let cached = state
        .authorize_request
        .as_ref()
        .ok_or_else(|| SwitcherError::Internal("authorize request not captured".into()))?;

    let worker_name = if with_suffix {
        format!(
            "{}_{}{}",
            state.subaccount_name, user_suffix, state.miner_name_with_dot
        )
    } else {
        state.full_worker_name.clone()
    };

    // Fresh request so the cached copy's params stay untouched.
    let mut request = Request::new(json!("auth"), &cached.method, cached.params.clone());
    if request.params.is_empty() {
        request.params.push(Value::Null);
    }
    request.params[0] = json!(worker_name);
    Ok((request, worker_name))
}

/// Validates the upstream subscribe reply against this session's identity.
/// A mismatched session id would make every share invalid, so it is fatal.
pub fn validate_subscribe_response(
    state: &SessionState,
    ctx: &AdapterContext,
    response: &Response,
) -> Result<()> {
    match state.protocol {
        ProtocolKind::BitcoinStratum => {
            let result = response
                .result
                .as_array()
                .ok_or(SwitcherError::ParseSubscribeResponse)?;
            let sid = result
                .get(1)
                .and_then(Value::as_str)
                .ok_or(SwitcherError::ParseSubscribeResponse)?;
            if sid != ctx.session_id_string {
                return Err(SwitcherError::SessionIdMismatch {
                    got: sid.to_string(),
                    expected: ctx.session_id_string.clone(),
                });
            }
        }
        ProtocolKind::EthereumStratumNiceHash => {
            let result = response
                .result
                .as_array()
                .ok_or(SwitcherError::ParseSubscribeResponse)?;
            let notify = result
                .first()
                .and_then(Value::as_array)
                .ok_or(SwitcherError::ParseSubscribeResponse)?;
            let sid = notify
                .get(1)
                .and_then(Value::as_str)
                .ok_or(SwitcherError::ParseSubscribeResponse)?;
            let extra_nonce = result
                .get(1)
                .and_then(Value::as_str)
                .ok_or(SwitcherError::ParseSubscribeResponse)?;

            if sid != ctx.session_id_string {
                return Err(SwitcherError::SessionIdMismatch {
                    got: sid.to_string(),
                    expected: ctx.session_id_string.clone(),
                });
            }
            let expected_extra_nonce = nicehash_extra_nonce(state, ctx);
            if extra_nonce != expected_extra_nonce {
                return Err(SwitcherError::SessionIdMismatch {
                    got: extra_nonce.to_string(),
                    expected: expected_extra_nonce,
                });
            }
        }
        ProtocolKind::EthereumStratum | ProtocolKind::EthereumProxy => {
            if response.result.as_bool() != Some(true) {
                return Err(SwitcherError::ParseSubscribeResponse);
            }
        }
        ProtocolKind::Unknown => {
            return Err(SwitcherError::Internal(
                "subscribe response on unknown protocol".into(),
            ));
        }
    }
    Ok(())
}
