//! The per-connection session: protocol detection, handshake capture, coin
//! resolution, upstream handshake replay, and the migration state machine.

mod id;
mod proxy;
mod state;

pub use id::{SessionId, SessionIdPool};
pub use state::{SessionData, SessionState};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::coordinator::WatchReceiver;
use crate::error::{Result, StratumError, SwitcherError};
use crate::manager::Manager;
use crate::protocol::adapter::{self, AdapterContext, AuthorizeStat};
use crate::protocol::types::{Request, Response};
use crate::protocol::{self, ProtocolKind};

/// Running state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunningStat {
    Stopped = 0,
    Running = 1,
    Reconnecting = 2,
}

impl RunningStat {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunningStat::Running,
            2 => RunningStat::Reconnecting,
            _ => RunningStat::Stopped,
        }
    }
}

/// One side of the proxied byte stream: buffered while the handshake still
/// parses lines, raw once the copy phase begins. Buffered read-ahead must be
/// flushed to the peer before the source degrades to raw.
pub(crate) enum ReadSource {
    Buffered(BufReader<OwnedReadHalf>),
    Raw(OwnedReadHalf),
}

/// Writes one complete frame, bounded so an unresponsive peer cannot pin a
/// writer lock forever. A timed-out write is unrecoverable for the stream
/// and is reported as an error.
pub(crate) async fn write_frame(
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
) -> std::io::Result<()> {
    match timeout(protocol::IO_CYCLE_TIMEOUT, writer.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "peer write stalled",
        )),
    }
}

/// A Stratum session: one miner connection, at most one upstream connection,
/// and the state needed to replay the handshake against a different upstream
/// when the miner's coin assignment changes.
pub struct Session {
    manager: Arc<Manager>,
    id: SessionId,
    /// Chain rendering of the id; stable for the session's whole life.
    id_string: String,
    client_addr: SocketAddr,

    /// Serializes stop/reconnect/switch. Deliberately held across a whole
    /// migration so concurrent transitions and replays block until it
    /// settles.
    transition: Mutex<()>,
    stat: AtomicU8,
    /// Fencing token: tasks started under counter `k` must observe `k`
    /// unchanged before acting on the session.
    reconnect_counter: AtomicU32,
    watcher_spawned: AtomicBool,

    state: StdMutex<SessionState>,
    watch_rx: StdMutex<Option<WatchReceiver>>,

    client_rd: Mutex<Option<ReadSource>>,
    client_wr: Mutex<Option<OwnedWriteHalf>>,
    server_rd: Mutex<Option<ReadSource>>,
    server_wr: Mutex<Option<OwnedWriteHalf>>,
}

impl Session {
    pub fn new(
        manager: Arc<Manager>,
        client: TcpStream,
        id: SessionId,
        client_addr: SocketAddr,
    ) -> Arc<Self> {
        let (read_half, write_half) = client.into_split();
        let chain = manager.config().server.chain;
        let id_string = chain.session_id_string(id.value());
        debug!(session = %id, ip = %client_addr, extranonce = %id_string, "session created");

        Arc::new(Self {
            manager,
            id,
            id_string,
            client_addr,
            transition: Mutex::new(()),
            stat: AtomicU8::new(RunningStat::Stopped as u8),
            reconnect_counter: AtomicU32::new(0),
            watcher_spawned: AtomicBool::new(false),
            state: StdMutex::new(SessionState::default()),
            watch_rx: StdMutex::new(None),
            client_rd: Mutex::new(Some(ReadSource::Buffered(BufReader::with_capacity(
                protocol::IO_BUFFER_SIZE,
                read_half,
            )))),
            client_wr: Mutex::new(Some(write_half)),
            server_rd: Mutex::new(None),
            server_wr: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session_id_string(&self) -> &str {
        &self.id_string
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn running_stat(&self) -> RunningStat {
        RunningStat::from_u8(self.stat.load(Ordering::Acquire))
    }

    fn set_running_stat(&self, stat: RunningStat) {
        self.stat.store(stat as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running_stat() != RunningStat::Stopped
    }

    pub fn counter(&self) -> u32 {
        self.reconnect_counter.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subaccount_name(&self) -> String {
        self.state().subaccount_name.clone()
    }

    pub fn full_worker_name(&self) -> String {
        self.state().full_worker_name.clone()
    }

    pub fn mining_coin(&self) -> String {
        self.state().mining_coin.clone()
    }

    pub fn is_btc_agent(&self) -> bool {
        self.state().is_btc_agent
    }

    /// Snapshot for a controlled handover to another process or session.
    pub fn snapshot(&self) -> SessionData {
        let state = self.state();
        SessionData {
            version_mask: state.version_mask,
            subscribe_request: state.subscribe_request.clone(),
            authorize_request: state.authorize_request.clone(),
            mining_coin: state.mining_coin.clone(),
        }
    }

    fn server_id(&self) -> u8 {
        self.manager.config().server.id
    }

    fn adapter_context(&self) -> AdapterContext {
        let config = self.manager.config();
        AdapterContext {
            chain: config.server.chain,
            session_id: self.id.value(),
            session_id_string: self.id_string.clone(),
            case_insensitive: config.coordinator.stratum_server_case_insensitive,
        }
    }

    /// Drives a fresh connection through detection, handshake, coin lookup
    /// and into the proxy phase. Idempotent on a non-stopped session.
    pub async fn run(self: Arc<Self>) {
        {
            let _guard = self.transition.lock().await;
            if self.running_stat() != RunningStat::Stopped {
                return;
            }
            self.set_running_stat(RunningStat::Running);
        }

        let protocol = self.protocol_detect().await;
        if protocol == ProtocolKind::Unknown {
            self.stop().await;
            return;
        }
        self.state().protocol = protocol;

        if let Err(e) = self.run_proxy_stratum().await {
            debug!(session = %self.id, error = %e, "session setup failed");
            self.stop().await;
        }
    }

    /// Rebuilds an authorized session from a snapshot plus an established
    /// upstream socket, then enters the proxy phase directly.
    pub async fn resume(self: Arc<Self>, data: SessionData, server: TcpStream) {
        {
            let _guard = self.transition.lock().await;
            if self.running_stat() != RunningStat::Stopped {
                return;
            }
            self.set_running_stat(RunningStat::Running);
        }

        let chain = self.manager.config().server.chain;
        {
            let mut state = self.state();
            state.protocol = chain.default_protocol();
            state.version_mask = data.version_mask;
        }

        let (read_half, write_half) = server.into_split();
        *self.server_rd.lock().await = Some(ReadSource::Buffered(BufReader::with_capacity(
            protocol::IO_BUFFER_SIZE,
            read_half,
        )));
        *self.server_wr.lock().await = Some(write_half);

        let ctx = self.adapter_context();
        let mut stat = AuthorizeStat::Connected;
        for request in [&data.subscribe_request, &data.authorize_request]
            .into_iter()
            .flatten()
        {
            let handled = {
                let mut state = self.state();
                adapter::handle_request(&mut state, &ctx, request, &mut stat)
            };
            if let Err(e) = handled {
                warn!(session = %self.id, error = %e, "session resume failed");
                self.stop().await;
                return;
            }
        }
        if stat != AuthorizeStat::Authorized {
            warn!(session = %self.id, ?stat, "session resume failed: handshake incomplete");
            self.stop().await;
            return;
        }

        if let Err(e) = self.find_mining_coin(false).await {
            warn!(session = %self.id, error = %e, "session resume failed: no coin assignment");
            self.stop().await;
            return;
        }
        let coin = self.mining_coin();
        if coin != data.mining_coin {
            warn!(
                session = %self.id,
                expected = %data.mining_coin,
                resolved = %coin,
                "session resume failed: mining coin changed"
            );
            self.stop().await;
            return;
        }

        info!(session = %self.id, worker = %self.full_worker_name(), coin = %coin, "session resumed");
        self.spawn_proxy();
    }

    /// Stops the session: idempotent, closes both sockets and releases it
    /// from the manager (which cancels watches and frees the id).
    pub async fn stop(self: &Arc<Self>) {
        {
            let _guard = self.transition.lock().await;
            if self.running_stat() == RunningStat::Stopped {
                return;
            }
            self.set_running_stat(RunningStat::Stopped);
        }

        // Dropping the write halves closes our sending direction at once;
        // readers notice within one bounded cycle and drop the rest.
        self.server_wr.lock().await.take();
        self.client_wr.lock().await.take();

        self.manager.release(self).await;

        self.server_rd.lock().await.take();
        self.client_rd.lock().await.take();

        info!(
            session = %self.id,
            ip = %self.client_addr,
            worker = %self.full_worker_name(),
            coin = %self.mining_coin(),
            "session stopped"
        );
    }

    async fn run_proxy_stratum(self: &Arc<Self>) -> Result<()> {
        self.find_worker_name().await?;
        let auto_register = self.manager.config().coordinator.auto_register;
        self.find_mining_coin(auto_register).await?;
        self.connect_stratum_server().await?;
        self.spawn_proxy();
        Ok(())
    }

    /// Peeks the first client byte. Everything this proxy understands opens
    /// with a JSON object, agents included; an agent only turns to its
    /// binary framing after authorize, which plain proxying passes through.
    async fn protocol_detect(&self) -> ProtocolKind {
        let mut guard = self.client_rd.lock().await;
        let Some(ReadSource::Buffered(reader)) = guard.as_mut() else {
            return ProtocolKind::Unknown;
        };
        let first = match timeout(protocol::PROTOCOL_DETECT_TIMEOUT, reader.fill_buf()).await {
            Ok(Ok(buffer)) => buffer.first().copied(),
            Ok(Err(e)) => {
                warn!(session = %self.id, error = %e, "client read failed during detection");
                return ProtocolKind::Unknown;
            }
            Err(_) => {
                warn!(session = %self.id, "protocol detection timed out");
                return ProtocolKind::Unknown;
            }
        };
        match first {
            Some(b'{') => self.manager.config().server.chain.default_protocol(),
            _ => {
                warn!(session = %self.id, "unknown protocol from client");
                ProtocolKind::Unknown
            }
        }
    }

    /// Reads client handshake lines until the authorize request has been
    /// captured, answering subscribe and configure along the way.
    async fn find_worker_name(&self) -> Result<()> {
        match timeout(protocol::FIND_WORKER_NAME_TIMEOUT, self.find_worker_name_loop()).await {
            Ok(result) => {
                if result.is_ok() {
                    debug!(session = %self.id, worker = %self.full_worker_name(), "worker name found");
                }
                result
            }
            Err(_) => {
                warn!(session = %self.id, "no authorize within the handshake window");
                Err(SwitcherError::Timeout {
                    phase: "find worker name",
                })
            }
        }
    }

    async fn find_worker_name_loop(&self) -> Result<()> {
        let ctx = self.adapter_context();
        let mut stat = AuthorizeStat::Connected;
        let mut line = Vec::new();

        let mut guard = self.client_rd.lock().await;
        let Some(ReadSource::Buffered(reader)) = guard.as_mut() else {
            return Err(SwitcherError::ConnectionClosed);
        };

        while stat != AuthorizeStat::Authorized {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(SwitcherError::ConnectionClosed);
            }

            // Lenient by design: malformed handshake lines are dropped.
            let request = match Request::from_line(&line) {
                Ok(request) => request,
                Err(e) => {
                    trace!(session = %self.id, error = %e, "dropping malformed handshake line");
                    continue;
                }
            };

            let handled = {
                let mut state = self.state();
                adapter::handle_request(&mut state, &ctx, &request, &mut stat)
            };
            let rpc_version = self.state().rpc_version;
            match handled {
                Ok(None) => {}
                Ok(Some(result)) => {
                    let response = Response::new(request.id.clone(), result, Value::Null);
                    self.write_to_client(&response.to_line(rpc_version)?).await?;
                }
                Err(stratum_err) => {
                    let response = Response::new(
                        request.id.clone(),
                        Value::Null,
                        stratum_err.to_rpc_array(self.server_id()),
                    );
                    self.write_to_client(&response.to_line(rpc_version)?).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolves the sub-account's assigned coin from the coordinator and
    /// arms the switch watch. On a missing node, either auto-registration
    /// takes over or the miner is told the sub-account is invalid.
    async fn find_mining_coin(&self, auto_register: bool) -> Result<()> {
        let (subaccount, authorize_id, rpc_version) = {
            let state = self.state();
            (
                state.subaccount_name.clone(),
                state
                    .authorize_request
                    .as_ref()
                    .map(|r| r.id.clone())
                    .unwrap_or(Value::Null),
                state.rpc_version,
            )
        };
        let path = format!(
            "{}{}",
            self.manager.config().coordinator.switcher_watch_dir,
            subaccount
        );

        match self.manager.coordinator().get_and_watch(&path, self.id).await {
            Ok((coin, watch)) => {
                {
                    let mut state = self.state();
                    state.mining_coin = coin;
                    state.watch_path = path;
                }
                *self
                    .watch_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(watch);
                Ok(())
            }
            Err(_) if auto_register => self.try_auto_register().await,
            Err(e) => {
                debug!(session = %self.id, path = %path, error = %e, "no coin assignment");
                let response = Response::new(
                    authorize_id,
                    Value::Null,
                    StratumError::INVALID_SUB_ACCOUNT_NAME.to_rpc_array(self.server_id()),
                );
                let _ = self.write_to_client(&response.to_line(rpc_version)?).await;
                Err(e.into())
            }
        }
    }

    /// Parks the session on an auto-registration slot until an external
    /// registrar provisions the sub-account, then resolves the coin again
    /// with auto-registration disabled.
    async fn try_auto_register(&self) -> Result<()> {
        let (subaccount, worker) = {
            let state = self.state();
            (state.subaccount_name.clone(), state.full_worker_name.clone())
        };
        info!(session = %self.id, worker = %worker, "trying sub-account auto-registration");
        metrics::counter!("switcher_auto_register_total").increment(1);

        let path = format!(
            "{}{}",
            self.manager.config().coordinator.auto_register_watch_dir,
            subaccount
        );
        let coordinator = self.manager.coordinator();

        let mut _permit = None;
        let watch = match coordinator.get_and_watch(&path, self.id).await {
            // A request for this sub-account is already pending; wait on it.
            Ok((_pending, watch)) => watch,
            Err(_) => {
                let Some(permit) = self.manager.try_acquire_auto_reg() else {
                    warn!(session = %self.id, worker = %worker, "too many pending auto-registrations");
                    return Err(SwitcherError::TooManyPendingAutoReg);
                };
                _permit = Some(permit);

                let descriptor =
                    json!({ "SessionID": self.id.value(), "Worker": worker }).to_string();
                if let Err(e) = coordinator.create(&path, &descriptor).await {
                    debug!(session = %self.id, path = %path, error = %e, "auto-register node create");
                }
                match coordinator.get_and_watch(&path, self.id).await {
                    Ok((_, watch)) => watch,
                    Err(e) => {
                        warn!(session = %self.id, worker = %worker, error = %e, "sub-account auto-registration failed");
                        return Err(e.into());
                    }
                }
            }
        };

        // The registrar consumes the node once the account exists.
        let _ = watch.await;

        Box::pin(self.find_mining_coin(false)).await
    }

    /// Looks up the current coin's upstream, dials it and replays the
    /// handshake. Failures are only reported to the client on the initial
    /// connect; reconnect attempts stay silent.
    pub(crate) async fn connect_stratum_server(&self) -> Result<()> {
        let reconnecting = self.running_stat() == RunningStat::Reconnecting;
        let (coin, authorize_id, rpc_version) = {
            let state = self.state();
            (
                state.mining_coin.clone(),
                state
                    .authorize_request
                    .as_ref()
                    .map(|r| r.id.clone())
                    .unwrap_or(Value::Null),
                state.rpc_version,
            )
        };

        let Some(server) = self.manager.server_info(&coin) else {
            warn!(session = %self.id, coin = %coin, "no stratum server for coin");
            if !reconnecting {
                let response = Response::new(
                    authorize_id,
                    Value::Null,
                    StratumError::STRATUM_SERVER_NOT_FOUND.to_rpc_array(self.server_id()),
                );
                let _ = self.write_to_client(&response.to_line(rpc_version)?).await;
            }
            return Err(StratumError::STRATUM_SERVER_NOT_FOUND.into());
        };

        let stream = match TcpStream::connect(&server.url).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = %self.id, coin = %coin, url = %server.url, error = %e, "upstream dial failed");
                if !reconnecting {
                    let response = Response::new(
                        authorize_id,
                        Value::Null,
                        StratumError::CONNECT_STRATUM_SERVER_FAILED.to_rpc_array(self.server_id()),
                    );
                    let _ = self.write_to_client(&response.to_line(rpc_version)?).await;
                }
                return Err(StratumError::CONNECT_STRATUM_SERVER_FAILED.into());
            }
        };

        debug!(session = %self.id, coin = %coin, url = %server.url, "upstream connected");
        let (read_half, write_half) = stream.into_split();
        *self.server_rd.lock().await = Some(ReadSource::Buffered(BufReader::with_capacity(
            protocol::IO_BUFFER_SIZE,
            read_half,
        )));
        *self.server_wr.lock().await = Some(write_half);

        let user_suffix = if server.user_suffix.is_empty() {
            coin
        } else {
            server.user_suffix.clone()
        };
        self.subscribe_and_authorize(&user_suffix).await
    }

    /// Replays the cached handshake against a fresh upstream: configure (if
    /// the miner rolls versions), subscribe, authorize with a suffixed
    /// retry, and forwards the authorize verdict to the client.
    async fn subscribe_and_authorize(&self, user_suffix: &str) -> Result<()> {
        let ctx = self.adapter_context();
        let (version_mask, client_authorize_id, rpc_version) = {
            let state = self.state();
            (
                state.version_mask,
                state
                    .authorize_request
                    .as_ref()
                    .map(|r| r.id.clone())
                    .unwrap_or(Value::Null),
                state.rpc_version,
            )
        };

        if version_mask != 0 {
            let configure = adapter::build_configure_request(version_mask);
            self.write_to_server(&configure.to_line()?).await?;
        }
        let subscribe = {
            let state = self.state();
            adapter::build_subscribe_request(&state, &ctx, self.client_addr.ip())?
        };
        self.write_to_server(&subscribe.to_line()?).await?;
        let (authorize, worker_name) = {
            let state = self.state();
            adapter::build_authorize_request(&state, false, user_suffix)?
        };
        self.write_to_server(&authorize.to_line()?).await?;

        let phase = async {
            let mut allowed_mask: u32 = 0;
            let mut auth_count = 0u8;
            let mut auth_success = false;
            let mut auth_response: Option<Response> = None;
            let mut line = Vec::new();

            let mut guard = self.server_rd.lock().await;
            let Some(ReadSource::Buffered(reader)) = guard.as_mut() else {
                return Err(SwitcherError::ConnectionClosed);
            };

            while auth_count < 2 {
                line.clear();
                let n = reader.read_until(b'\n', &mut line).await?;
                if n == 0 {
                    return Err(SwitcherError::ConnectionClosed);
                }

                if let Ok(response) = Response::from_line(&line) {
                    // A null id means this is a notification, not a reply.
                    if !response.id.is_null() {
                        match response.id.as_str() {
                            Some("configure") => {}
                            Some("subscribe") => {
                                let state = self.state();
                                adapter::validate_subscribe_response(&state, &ctx, &response)?;
                            }
                            Some("auth") => {
                                auth_count += 1;
                                let success = response.result.as_bool().unwrap_or(false);
                                // TODO: when the suffixed retry also fails the
                                // client sees this first failure body; decide
                                // whether the retry's reply is more useful.
                                if success || auth_response.is_none() {
                                    auth_response = Some(response.clone());
                                }
                                if success {
                                    auth_success = true;
                                    auth_count = 2;
                                } else if auth_count == 1 {
                                    let (retry, retry_name) = {
                                        let state = self.state();
                                        adapter::build_authorize_request(&state, true, user_suffix)?
                                    };
                                    debug!(session = %self.id, worker = %retry_name, "retrying authorize with user suffix");
                                    self.write_to_server(&retry.to_line()?).await?;
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }
                }

                if let Ok(notify) = Request::from_line(&line) {
                    if notify.method == "mining.set_version_mask" {
                        if let Some(mask) = notify
                            .param_str(0)
                            .and_then(|s| u32::from_str_radix(s, 16).ok())
                        {
                            allowed_mask = mask;
                        }
                    }
                    continue;
                }
                trace!(session = %self.id, "dropping malformed upstream line");
            }

            // Forward the upstream's verdict under the client's request id.
            if let Some(mut response) = auth_response {
                response.id = client_authorize_id.clone();
                self.write_to_client(&response.to_line(rpc_version)?).await?;
            }

            if auth_success && version_mask != 0 {
                let mask = allowed_mask & version_mask;
                let notify = Request::notification(
                    "mining.set_version_mask",
                    vec![json!(adapter::version_mask_str(mask))],
                );
                self.write_to_client(&notify.to_line()?).await?;
            }

            if auth_success {
                Ok(())
            } else {
                Err(SwitcherError::AuthorizeFailed)
            }
        };

        match timeout(protocol::UPSTREAM_RESPONSE_TIMEOUT, phase).await {
            Ok(Ok(())) => {
                info!(
                    session = %self.id,
                    ip = %self.client_addr,
                    coin = %self.mining_coin(),
                    worker = %worker_name,
                    "authorized with upstream"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(session = %self.id, worker = %worker_name, error = %e, "upstream authorize failed");
                Err(e)
            }
            Err(_) => {
                warn!(session = %self.id, worker = %worker_name, "upstream authorize timed out");
                Err(SwitcherError::Timeout {
                    phase: "upstream authorize",
                })
            }
        }
    }

    /// Stops the session unless a newer incarnation owns it.
    pub(crate) async fn try_stop(self: &Arc<Self>, counter: u32) -> bool {
        let _guard = self.transition.lock().await;
        if self.running_stat() != RunningStat::Running {
            return false;
        }
        if self.counter() != counter {
            return false;
        }
        let session = self.clone();
        tokio::spawn(async move { session.stop().await });
        true
    }

    /// Starts a migration to a fresh upstream for the current coin, unless
    /// a newer incarnation owns the session.
    pub(crate) async fn try_reconnect(self: &Arc<Self>, counter: u32) -> bool {
        let _guard = self.transition.lock().await;
        if self.running_stat() != RunningStat::Running {
            return false;
        }
        if self.counter() != counter {
            return false;
        }
        self.set_running_stat(RunningStat::Reconnecting);
        self.reconnect_counter.fetch_add(1, Ordering::AcqRel);
        info!(session = %self.id, coin = %self.mining_coin(), "reconnecting upstream");
        metrics::counter!("switcher_upstream_reconnect_total").increment(1);

        self.reconnect_stratum_server().await;
        true
    }

    /// Migrates the live session onto `new_coin`'s upstream. The freshly
    /// assigned coin is authoritative; it is not re-read from the
    /// coordinator.
    pub(crate) async fn switch_coin(self: &Arc<Self>, new_coin: &str, counter: u32) -> bool {
        let _guard = self.transition.lock().await;
        if self.running_stat() != RunningStat::Running {
            warn!(session = %self.id, "coin switch dropped: session not running");
            return false;
        }
        if self.counter() != counter {
            warn!(session = %self.id, "coin switch dropped: superseded by another transition");
            return false;
        }
        self.set_running_stat(RunningStat::Reconnecting);
        self.reconnect_counter.fetch_add(1, Ordering::AcqRel);
        self.state().mining_coin = new_coin.to_string();
        metrics::counter!("switcher_coin_switch_total").increment(1);

        self.reconnect_stratum_server().await;
        true
    }

    /// Tears the old upstream down and re-runs the full handshake against a
    /// fresh one, redialing with spaced attempts. Runs with the transition
    /// lock held; total failure stops the session.
    async fn reconnect_stratum_server(self: &Arc<Self>) {
        self.manager.unregister(self);

        // Flush upstream read-ahead to the client before abandoning the old
        // socket, then close it.
        if let Some(ReadSource::Buffered(reader)) = self.server_rd.lock().await.take() {
            let residue = reader.buffer().to_vec();
            if !residue.is_empty() {
                let _ = self.write_to_client_raw(&residue).await;
            }
        }
        self.server_wr.lock().await.take();

        let mut attempts = 0;
        let result = loop {
            match self.connect_stratum_server().await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts > protocol::UPSTREAM_RETRY_ATTEMPTS {
                        break Err(e);
                    }
                    tokio::time::sleep(protocol::UPSTREAM_RETRY_DELAY).await;
                }
            }
        };

        match result {
            Ok(()) => {
                self.set_running_stat(RunningStat::Running);
                self.spawn_proxy();
                info!(
                    session = %self.id,
                    worker = %self.full_worker_name(),
                    coin = %self.mining_coin(),
                    "upstream reconnected"
                );
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "upstream reconnect failed, stopping session");
                let session = self.clone();
                tokio::spawn(async move { session.stop().await });
            }
        }
    }

    pub(crate) async fn write_to_client(&self, line: &str) -> Result<()> {
        self.write_to_client_raw(line.as_bytes()).await?;
        Ok(())
    }

    async fn write_to_server(&self, line: &str) -> Result<()> {
        self.write_to_server_raw(line.as_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn write_to_client_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.client_wr.lock().await;
        match guard.as_mut() {
            Some(writer) => write_frame(writer, bytes).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "client connection closed",
            )),
        }
    }

    pub(crate) async fn write_to_server_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.server_wr.lock().await;
        match guard.as_mut() {
            Some(writer) => write_frame(writer, bytes).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "upstream connection closed",
            )),
        }
    }

    pub(crate) fn take_watch(&self) -> Option<WatchReceiver> {
        self.watch_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
