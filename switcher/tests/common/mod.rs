//! Shared fixtures: a scriptable mock upstream pool and a switcher instance
//! wired to an in-memory coordinator store.

// Each test binary uses its own subset of these fixtures.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use loka_switcher::config::{Config, StratumServerInfo};
use loka_switcher::coordinator::{Coordinator, MemoryStore};
use loka_switcher::protocol::ChainType;
use loka_switcher::{Listener, Manager};

#[derive(Debug, Clone, Default)]
pub struct MockPoolOptions {
    /// Answer subscribe like an Ethereum sserver (`result: true`) instead of
    /// echoing the session id in the Bitcoin array shape.
    pub ethereum: bool,
    /// Reject the first authorize of every connection.
    pub reject_first_auth: bool,
    /// Version mask announced via mining.set_version_mask after configure.
    pub server_mask: Option<&'static str>,
}

enum PoolCommand {
    Send(String),
    Close,
}

/// A minimal upstream pool good enough to drive the proxy's handshake:
/// answers configure/subscribe/authorize and lets tests push notifications
/// or kill connections.
pub struct MockPool {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    authorized: Arc<Mutex<Vec<String>>>,
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<PoolCommand>>>>,
}

impl MockPool {
    pub async fn start(options: MockPoolOptions) -> MockPool {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let authorized = Arc::new(Mutex::new(Vec::new()));
        let senders: Arc<Mutex<Vec<mpsc::UnboundedSender<PoolCommand>>>> =
            Arc::new(Mutex::new(Vec::new()));

        {
            let connections = connections.clone();
            let authorized = authorized.clone();
            let senders = senders.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (tx, rx) = mpsc::unbounded_channel();
                    senders.lock().unwrap().push(tx);
                    tokio::spawn(pool_connection(
                        stream,
                        rx,
                        authorized.clone(),
                        options.clone(),
                    ));
                }
            });
        }

        MockPool {
            addr,
            connections,
            authorized,
            senders,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Worker names seen in authorize requests, in arrival order.
    pub fn authorized(&self) -> Vec<String> {
        self.authorized.lock().unwrap().clone()
    }

    /// Pushes a raw line into the most recent connection.
    pub fn push_to_last(&self, line: &str) {
        let senders = self.senders.lock().unwrap();
        senders
            .last()
            .expect("no pool connection to push into")
            .send(PoolCommand::Send(line.to_string()))
            .unwrap();
    }

    /// Drops every live pool connection.
    pub fn close_all(&self) {
        for sender in self.senders.lock().unwrap().iter() {
            let _ = sender.send(PoolCommand::Close);
        }
    }
}

async fn pool_connection(
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    authorized: Arc<Mutex<Vec<String>>>,
    options: MockPoolOptions,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut remaining_rejections = usize::from(options.reject_first_auth);

    loop {
        line.clear();
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
                    continue;
                };
                let id = message.get("id").cloned().unwrap_or(Value::Null);
                let method = message.get("method").and_then(Value::as_str).unwrap_or("");
                let params = message
                    .get("params")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let reply = match method {
                    "mining.configure" => {
                        let mask = params
                            .get(1)
                            .and_then(|value| value.get("version-rolling.mask"))
                            .cloned()
                            .unwrap_or(json!("00000000"));
                        let reply = json!({
                            "id": id,
                            "result": {"version-rolling": true, "version-rolling.mask": mask},
                            "error": null
                        });
                        if write_line(&mut write_half, &reply).await.is_err() {
                            break;
                        }
                        if let Some(server_mask) = options.server_mask {
                            let notify = json!({
                                "id": null,
                                "method": "mining.set_version_mask",
                                "params": [server_mask]
                            });
                            if write_line(&mut write_half, &notify).await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                    "mining.subscribe" => {
                        if options.ethereum {
                            json!({"id": id, "result": true, "error": null})
                        } else {
                            let sid = params.get(1).and_then(Value::as_str).unwrap_or("00000000");
                            json!({
                                "id": id,
                                "result": [
                                    [["mining.set_difficulty", sid], ["mining.notify", sid]],
                                    sid,
                                    8
                                ],
                                "error": null
                            })
                        }
                    }
                    "mining.authorize" | "eth_submitLogin" => {
                        let name = params
                            .first()
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        authorized.lock().unwrap().push(name);
                        let ok = if remaining_rejections > 0 {
                            remaining_rejections -= 1;
                            false
                        } else {
                            true
                        };
                        let error = if ok {
                            Value::Null
                        } else {
                            json!([24, "Unauthorized worker", null])
                        };
                        json!({"id": id, "result": ok, "error": error})
                    }
                    _ => continue,
                };
                if write_line(&mut write_half, &reply).await.is_err() {
                    break;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(PoolCommand::Send(text)) => {
                        if write_half.write_all(format!("{text}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(PoolCommand::Close) | None => break,
                }
            }
        }
    }
}

async fn write_line(write_half: &mut OwnedWriteHalf, value: &Value) -> std::io::Result<()> {
    write_half.write_all(format!("{value}\n").as_bytes()).await
}

/// A running switcher bound to an ephemeral port.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub manager: Arc<Manager>,
    pub addr: SocketAddr,
}

pub async fn start_switcher(
    chain: ChainType,
    coins: &[(&str, SocketAddr)],
    store: Arc<MemoryStore>,
) -> Harness {
    start_switcher_with(chain, coins, store, |_| {}).await
}

pub async fn start_switcher_with(
    chain: ChainType,
    coins: &[(&str, SocketAddr)],
    store: Arc<MemoryStore>,
    configure: impl FnOnce(&mut Config),
) -> Harness {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1:0".parse().unwrap();
    config.server.chain = chain;
    config.coordinator.switcher_watch_dir = "/switcher/".to_string();
    config.coordinator.auto_register_watch_dir = "/autoreg/".to_string();
    for (coin, addr) in coins {
        config.coins.insert(
            coin.to_string(),
            StratumServerInfo {
                url: addr.to_string(),
                user_suffix: coin.to_string(),
            },
        );
    }
    configure(&mut config);
    config.validate().unwrap();

    let coordinator = Arc::new(Coordinator::new(store.clone()));
    let manager = Arc::new(Manager::new(Arc::new(config), coordinator));
    let listener = Listener::new(manager.clone()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    Harness {
        store,
        manager,
        addr,
    }
}

/// A miner's view of the proxy.
pub struct MinerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MinerClient {
    pub async fn connect(addr: SocketAddr) -> MinerClient {
        let stream = TcpStream::connect(addr).await.unwrap();
        MinerClient::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> MinerClient {
        let (read_half, write_half) = stream.into_split();
        MinerClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, message: &Value) {
        let mut text = message.to_string();
        text.push('\n');
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a proxy message")
            .unwrap();
        assert!(n > 0, "proxy closed the connection unexpectedly");
        serde_json::from_str(line.trim()).expect("proxy sent invalid json")
    }

    /// Asserts the proxy closes the connection.
    pub async fn expect_eof(&mut self) {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(20), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the proxy to close")
            .unwrap();
        assert_eq!(n, 0, "expected eof, got: {line}");
    }
}

/// Polls `condition` for up to 30 seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}
