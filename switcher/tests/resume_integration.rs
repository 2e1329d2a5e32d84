//! Controlled handover: rebuilding a session from a snapshot plus an
//! already-established upstream socket.

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::net::{TcpListener, TcpStream};

use common::{start_switcher, wait_for, MinerClient, MockPool, MockPoolOptions};
use loka_switcher::coordinator::MemoryStore;
use loka_switcher::protocol::types::Request;
use loka_switcher::protocol::ChainType;
use loka_switcher::session::{Session, SessionData};

fn snapshot(coin: &str) -> SessionData {
    SessionData {
        version_mask: 0,
        subscribe_request: Some(Request::new(
            json!(1),
            "mining.subscribe",
            vec![json!("cgminer/4.11")],
        )),
        authorize_request: Some(Request::new(
            json!(2),
            "mining.authorize",
            vec![json!("alice.rig1"), json!("x")],
        )),
        mining_coin: coin.to_string(),
    }
}

/// A connected (client, proxy-side) socket pair standing in for the miner
/// connection inherited by the new process.
async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server_side, _) = listener.accept().await.unwrap();
    (client, server_side)
}

#[tokio::test]
async fn resume_reenters_the_proxy_phase() {
    let pool = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(ChainType::Bitcoin, &[("btc", pool.addr)], store).await;

    let (client_stream, proxy_stream) = socket_pair().await;
    let mut miner = MinerClient::from_stream(client_stream);
    let upstream = TcpStream::connect(pool.addr).await.unwrap();

    let id = harness.manager.ids().allocate().unwrap();
    let peer = proxy_stream.peer_addr().unwrap();
    let session = Session::new(harness.manager.clone(), proxy_stream, id, peer);
    session.resume(snapshot("btc"), upstream).await;

    let manager = harness.manager.clone();
    wait_for("session registration", move || {
        manager.sessions_of("alice").len() == 1
    })
    .await;

    // No handshake is replayed on resume; the upstream was already live.
    assert!(pool.authorized().is_empty());

    wait_for("pool connection accepted", || pool.connections() == 1).await;

    // Traffic flows both ways through the resumed session.
    pool.push_to_last(r#"{"id":null,"method":"mining.notify","params":["resumed-job"]}"#);
    let notify = miner.recv().await;
    assert_eq!(notify["params"][0], "resumed-job");
}

#[tokio::test]
async fn resume_fails_when_the_assigned_coin_changed() {
    let pool = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    // The coordinator now assigns bch, but the snapshot was taken on btc.
    store.set("/switcher/alice", "bch");
    let harness = start_switcher(ChainType::Bitcoin, &[("btc", pool.addr)], store).await;

    let (client_stream, proxy_stream) = socket_pair().await;
    let mut miner = MinerClient::from_stream(client_stream);
    let upstream = TcpStream::connect(pool.addr).await.unwrap();

    let id = harness.manager.ids().allocate().unwrap();
    let peer = proxy_stream.peer_addr().unwrap();
    let session = Session::new(harness.manager.clone(), proxy_stream, id, peer);
    session.resume(snapshot("btc"), upstream).await;

    miner.expect_eof().await;
    assert!(harness.manager.sessions_of("alice").is_empty());
}
