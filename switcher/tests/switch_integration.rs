//! Migration scenarios: coin hot-switch, upstream crash recovery, and the
//! BTCAgent variant that must drop instead of switching.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{start_switcher, wait_for, Harness, MinerClient, MockPool, MockPoolOptions};
use loka_switcher::coordinator::MemoryStore;
use loka_switcher::protocol::ChainType;

async fn handshake(miner: &mut MinerClient, user_agent: &str, worker: &str) -> Value {
    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":[user_agent]}))
        .await;
    miner.recv().await;
    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":[worker,"x"]}))
        .await;
    miner.recv().await
}

async fn settled(harness: &Harness, subaccount: &str) {
    let manager = harness.manager.clone();
    let subaccount = subaccount.to_string();
    wait_for("session registration", move || {
        manager.sessions_of(&subaccount).len() == 1
    })
    .await;
}

#[tokio::test]
async fn coin_switch_migrates_live_session() {
    let pool_btc = MockPool::start(MockPoolOptions::default()).await;
    let pool_bch = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(
        ChainType::Bitcoin,
        &[("btc", pool_btc.addr), ("bch", pool_bch.addr)],
        store,
    )
    .await;

    let mut miner = MinerClient::connect(harness.addr).await;
    let authorized = handshake(&mut miner, "cgminer/4.11", "alice.rig1").await;
    assert_eq!(authorized["result"], true);
    assert_eq!(pool_btc.connections(), 1);
    settled(&harness, "alice").await;

    // Reassign the coin; the watch fires and the session migrates.
    harness.store.set("/switcher/alice", "bch");

    wait_for("bch upstream handshake", || {
        pool_bch.authorized() == vec!["alice.rig1".to_string()]
    })
    .await;
    settled(&harness, "alice").await;

    // The miner's connection stayed up and now proxies the bch upstream.
    pool_bch.push_to_last(r#"{"id":null,"method":"mining.notify","params":["bch-job"]}"#);
    let notify = miner.recv().await;
    assert_eq!(notify["method"], "mining.notify");
    assert_eq!(notify["params"][0], "bch-job");
}

#[tokio::test]
async fn upstream_crash_triggers_transparent_reconnect() {
    let pool = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(ChainType::Bitcoin, &[("btc", pool.addr)], store).await;

    let mut miner = MinerClient::connect(harness.addr).await;
    let authorized = handshake(&mut miner, "cgminer/4.11", "alice.rig1").await;
    assert_eq!(authorized["result"], true);
    settled(&harness, "alice").await;

    // Kill the upstream; the proxy must redial and replay the handshake.
    pool.close_all();

    wait_for("upstream redial", || pool.connections() == 2).await;
    wait_for("handshake replay", || {
        pool.authorized() == vec!["alice.rig1".to_string(), "alice.rig1".to_string()]
    })
    .await;
    settled(&harness, "alice").await;

    // The miner never noticed; traffic flows over the new upstream.
    pool.push_to_last(r#"{"id":null,"method":"mining.notify","params":["after-crash"]}"#);
    let notify = miner.recv().await;
    assert_eq!(notify["params"][0], "after-crash");
}

#[tokio::test]
async fn btc_agent_session_stops_on_coin_change() {
    let pool_btc = MockPool::start(MockPoolOptions::default()).await;
    let pool_bch = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(
        ChainType::Bitcoin,
        &[("btc", pool_btc.addr), ("bch", pool_bch.addr)],
        store,
    )
    .await;

    let mut miner = MinerClient::connect(harness.addr).await;
    let authorized = handshake(&mut miner, "btccom-agent/1.1", "alice.rig1").await;
    assert_eq!(authorized["result"], true);
    settled(&harness, "alice").await;

    // Agents cannot be hot-switched: the session must stop instead, and the
    // agent reconnects on its own.
    harness.store.set("/switcher/alice", "bch");

    miner.expect_eof().await;
    let manager = harness.manager.clone();
    wait_for("registry cleanup", move || {
        manager.sessions_of("alice").is_empty()
    })
    .await;
    assert_eq!(pool_bch.connections(), 0);
}

#[tokio::test]
async fn client_disconnect_releases_the_session() {
    let pool = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(ChainType::Bitcoin, &[("btc", pool.addr)], store).await;

    let miner = {
        let mut miner = MinerClient::connect(harness.addr).await;
        let authorized = handshake(&mut miner, "cgminer/4.11", "alice.rig1").await;
        assert_eq!(authorized["result"], true);
        settled(&harness, "alice").await;
        miner
    };

    drop(miner);

    let manager = harness.manager.clone();
    wait_for("registry cleanup", move || {
        manager.sessions_of("alice").is_empty()
    })
    .await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let pool = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(ChainType::Bitcoin, &[("btc", pool.addr)], store).await;

    let mut miner = MinerClient::connect(harness.addr).await;
    let authorized = handshake(&mut miner, "cgminer/4.11", "alice.rig1").await;
    assert_eq!(authorized["result"], true);
    settled(&harness, "alice").await;

    let session = harness.manager.sessions_of("alice")[0].clone();
    session.stop().await;
    session.stop().await;
    session.stop().await;

    assert!(harness.manager.sessions_of("alice").is_empty());
    miner.expect_eof().await;
}

#[tokio::test]
async fn reassignment_to_unconfigured_coin_is_ignored() {
    let pool = MockPool::start(MockPoolOptions::default()).await;
    let store = Arc::new(MemoryStore::new());
    store.set("/switcher/alice", "btc");
    let harness = start_switcher(ChainType::Bitcoin, &[("btc", pool.addr)], store).await;

    let mut miner = MinerClient::connect(harness.addr).await;
    let authorized = handshake(&mut miner, "cgminer/4.11", "alice.rig1").await;
    assert_eq!(authorized["result"], true);
    settled(&harness, "alice").await;

    // No server for "doge": the watcher logs and keeps watching.
    harness.store.set("/switcher/alice", "doge");
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(pool.connections(), 1);
    settled(&harness, "alice").await;

    // A later valid assignment still works.
    harness.store.set("/switcher/alice", "btc");
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    pool.push_to_last(r#"{"id":null,"method":"mining.notify","params":["still-btc"]}"#);
    let notify = miner.recv().await;
    assert_eq!(notify["params"][0], "still-btc");
}
