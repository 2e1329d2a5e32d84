//! The proxy phase: two byte-copy tasks (one per direction) and the coin
//! watcher. After the handshake the session does not interpret traffic; it
//! moves raw bytes in small chunks so nothing lingers buffered when an
//! upstream is swapped out underneath the miner.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::{ReadSource, RunningStat, Session};
use crate::protocol;

/// Outcome of one bounded read cycle.
enum CycleRead {
    Data(usize),
    Closed,
    Superseded,
    Failed(std::io::Error),
}

/// Why a copy direction ended.
enum CopyEnd {
    ReadFailed,
    WriteFailed,
    Superseded,
}

impl Session {
    /// Registers the session and launches the proxy tasks of the current
    /// incarnation. The watcher is per-session, not per-incarnation.
    pub(crate) fn spawn_proxy(self: &Arc<Self>) {
        if self.running_stat() != RunningStat::Running {
            debug!(session = %self.id, "proxy not started: session no longer running");
            return;
        }
        self.manager.register(self);
        let counter = self.counter();

        let session = self.clone();
        tokio::spawn(async move { session.downstream_loop(counter).await });
        let session = self.clone();
        tokio::spawn(async move { session.upstream_loop(counter).await });
        if !self.watcher_spawned.swap(true, Ordering::AcqRel) {
            let session = self.clone();
            tokio::spawn(async move { session.watcher_loop().await });
        }
    }

    /// One read of up to `buf` bytes, giving up the wait every cycle to
    /// re-check that this incarnation still owns the session.
    async fn cycle_read(
        &self,
        half: &mut OwnedReadHalf,
        buf: &mut [u8],
        counter: u32,
    ) -> CycleRead {
        loop {
            match timeout(protocol::IO_CYCLE_TIMEOUT, half.read(buf)).await {
                Ok(Ok(0)) => return CycleRead::Closed,
                Ok(Ok(n)) => return CycleRead::Data(n),
                Ok(Err(e)) => return CycleRead::Failed(e),
                Err(_) => {
                    if self.running_stat() != RunningStat::Running || self.counter() != counter {
                        return CycleRead::Superseded;
                    }
                }
            }
        }
    }

    /// Upstream -> client. An upstream read failure triggers migration for
    /// plain sessions; agents cannot be migrated and stop instead.
    async fn downstream_loop(self: Arc<Self>, counter: u32) {
        match self.run_downstream(counter).await {
            CopyEnd::ReadFailed if !self.is_btc_agent() => {
                self.try_reconnect(counter).await;
            }
            CopyEnd::Superseded => {}
            _ => {
                self.try_stop(counter).await;
            }
        }
        trace!(session = %self.id, "downstream copy exited");
    }

    async fn run_downstream(&self, counter: u32) -> CopyEnd {
        // Adopt this incarnation's upstream reader, flushing handshake
        // read-ahead to the client before degrading to a raw copy.
        let mut half = {
            let mut guard = self.server_rd.lock().await;
            if self.running_stat() != RunningStat::Running || self.counter() != counter {
                return CopyEnd::Superseded;
            }
            let Some(source) = guard.take() else {
                return CopyEnd::Superseded;
            };
            drop(guard);
            match source {
                ReadSource::Buffered(reader) => {
                    let residue = reader.buffer().to_vec();
                    let half = reader.into_inner();
                    if !residue.is_empty() && self.write_to_client_raw(&residue).await.is_err() {
                        return CopyEnd::WriteFailed;
                    }
                    half
                }
                ReadSource::Raw(half) => half,
            }
        };

        let mut buf = [0u8; protocol::IO_BUFFER_SIZE];
        loop {
            match self.cycle_read(&mut half, &mut buf, counter).await {
                CycleRead::Data(n) => {
                    if self.write_to_client_raw(&buf[..n]).await.is_err() {
                        return CopyEnd::WriteFailed;
                    }
                }
                CycleRead::Closed => {
                    debug!(session = %self.id, "upstream closed the connection");
                    return CopyEnd::ReadFailed;
                }
                CycleRead::Failed(e) => {
                    debug!(session = %self.id, error = %e, "upstream read failed");
                    return CopyEnd::ReadFailed;
                }
                CycleRead::Superseded => return CopyEnd::Superseded,
            }
        }
    }

    /// Client -> upstream. An upstream write failure triggers migration; a
    /// chunk the dead upstream never took is replayed into its successor.
    async fn upstream_loop(self: Arc<Self>, counter: u32) {
        let mut pending: Vec<u8> = Vec::new();
        match self.run_upstream(counter, &mut pending).await {
            CopyEnd::WriteFailed if !self.is_btc_agent() => {
                self.try_reconnect(counter).await;
                if !pending.is_empty() {
                    // Blocks until any in-flight migration settles.
                    let _guard = self.transition.lock().await;
                    if self.running_stat() == RunningStat::Running {
                        if let Err(e) = self.write_to_server_raw(&pending).await {
                            debug!(session = %self.id, error = %e, "replay into new upstream failed");
                        }
                    }
                }
            }
            CopyEnd::Superseded => {}
            _ => {
                self.try_stop(counter).await;
            }
        }
        trace!(session = %self.id, "upstream copy exited");
    }

    async fn run_upstream(&self, counter: u32, pending: &mut Vec<u8>) -> CopyEnd {
        let mut buf = [0u8; protocol::IO_BUFFER_SIZE];
        loop {
            let mut guard = self.client_rd.lock().await;
            if self.running_stat() != RunningStat::Running || self.counter() != counter {
                return CopyEnd::Superseded;
            }
            if guard.is_none() {
                return CopyEnd::Superseded;
            }

            // First pass degrades the handshake reader to a raw half,
            // forwarding its read-ahead to the upstream.
            if matches!(guard.as_ref(), Some(ReadSource::Buffered(_))) {
                let Some(ReadSource::Buffered(reader)) = guard.take() else {
                    return CopyEnd::Superseded;
                };
                let residue = reader.buffer().to_vec();
                *guard = Some(ReadSource::Raw(reader.into_inner()));
                drop(guard);
                if !residue.is_empty() && self.write_to_server_raw(&residue).await.is_err() {
                    *pending = residue;
                    return CopyEnd::WriteFailed;
                }
                continue;
            }

            let Some(ReadSource::Raw(half)) = guard.as_mut() else {
                return CopyEnd::Superseded;
            };
            let n = match self.cycle_read(half, &mut buf, counter).await {
                CycleRead::Data(n) => n,
                CycleRead::Closed => {
                    debug!(session = %self.id, "client closed the connection");
                    return CopyEnd::ReadFailed;
                }
                CycleRead::Failed(e) => {
                    debug!(session = %self.id, error = %e, "client read failed");
                    return CopyEnd::ReadFailed;
                }
                CycleRead::Superseded => return CopyEnd::Superseded,
            };
            drop(guard);

            // A migration may have replaced the upstream while this chunk was
            // being read; the chunk is already consumed from the client, so
            // it must travel the replay path rather than race the handshake.
            if self.counter() != counter {
                *pending = buf[..n].to_vec();
                return CopyEnd::WriteFailed;
            }

            if self.write_to_server_raw(&buf[..n]).await.is_err() {
                *pending = buf[..n].to_vec();
                return CopyEnd::WriteFailed;
            }
        }
    }

    /// Watches the coordinator key holding this sub-account's coin for the
    /// life of the session. The watch is single-shot, so a fresh one is
    /// armed before the value is even compared.
    async fn watcher_loop(self: Arc<Self>) {
        let Some(mut watch) = self.take_watch() else {
            warn!(session = %self.id, "coin watcher started without a watch");
            return;
        };

        'watch: loop {
            // Fires on change, create, delete, or watch cancellation.
            let _ = watch.await;
            if !self.is_running() {
                break;
            }

            loop {
                let (path, current_coin) = {
                    let state = self.state();
                    (state.watch_path.clone(), state.mining_coin.clone())
                };

                let (new_coin, new_watch) = loop {
                    match self
                        .manager
                        .coordinator()
                        .get_and_watch(&path, self.id)
                        .await
                    {
                        Ok(pair) => break pair,
                        Err(e) => {
                            error!(session = %self.id, path = %path, error = %e, "coin watch re-read failed");
                            sleep(protocol::WATCH_RETRY_DELAY).await;
                            if !self.is_running() {
                                break 'watch;
                            }
                        }
                    }
                };
                watch = new_watch;

                if new_coin == current_coin {
                    trace!(session = %self.id, coin = %current_coin, "mining coin unchanged");
                    continue 'watch;
                }
                if self.manager.server_info(&new_coin).is_none() {
                    error!(session = %self.id, coin = %new_coin, "no stratum server for reassigned coin");
                    continue 'watch;
                }

                info!(
                    session = %self.id,
                    worker = %self.full_worker_name(),
                    from = %current_coin,
                    to = %new_coin,
                    "mining coin changed"
                );

                let counter = self.counter();
                let acted = if self.is_btc_agent() {
                    // Agent sessions multiplex many miners over one stateful
                    // connection; there is no seamless switch, only a drop.
                    self.try_stop(counter).await
                } else {
                    self.switch_coin(&new_coin, counter).await
                };
                if acted {
                    continue 'watch;
                }
                if !self.is_running() {
                    break 'watch;
                }
                // Lost the race against another transition; re-evaluate the
                // assignment under the new incarnation.
            }
        }
        trace!(session = %self.id, "coin watcher exited");
    }
}
