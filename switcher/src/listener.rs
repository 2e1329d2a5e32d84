use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::manager::Manager;
use crate::session::Session;

/// Accepts miner connections and hands each one to a fresh [`Session`].
pub struct Listener {
    listener: TcpListener,
    manager: Arc<Manager>,
}

impl Listener {
    pub async fn new(manager: Arc<Manager>) -> anyhow::Result<Self> {
        let bind = manager.config().server.bind_address;
        let listener = TcpListener::bind(bind).await?;

        info!(
            "stratum switcher listening on {} (chain {:?}, {} coins configured)",
            listener.local_addr()?,
            manager.config().server.chain,
            manager.config().coins.len()
        );

        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    metrics::counter!("switcher_connections_total").increment(1);

                    let Some(id) = self.manager.ids().allocate() else {
                        warn!("session ids exhausted, dropping connection from {}", addr);
                        metrics::counter!("switcher_connections_rejected_total").increment(1);
                        continue;
                    };

                    info!("new miner connection from {} as {}", addr, id);
                    let session = Session::new(self.manager.clone(), stream, id, addr);
                    tokio::spawn(async move { session.run().await });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }
}
