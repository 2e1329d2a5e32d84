//! The user-list seeder: periodically pulls per-coin user enumerations from
//! an HTTP endpoint and creates coordinator records for sub-accounts that
//! have no coin assignment yet. Idempotent; existing records are left alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::{Coordinator, StoreError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeedError {
    #[error("sub-account name is empty")]
    EmptyName,
    #[error("sub-account name contains '/'")]
    InvalidName,
    #[error("coin is empty")]
    EmptyCoin,
    #[error("coin {0} is not configured")]
    UnknownCoin(String),
    #[error("record already exists")]
    RecordExists,
    #[error("coordinator read failed: {0}")]
    ReadFailed(String),
    #[error("coordinator write failed: {0}")]
    WriteFailed(String),
}

/// Response of the user enumeration endpoint. With zero users the `data`
/// member degrades from an object to an empty array, hence the two shapes.
#[derive(Debug, Deserialize)]
struct UserListResponse {
    err_no: i32,
    #[serde(default)]
    err_msg: String,
    #[serde(default)]
    data: UserListData,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserListData {
    Users(HashMap<String, i64>),
    Empty(Vec<serde_json::Value>),
}

impl Default for UserListData {
    fn default() -> Self {
        UserListData::Empty(Vec::new())
    }
}

pub struct Seeder {
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
    http: Client,
}

impl Seeder {
    pub fn new(config: Arc<Config>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
            http: Client::new(),
        }
    }

    /// Runs one polling loop per configured coin until the process exits.
    pub async fn run(self: Arc<Self>) {
        let Some(seeder_config) = self.config.seeder.clone() else {
            return;
        };
        let interval = Duration::from_secs(seeder_config.interval_seconds.max(1));

        let mut tasks = Vec::new();
        for (coin, url) in seeder_config.user_list_api {
            let seeder = self.clone();
            tasks.push(tokio::spawn(async move {
                seeder.poll_loop(coin, url, interval).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn poll_loop(&self, coin: String, url: String, interval: Duration) {
        // High-water mark of seen user ids, passed back as `last_id`.
        let mut last_puid: i64 = 0;
        loop {
            if let Err(e) = self.iterate(&coin, &url, &mut last_puid).await {
                error!(coin = %coin, error = %e, "seeder iteration failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One fetch-and-seed pass.
    async fn iterate(&self, coin: &str, url: &str, last_puid: &mut i64) -> anyhow::Result<()> {
        let url_with_last_id = format!("{url}?last_id={last_puid}");
        info!("HTTP GET {url_with_last_id}");
        let response: UserListResponse = self
            .http
            .get(&url_with_last_id)
            .send()
            .await?
            .json()
            .await?;
        anyhow::ensure!(
            response.err_no == 0,
            "user list endpoint error {}: {}",
            response.err_no,
            response.err_msg
        );

        let users = match response.data {
            UserListData::Empty(_) => {
                info!(coin = %coin, "no new users");
                return Ok(());
            }
            UserListData::Users(users) => users,
        };
        info!(coin = %coin, count = users.len(), "user list fetched");

        for (puname, puid) in users {
            // Strip a trailing coin qualifier ("alice_btc" -> "alice").
            let puname = match puname.rfind('_') {
                Some(pos) => &puname[..pos],
                None => puname.as_str(),
            };
            match self.set_mining_coin(puname, coin).await {
                Ok(()) => info!(puname, puid, coin, "coin record created"),
                // Existing records still advance the high-water mark.
                Err(SeedError::RecordExists) => {}
                Err(e) => {
                    info!(puname, coin, error = %e, "user skipped");
                    continue;
                }
            }
            if puid > *last_puid {
                *last_puid = puid;
            }
        }
        Ok(())
    }

    /// Idempotently records `puname -> coin`. `RecordExists` means an
    /// assignment was already present, whatever its coin.
    pub async fn set_mining_coin(&self, puname: &str, coin: &str) -> Result<(), SeedError> {
        if puname.is_empty() {
            return Err(SeedError::EmptyName);
        }
        if puname.contains('/') {
            return Err(SeedError::InvalidName);
        }
        if coin.is_empty() {
            return Err(SeedError::EmptyCoin);
        }
        let known = self
            .config
            .seeder
            .as_ref()
            .is_some_and(|seeder| seeder.user_list_api.contains_key(coin));
        if !known {
            return Err(SeedError::UnknownCoin(coin.to_string()));
        }

        let coordinator_config = &self.config.coordinator;
        let mut puname = puname.to_string();
        if coordinator_config.stratum_server_case_insensitive {
            // Case-insensitive upstreams: a lower-cased record is enough.
            puname = puname.to_lowercase();
        } else if !coordinator_config.user_case_insensitive_index.is_empty() {
            // Case-sensitive upstreams keep the original spelling and get a
            // lower-cased index node pointing at it.
            let index_path = format!(
                "{}{}",
                coordinator_config.user_case_insensitive_index,
                puname.to_lowercase()
            );
            match self.coordinator.exists(&index_path).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.coordinator.create(&index_path, &puname).await {
                        if !matches!(e, StoreError::AlreadyExists(_)) {
                            error!(path = %index_path, error = %e, "case index create failed");
                        }
                    }
                }
                Err(e) => error!(path = %index_path, error = %e, "case index lookup failed"),
            }
        }

        let path = format!("{}{}", coordinator_config.switcher_watch_dir, puname);
        match self.coordinator.exists(&path).await {
            Ok(true) => return Err(SeedError::RecordExists),
            Ok(false) => {}
            Err(e) => return Err(SeedError::ReadFailed(e.to_string())),
        }
        match self.coordinator.create(&path, coin).await {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => Err(SeedError::RecordExists),
            Err(e) => Err(SeedError::WriteFailed(e.to_string())),
        }
    }
}
