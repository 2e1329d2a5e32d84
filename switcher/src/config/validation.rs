use crate::config::Config;
use crate::error::{Result, SwitcherError};

impl Config {
    /// Checks the loaded configuration for values the proxy cannot run
    /// with. Called once at startup, before anything binds or dials.
    pub fn validate(&self) -> Result<()> {
        if self.coins.is_empty() {
            return Err(invalid("at least one coin server must be configured"));
        }
        for (coin, server) in &self.coins {
            if coin.is_empty() {
                return Err(invalid("coin names must not be empty"));
            }
            if !server.url.contains(':') {
                return Err(invalid(&format!(
                    "coin {coin}: server url must be host:port, got {:?}",
                    server.url
                )));
            }
        }

        let coordinator = &self.coordinator;
        if !coordinator.switcher_watch_dir.ends_with('/') {
            return Err(invalid("switcher_watch_dir must end with '/'"));
        }
        if !coordinator.auto_register_watch_dir.ends_with('/') {
            return Err(invalid("auto_register_watch_dir must end with '/'"));
        }
        if !coordinator.user_case_insensitive_index.is_empty()
            && !coordinator.user_case_insensitive_index.ends_with('/')
        {
            return Err(invalid("user_case_insensitive_index must end with '/'"));
        }
        if coordinator.auto_register && coordinator.auto_register_max_pending == 0 {
            return Err(invalid(
                "auto_register_max_pending must be > 0 when auto_register is enabled",
            ));
        }

        if self.server.max_session_id == 0 {
            return Err(invalid("max_session_id must be > 0"));
        }

        if let Some(seeder) = &self.seeder {
            if seeder.interval_seconds == 0 {
                return Err(invalid("seeder interval_seconds must be > 0"));
            }
            if seeder.user_list_api.is_empty() {
                return Err(invalid("seeder user_list_api must not be empty"));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> SwitcherError {
    SwitcherError::Config(message.to_string())
}
