mod types;
mod validation;

pub use types::{Config, CoordinatorConfig, SeederConfig, ServerConfig, StratumServerInfo};
