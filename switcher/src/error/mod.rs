mod types;

pub use types::{Result, StratumError, SwitcherError};
