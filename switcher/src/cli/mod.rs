mod args;
mod commands;

pub use args::{Args, Commands};
pub use commands::execute;

/// CLI entry point used by the binary.
pub async fn run() -> anyhow::Result<()> {
    execute(Args::parse()).await
}
