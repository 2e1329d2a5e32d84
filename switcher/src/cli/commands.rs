use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use crate::cli::{Args, Commands};
use crate::config::Config;
use crate::coordinator::{Coordinator, MemoryStore};
use crate::listener::Listener;
use crate::manager::Manager;
use crate::seeder::Seeder;

pub async fn execute(args: Args) -> Result<()> {
    setup_logging(&args)?;

    match args.command {
        Commands::Start { bind, with_seeder } => start(args.config, bind, with_seeder).await,
        Commands::Config { file, show } => validate_config(file, show),
        Commands::Init { output, force } => init_config(output, force),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn start(config_path: Option<PathBuf>, bind: Option<String>, with_seeder: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind_address = bind.parse().context("invalid bind address")?;
    }
    let config = Arc::new(config);

    info!("starting loka-switcher (server id {})", config.server.id);

    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(Coordinator::new(store));
    let manager = Arc::new(Manager::new(config.clone(), coordinator.clone()));

    if with_seeder {
        if config.seeder.is_some() {
            let seeder = Arc::new(Seeder::new(config.clone(), coordinator));
            tokio::spawn(async move { seeder.run().await });
        } else {
            warn!("--with-seeder given but the config has no [seeder] section");
        }
    }

    let listener = Listener::new(manager).await?;
    let server = tokio::spawn(async move {
        if let Err(e) = listener.accept().await {
            error!("listener error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = server => {
            if let Err(e) = result {
                error!("listener task failed: {}", e);
            }
        }
    }

    info!("switcher shut down");
    Ok(())
}

fn validate_config(file: PathBuf, show: bool) -> Result<()> {
    info!("validating configuration file: {}", file.display());

    let config = Config::load_from_file(&file)?;
    config.validate()?;

    info!("configuration is valid");
    if show {
        println!("Effective configuration:");
        println!("{config:#?}");
    }
    Ok(())
}

fn init_config(output: PathBuf, force: bool) -> Result<()> {
    anyhow::ensure!(
        force || !output.exists(),
        "{} already exists (use --force to overwrite)",
        output.display()
    );

    let config = Config::example();
    std::fs::write(&output, toml::to_string_pretty(&config)?)?;
    info!("wrote example configuration to {}", output.display());
    Ok(())
}

fn setup_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_level = match args.verbose {
        0 => args.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_file(false)
                .compact(),
        )
        .init();

    Ok(())
}
