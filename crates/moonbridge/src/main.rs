#![warn(missing_docs)]

//! Entry point for the `moonbridge` binary.

mod cli;
mod commands;
mod error;

use std::process;

use clap::Parser;
use klippy_bridge::KlippyBridge;
use ron::ser::PrettyConfig;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    error::{Error, Result},
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err}");
        eprintln!("error: {err}");
        process::exit(1);
    }
}

/// Parse CLI arguments, install logging, load config, and dispatch.
async fn run() -> Result<()> {
    let Cli {
        log,
        config: config_path,
        socket,
        command,
    } = Cli::parse();
    logging::init(&log.spec());

    let (cfg, path) = config::load(config_path.as_deref())?;
    let cfg = cfg.with_socket(socket);
    cfg.validate(path.as_deref())?;

    match command.unwrap_or(Commands::Run) {
        Commands::Check => {
            match &path {
                Some(p) => info!(path = %p.display(), "config ok"),
                None => info!("no config file; showing defaults"),
            }
            let text = ron::ser::to_string_pretty(&cfg, PrettyConfig::default())
                .map_err(|e| Error::Render(e.to_string()))?;
            println!("{text}");
            Ok(())
        }
        Commands::Run => commands::run(&KlippyBridge::new(cfg.bridge())).await,
        Commands::Call { method, params } => {
            commands::call(&KlippyBridge::new(cfg.bridge()), &method, params.as_deref()).await
        }
        Commands::Watch { objects } => {
            commands::watch(&KlippyBridge::new(cfg.bridge()), &objects).await
        }
    }
}
