//! raynet: relay server entry point
//!
//! ```bash
//! # Run with a configuration file
//! raynet -c /etc/raynet/config.json
//!
//! # Validate a configuration without starting
//! raynet -c config.json --check
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raynet::config::load_config;
use raynet::dispatch::default_registry;
use raynet::Point;

struct Args {
    config_path: PathBuf,
    check_only: bool,
}

impl Args {
    fn parse() -> Self {
        let mut config_path = PathBuf::from("/etc/raynet/config.json");
        let mut check_only = false;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => check_only = true,
                "-V" | "--version" => {
                    println!("raynet {}", raynet::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    eprintln!("usage: raynet [-c CONFIG] [--check]");
                    std::process::exit(2);
                }
            }
        }
        Self {
            config_path,
            check_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.check_only {
        println!("configuration ok: {}", args.config_path.display());
        return Ok(());
    }

    info!("raynet {} starting", raynet::VERSION);
    let point = Point::new(&config, default_registry()).context("building handlers")?;
    point.start().await.context("starting inbounds")?;

    signal::ctrl_c().await.context("waiting for shutdown")?;
    info!("shutting down");
    point.close();
    Ok(())
}
