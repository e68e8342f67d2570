//! CLI entry point for srsmicro
//!
//! ```bash
//! srsmicro run --config config/srsmicro.toml
//! srsmicro run --simulate --log-format json
//! srsmicro ports
//! srsmicro check-config config/srsmicro.toml
//! ```
//!
//! `run` reads commands from stdin, one per line, as
//! `device|parameter|value`, and writes every device event to stdout as a
//! JSON line. It stops on EOF or Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use srsmicro::adapters::list_serial_ports;
use srsmicro::config::{Settings, DEFAULT_CONFIG_PATH};
use srsmicro::coordinator::Coordinator;
use srsmicro::instrument::EventSink;
use srsmicro::labone::sim::SimDiscovery;
use srsmicro::logging;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "srsmicro")]
#[command(about = "Instrument control for the scanning microscope bench", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the instruments and accept commands on stdin
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Use scripted instruments instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Log output format: pretty, compact or json
        #[arg(long)]
        log_format: Option<String>,
    },

    /// List serial ports on this machine
    Ports,

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            log_format,
        } => run(config, simulate, log_format).await,
        Commands::Ports => ports(),
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

async fn run(config: PathBuf, simulate: bool, log_format: Option<String>) -> Result<()> {
    let mut settings = load_settings(&config)?;
    if let Some(format) = log_format {
        settings.application.log_format = format;
    }
    logging::init_from_settings(&settings)?;

    let (sink, mut events) = EventSink::channel();
    let mut coordinator = if simulate {
        info!("Running against simulated instruments");
        Coordinator::simulated(&settings, sink)?
    } else {
        // The lock-in data server client is not part of this build; the
        // lock-in reports itself missing at startup and the rest still runs.
        warn!("No data server client available; lock-in will not be found");
        Coordinator::new(&settings, Arc::new(SimDiscovery::empty()), sink)?
    };

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Event not serializable"),
            }
        }
    });

    coordinator.startup().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match split_command(line) {
                        Some((device, parameter, value)) => {
                            coordinator.dispatch(device, parameter, value).await;
                        }
                        None => warn!(line, "Expected device|parameter|value"),
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    coordinator.shutdown().await;
    drop(coordinator);
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer ended abnormally");
    }
    Ok(())
}

fn split_command(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.splitn(3, '|');
    let device = parts.next()?.trim();
    let parameter = parts.next()?.trim();
    let value = parts.next().unwrap_or("").trim();
    Some((device, parameter, value))
}

fn ports() -> Result<()> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn check_config(config: PathBuf) -> Result<()> {
    let settings = load_settings(&config)?;
    println!("{} is valid", config.display());
    println!(
        "  {} on {} at {} baud",
        settings.laser.name, settings.laser.port, settings.laser.baud_rate
    );
    println!(
        "  {} on {} at {} baud",
        settings.delay_stage.name, settings.delay_stage.port, settings.delay_stage.baud_rate
    );
    println!(
        "  {} via {} ({})",
        settings.lockin.name,
        settings.lockin.host,
        settings.lockin.parameter_file.display()
    );
    Ok(())
}
