use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};
use tokio_util::sync::CancellationToken;

mod config;
mod engine;
mod error;
mod manager;
mod notify;
mod presence;
mod scanner;
mod store;
mod vendor;

use config::AppConfig;
use engine::PresenceEngine;
use manager::Manager;
use notify::mqtt::MqttClient;
use notify::{DispatchPolicy, Dispatcher};
use presence::{DeviceId, TransitionKind};
use scanner::NmapScanner;
use store::{HistoryQuery, PresenceStore, SqliteStore};

/// Network presence detector.
#[derive(Parser, Debug)]
#[command(name = "wifinder", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor the network continuously
    Watch {
        /// Network to scan (e.g. 192.168.1.0/24)
        #[arg(short, long)]
        network: Option<String>,
        /// Seconds between scans
        #[arg(short, long)]
        interval: Option<u64>,
        /// Panic on every arrival
        #[arg(short, long)]
        panic: bool,
        /// Track presence without notifying
        #[arg(short, long)]
        silent: bool,
    },
    /// Run a single scan
    Scan {
        #[arg(short, long)]
        network: Option<String>,
    },
    /// List devices
    List {
        /// Include offline devices
        #[arg(short, long)]
        all: bool,
    },
    /// Show the arrival/departure log
    Log {
        mac: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Name a device
    Add {
        mac: String,
        name: String,
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Who is home right now
    Who,
    /// Show config and database paths
    DbPath,
    /// Delete all recorded devices and history
    DbReset {
        /// Don't ask for confirmation
        #[arg(short, long)]
        force: bool,
    },
    /// Write a starter config file
    Init {
        /// Network to scan; detected from the default route if unset
        #[arg(short, long)]
        network: Option<String>,
        /// Enable panic mode
        #[arg(short, long)]
        panic: bool,
        /// Overwrite an existing file without asking
        #[arg(short, long)]
        force: bool,
    },
}

/// How long the MQTT event loop gets to flush the disconnect.
const MQTT_DRAIN: Duration = Duration::from_secs(2);

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let load = || AppConfig::load(&cli.config);

    match cli.command {
        Command::Watch {
            network,
            interval,
            panic,
            silent,
        } => {
            let mut config = load()?;
            if let Some(network) = network {
                config.network = network;
            }
            if let Some(interval) = interval {
                config.interval = interval;
            }
            if panic {
                config.panic.enabled = true;
                config.panic.only_unknown = false;
            }
            config.validate()?;
            watch(&config, silent).await
        }
        Command::Scan { network } => {
            let mut config = load()?;
            if let Some(network) = network {
                config.network = network;
            }
            config.validate()?;
            scan(&config).await
        }
        Command::List { all } => list(&load()?, all),
        Command::Log { mac, limit } => log_history(&load()?, mac.as_deref(), limit),
        Command::Add { mac, name, group } => add(&load()?, &mac, &name, group.as_deref()),
        Command::Who => who(&load()?),
        Command::DbPath => db_path(&cli.config, &load()?),
        Command::DbReset { force } => db_reset(&load()?, force),
        // an existing config may be the broken one being replaced
        Command::Init {
            network,
            panic,
            force,
        } => init(&cli.config, network, panic, force),
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))
}

async fn watch(config: &AppConfig, silent: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mqtt_shutdown = CancellationToken::new();

    let mut mqtt = None;
    let dispatcher = if silent {
        None
    } else {
        let mut sinks = notify::configured_sinks(config);
        if let Some(mqtt_config) = &config.notify.mqtt {
            let (client, eventloop) = MqttClient::new(mqtt_config);
            let handle = tokio::spawn(MqttClient::event_loop(eventloop, mqtt_shutdown.clone()));
            sinks.push(Box::new(client.clone()));
            mqtt = Some((client, handle));
        }
        info!(
            "Notifying via {}",
            sinks.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );
        Some(Dispatcher::new(DispatchPolicy::from_config(config)?, sinks))
    };

    let mut manager = Manager::new(
        NmapScanner::new(config.network.clone()),
        open_store(config)?,
        PresenceEngine::new(config.device_ttl()),
        dispatcher,
        config.interval(),
    );

    info!("Watching {}", config.network);
    if config.panic.enabled {
        warn!("PANIC MODE");
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stopping after the current cycle");
            }
            shutdown.cancel();
        }
    });

    manager.run_loop(shutdown.clone()).await;
    shutdown.cancel();

    if let Some((client, handle)) = mqtt {
        match client.disconnect().await {
            // the event loop exits once the disconnect has gone out
            Ok(()) => {
                if tokio::time::timeout(MQTT_DRAIN, handle).await.is_err() {
                    warn!("MQTT disconnect not flushed within {:?}", MQTT_DRAIN);
                }
            }
            Err(err) => warn!("Error disconnecting from MQTT: {}", err),
        }
        mqtt_shutdown.cancel();
    }
    Ok(())
}

async fn scan(config: &AppConfig) -> Result<()> {
    let mut manager = Manager::new(
        NmapScanner::new(config.network.clone()),
        open_store(config)?,
        PresenceEngine::new(config.device_ttl()),
        None,
        config.interval(),
    );
    manager.run_cycle(false).await?;

    let online = manager.store().list_devices(false)?;
    if online.is_empty() {
        println!("No devices found");
        return Ok(());
    }
    for d in &online {
        println!(
            "● {} ({})",
            d.label.as_deref().unwrap_or("unknown"),
            d.id
        );
    }
    println!("\n{} online", online.len());
    Ok(())
}

fn list(config: &AppConfig, all: bool) -> Result<()> {
    let devices = open_store(config)?.list_devices(all)?;
    if devices.is_empty() {
        println!("No devices");
        return Ok(());
    }
    for d in &devices {
        println!(
            "{}  {:<24} {:<10} {}",
            if d.is_online() { "●" } else { "○" },
            d.label.as_deref().unwrap_or("unknown"),
            d.group.as_deref().unwrap_or(""),
            d.id
        );
    }
    println!("\n{} devices", devices.len());
    Ok(())
}

fn log_history(config: &AppConfig, mac: Option<&str>, limit: usize) -> Result<()> {
    let device = mac.map(str::parse::<DeviceId>).transpose()?;
    let entries = open_store(config)?.list_transitions(&HistoryQuery {
        device,
        limit,
        ..Default::default()
    })?;
    if entries.is_empty() {
        println!("No history");
        return Ok(());
    }
    for entry in entries.iter().rev() {
        let t = &entry.transition;
        println!(
            "{} {} {}",
            t.at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            match t.kind {
                TransitionKind::Arrived => "●",
                TransitionKind::Departed => "○",
            },
            entry.label.clone().unwrap_or_else(|| t.device.to_string())
        );
    }
    Ok(())
}

fn add(config: &AppConfig, mac: &str, name: &str, group: Option<&str>) -> Result<()> {
    let id: DeviceId = mac.parse()?;
    if !open_store(config)?.set_label(&id, name, group)? {
        anyhow::bail!("{id} has not been seen yet; run a scan first");
    }
    match group {
        Some(group) => println!("✓ {name} ({group})"),
        None => println!("✓ {name}"),
    }
    Ok(())
}

fn who(config: &AppConfig) -> Result<()> {
    let online = open_store(config)?.list_devices(false)?;
    println!("{}", presence::who_is_home(&online));
    Ok(())
}

fn db_path(config_path: &Path, config: &AppConfig) -> Result<()> {
    println!("Config:   {}", config_path.display());
    println!("Database: {}", config.db_path.display());
    if let Ok(meta) = std::fs::metadata(&config.db_path) {
        println!("{} bytes", meta.len());
    }
    Ok(())
}

fn confirm(message: &str) -> Result<bool> {
    print!("{} [y/N]: ", message);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim();
    Ok(input.eq_ignore_ascii_case("y") || input.eq_ignore_ascii_case("yes"))
}

fn db_reset(config: &AppConfig, force: bool) -> Result<()> {
    if !config.db_path.exists() {
        println!("No database");
        return Ok(());
    }
    if !force && !confirm("Delete all data?")? {
        anyhow::bail!("aborted");
    }
    std::fs::remove_file(&config.db_path)
        .with_context(|| format!("removing {}", config.db_path.display()))?;
    println!("✓ Reset");
    Ok(())
}

fn init(path: &Path, network: Option<String>, panic: bool, force: bool) -> Result<()> {
    if path.exists() && !force && !confirm(&format!("Overwrite {}?", path.display()))? {
        anyhow::bail!("aborted");
    }

    let network = network.unwrap_or_else(|| {
        let detected = config::detect_network();
        println!("Detected: {detected}");
        detected
    });
    let mut config = AppConfig {
        network,
        ..Default::default()
    };
    config.panic.enabled = panic;
    config.validate()?;
    config.save(path)?;

    println!("✓ Saved to {}", path.display());
    println!("Try: wifinder scan");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_watch_flags() {
        let cli = Cli::parse_from(["wifinder", "watch", "-n", "10.0.0.0/24", "-i", "10", "--panic"]);
        match cli.command {
            Command::Watch {
                network,
                interval,
                panic,
                silent,
            } => {
                assert_eq!(network.as_deref(), Some("10.0.0.0/24"));
                assert_eq!(interval, Some(10));
                assert!(panic);
                assert!(!silent);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn test_db_reset_force_removes_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            db_path: dir.path().join("wifinder.db"),
            ..Default::default()
        };
        SqliteStore::open(&config.db_path).unwrap();
        assert!(config.db_path.exists());

        db_reset(&config, true).unwrap();
        assert!(!config.db_path.exists());
        // nothing left to reset
        db_reset(&config, true).unwrap();
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        init(&path, Some("10.9.8.0/24".to_string()), true, false).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.network, "10.9.8.0/24");
        assert!(config.panic.enabled);

        assert!(init(&path, Some("not a network".to_string()), false, true).is_err());
        assert_eq!(AppConfig::load(&path).unwrap().network, "10.9.8.0/24");
    }

    #[test]
    fn test_db_reset_flags() {
        let cli = Cli::parse_from(["wifinder", "-c", "alt.toml", "db-reset", "--force"]);
        assert!(matches!(cli.command, Command::DbReset { force: true }));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }
}
