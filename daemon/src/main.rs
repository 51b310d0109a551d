mod hosts;
mod netwatch;
mod tun_linux;

use burrow_engine::{
    should_autostart, BlockLogEntry, Command as EngineCommand, Config, Engine, EngineOptions,
    EngineState,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const BLOCK_LOG_FILE: &str = "blocklog.json";
const ACTIVE_FLAG_FILE: &str = "active";

#[derive(Parser)]
#[command(name = "burrow-daemon")]
#[command(about = "Host-local DNS-filtering gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until stopped
    Run {
        /// Configuration document
        #[arg(long, default_value = "/etc/burrow/config.json")]
        config: PathBuf,

        /// State directory (block log, active flag)
        #[arg(long, default_value = "/var/lib/burrow")]
        data_dir: PathBuf,

        /// Name of the tun device to create
        #[arg(long, default_value = "burrow0")]
        tun_name: String,
    },
    /// Validate the configuration and its rule sources
    Check {
        #[arg(long, default_value = "/etc/burrow/config.json")]
        config: PathBuf,
    },
    /// Print the persisted block log
    Log {
        #[arg(long, default_value = "/var/lib/burrow")]
        data_dir: PathBuf,
    },
    /// Succeed when the gateway should start at boot
    Autostart {
        #[arg(long, default_value = "/etc/burrow/config.json")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/burrow")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,burrow_engine=debug")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            data_dir,
            tun_name,
        } => run(&config, &data_dir, &tun_name).await,
        Commands::Check { config } => check(&config),
        Commands::Log { data_dir } => print_log(&data_dir),
        Commands::Autostart { config, data_dir } => autostart(&config, &data_dir),
    }
}

async fn run(
    config_path: &Path,
    data_dir: &Path,
    tun_name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    std::fs::create_dir_all(data_dir)?;

    let rules = Arc::new(hosts::build_rule_table(&config));
    tracing::info!(entries = rules.len(), "rule table built");

    let (initial_device, mut net_events) = match netwatch::start(tun_name).await {
        Ok((device, rx)) => (device, Some(rx)),
        Err(e) => {
            tracing::warn!(error = %e, "network watching unavailable");
            (None, None)
        }
    };
    let system_resolvers = hosts::system_resolvers();
    let block_log_path = data_dir.join(BLOCK_LOG_FILE);

    let start_engine = |device: Option<String>| {
        Engine::start(EngineOptions {
            config: config.clone(),
            rules: rules.clone(),
            tun: Box::new(tun_linux::LinuxTunBuilder::new(tun_name)),
            upstream_device: device,
            system_resolvers: system_resolvers.clone(),
            block_log_path: Some(block_log_path.clone()),
        })
    };

    let mut current_device = initial_device.clone();
    let mut engine = Some(start_engine(initial_device)?);
    let mut status_rx = engine.as_ref().unwrap().status();
    write_active_flag(data_dir, true)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    tracing::info!(tun = tun_name, "burrow running; SIGUSR1 pauses, SIGUSR2 resumes");

    // The active flag survives a service-manager SIGTERM so autostart can
    // bring the gateway back after a reboot; an interactive ^C clears it.
    let mut clear_flag_on_exit = true;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM, stopping");
                clear_flag_on_exit = false;
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT, stopping");
                break;
            }
            _ = sigusr1.recv() => {
                if let Some(engine) = engine.take() {
                    tracing::info!("SIGUSR1, pausing");
                    engine.stop().await;
                    write_active_flag(data_dir, false)?;
                }
            }
            _ = sigusr2.recv() => {
                if engine.is_none() {
                    tracing::info!("SIGUSR2, resuming");
                    match start_engine(current_device.clone()) {
                        Ok(e) => {
                            status_rx = e.status();
                            engine = Some(e);
                            write_active_flag(data_dir, true)?;
                        }
                        Err(e) => tracing::error!(error = %e, "resume failed"),
                    }
                }
            }
            event = recv_net(&mut net_events) => {
                match event {
                    netwatch::NetEvent::Lost => {
                        current_device = None;
                        if let Some(engine) = &engine {
                            engine.command(EngineCommand::NetworkLost).await;
                        }
                    }
                    netwatch::NetEvent::Available { device } => {
                        current_device = device.clone();
                        if let Some(engine) = &engine {
                            engine.command(EngineCommand::NetworkAvailable { device }).await;
                        }
                    }
                }
            }
            changed = status_rx.changed(), if engine.is_some() => {
                let status = status_rx.borrow_and_update().clone();
                match &status.detail {
                    Some(detail) => tracing::info!(state = %status.state, %detail, "engine status"),
                    None => tracing::info!(state = %status.state, "engine status"),
                }
                if changed.is_err() || status.state == EngineState::Stopped {
                    tracing::error!("engine stopped outside of daemon control");
                    write_active_flag(data_dir, false)?;
                    engine = None;
                }
            }
        }
    }

    if let Some(engine) = engine.take() {
        engine.stop().await;
    }
    if clear_flag_on_exit {
        write_active_flag(data_dir, false)?;
    }
    tracing::info!("stopped");
    Ok(())
}

async fn recv_net(events: &mut Option<mpsc::Receiver<netwatch::NetEvent>>) -> netwatch::NetEvent {
    match events {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn check(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let rules = hosts::build_rule_table(&config);
    let configured = config.enabled_resolvers();

    println!("configuration: ok");
    println!("rule entries:  {}", rules.len());
    if configured.is_empty() {
        let inherited = hosts::system_resolvers();
        println!("resolvers:     {} inherited from the system", inherited.len());
        if inherited.is_empty() {
            return Err("no upstream resolvers configured and none inherited".into());
        }
    } else {
        println!("resolvers:     {} configured", configured.len());
    }
    Ok(())
}

fn print_log(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let path = data_dir.join(BLOCK_LOG_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("no block log at {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let entries: Vec<BlockLogEntry> = serde_json::from_slice(&data)?;
    for entry in entries {
        println!(
            "{:<12} {:<6} {}",
            entry.timestamp_ms / 1000,
            entry.disposition,
            entry.name
        );
    }
    Ok(())
}

fn autostart(config_path: &Path, data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let active = read_active_flag(data_dir);
    if should_autostart(&config, active) {
        println!("autostart: yes");
        Ok(())
    } else {
        println!("autostart: no");
        std::process::exit(1);
    }
}

fn write_active_flag(data_dir: &Path, active: bool) -> std::io::Result<()> {
    std::fs::write(
        data_dir.join(ACTIVE_FLAG_FILE),
        if active { "1\n" } else { "0\n" },
    )
}

fn read_active_flag(data_dir: &Path) -> bool {
    std::fs::read(data_dir.join(ACTIVE_FLAG_FILE))
        .map(|data| data.first() == Some(&b'1'))
        .unwrap_or(false)
}
