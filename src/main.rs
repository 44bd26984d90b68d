// ledctl - Screen and audio driven colors for addressable LED strips
mod audio;
mod capture;
mod client;
mod config;
mod controller;
mod effects;
mod engine;
mod error;
mod gradients;
mod perimeter;
mod protocol;
mod server;
mod spectrum;
mod strip;
mod types;
mod visualizer;

use anyhow::{Context, Result};
use clap::Parser;
use notify::{Config, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use audio::LoopbackSource;
use client::{LogProcessor, TransportClient};
use config::{Args, ClientConfig, ConfigFile, DriverKind, Role, ServerConfig};
use controller::ModeController;
use engine::RenderEngine;
use server::Dispatcher;
use strip::{DdpFactory, DriverFactory, NullFactory};
use types::{Mode, SegmentCommand};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests for the mode controller from stdin and the config watcher
enum Command {
    Mode(Mode),
    Segment(SegmentCommand),
    Config(Box<ClientConfig>),
}

fn init_logging(args: &Args) {
    let level = if args.quiet {
        LevelFilter::WARN
    } else if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Reload the client config whenever the file is modified; invalid edits are logged and skipped
fn spawn_config_watcher(path: PathBuf, commands: mpsc::Sender<Command>) -> Result<()> {
    std::thread::Builder::new().name("config-watcher".into()).spawn(move || {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
            Ok(w) => w,
            Err(e) => {
                warn!("Config watcher unavailable: {}", e);
                return;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("Cannot watch {}: {}", path.display(), e);
            return;
        }
        debug!("Watching {}", path.display());

        loop {
            match rx.recv() {
                Ok(Ok(NotifyEvent { kind, .. })) => {
                    if !matches!(kind, notify::EventKind::Modify(_)) {
                        continue;
                    }
                    match ClientConfig::load_from(&path) {
                        Ok(config) => {
                            if commands.blocking_send(Command::Config(Box::new(config))).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring config change: {:#}", e),
                    }
                }
                Ok(Err(e)) => debug!("Watch error: {}", e),
                Err(_) => break,
            }
        }
    })?;
    Ok(())
}

/// One mode name per line on stdin
fn spawn_stdin_reader(commands: mpsc::Sender<Command>) -> Result<()> {
    std::thread::Builder::new().name("stdin-commands".into()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let command = match line.parse::<Mode>() {
                Ok(mode) => Command::Mode(mode),
                Err(mode_err) => match line.parse::<SegmentCommand>() {
                    Ok(cmd) => Command::Segment(cmd),
                    Err(e) => {
                        warn!("{}; {}", mode_err, e);
                        continue;
                    }
                },
            };
            if commands.blocking_send(command).is_err() {
                break;
            }
        }
    })?;
    Ok(())
}

fn list_audio() -> Result<()> {
    println!("Audio devices:");
    for (name, _) in audio::list_audio_devices()? {
        println!("  {}", name);
    }
    Ok(())
}

fn list_displays(config: &ClientConfig) -> Result<()> {
    let provider = capture::provider(config.capture);
    println!("Displays ({}):", provider.name());
    for d in provider.all()? {
        println!(
            "  id={} {}x{} at ({}, {}) {:?}",
            d.id, d.width, d.height, d.origin_x, d.origin_y, d.orientation
        );
    }
    Ok(())
}

async fn run_client(config: ClientConfig, mode: Option<String>) -> Result<()> {
    let start_mode = match mode {
        Some(m) => m.parse::<Mode>()?,
        None => config.mode,
    };

    let provider = capture::provider(config.capture);
    let audio_source = Arc::new(LoopbackSource { device: config.audio.device_name() });
    let mut controller = ModeController::new(config.clone(), provider, audio_source)?;
    let events = controller.events().context("Outbound events already taken")?;

    let client = Arc::new(TransportClient::new(
        config.address(),
        controller.reload_message(),
        Arc::new(LogProcessor),
    ));
    let cancel = CancellationToken::new();
    let supervisor = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };
    let pump = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move { client.pump(events, cancel).await })
    };
    info!("Streaming to {}", config.address());

    let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
    if let Some(path) = config.config_path.clone() {
        spawn_config_watcher(path, cmd_tx.clone())?;
    }
    spawn_stdin_reader(cmd_tx)?;

    controller.set_mode(start_mode).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Mode(mode)) => {
                    debug!(current = ?controller.mode(), requested = %mode, "Mode command");
                    if let Err(e) = controller.set_mode(mode).await {
                        warn!("Mode switch failed: {:#}", e);
                    }
                }
                Some(Command::Segment(cmd)) => {
                    if let Err(e) = controller.segment(cmd).await {
                        warn!("Segment command failed: {:#}", e);
                    }
                }
                Some(Command::Config(config)) => {
                    if let Err(e) = controller.apply_config(*config).await {
                        warn!("Config change failed: {:#}", e);
                    }
                }
                None => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    info!("Shutting down");
    if !client.is_connected() {
        warn!("Server not connected, strip is left as it is");
    }
    controller.shutdown().await;
    // Dropping the controller closes the outbound queue so the pump drains and exits
    drop(controller);
    if tokio::time::timeout(FLUSH_TIMEOUT, pump).await.is_err() {
        debug!("Outbound queue not flushed before shutdown");
    }
    cancel.cancel();
    supervisor.await?;
    Ok(())
}

async fn run_server(config: ServerConfig, listen: Option<String>) -> Result<()> {
    let factory: Arc<dyn DriverFactory> = match config.driver {
        DriverKind::Ddp => Arc::new(DdpFactory { target: config.ddp_target.clone() }),
        DriverKind::Null => Arc::new(NullFactory),
    };
    let engine = Arc::new(RenderEngine::new(factory, config.strip.settings())?);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&engine), config.calibration.clone()));

    let address = listen.unwrap_or_else(|| config.address());
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to listen on {}", address))?;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(server::serve(listener, dispatcher, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    server.await??;

    tokio::task::spawn_blocking(move || engine.fini()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    let cfg_arg = args.cfg.as_deref();

    match args.role {
        Role::Client { list_audio: true, .. } => list_audio(),
        Role::Client { list_displays: true, .. } => {
            let config = ClientConfig::load_with_path(cfg_arg)?;
            list_displays(&config)
        }
        Role::Client { mode, .. } => {
            let config = ClientConfig::load_with_path(cfg_arg)?;
            if let Some(path) = &config.config_path {
                info!("Using config file: {}", path.display());
            }
            run_client(config, mode).await
        }
        Role::Server { listen } => {
            let config = ServerConfig::load_with_path(cfg_arg)?;
            if let Some(path) = &config.config_path {
                info!("Using config file: {}", path.display());
            }
            run_server(config, listen).await
        }
    }
}
