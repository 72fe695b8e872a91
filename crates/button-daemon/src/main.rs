mod client;
mod coordinator;
mod core;
#[cfg(feature = "gpio")]
mod gpio;
mod http;
mod input;
mod logging;
mod registry;
mod socket;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use button_proto::config::Config;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{MoppyClient, PlaybackClient};
use crate::coordinator::PressCoordinator;
use crate::input::{ActiveInputs, InputSource};
use crate::registry::ButtonRegistry;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
}

/// Button-press controller for a Moppy MIDI playback service.
#[derive(Debug, Parser)]
#[command(name = "moppy-buttons", version)]
struct Cli {
    /// Path to the YAML configuration file
    config: PathBuf,

    /// Validate the configuration, print a summary and exit
    #[arg(long)]
    check: bool,
}

fn print_summary(config: &Config) {
    println!("Configuration OK");
    println!("  Moppy API:  {}", config.moppy_api.base_url);
    match config.moppy_api.request_timeout() {
        Some(timeout) => println!("  Timeout:    {:?}", timeout),
        None => println!("  Timeout:    none"),
    }
    if config.gpio.enabled {
        println!(
            "  GPIO:       {:?}, {:?}, bounce {} ms",
            config.gpio.mode, config.gpio.pull_up_down, config.gpio.bounce_time
        );
    } else {
        println!("  GPIO:       disabled, bounce {} ms", config.gpio.bounce_time);
    }
    println!("  Buttons:");
    for button in &config.buttons {
        println!("    pin {:>3} -> {}", button.pin, button.file);
    }
    let control = &config.control;
    if control.socket_enabled {
        println!("  Socket:     {}:{}", control.bind_address, control.socket_port);
    }
    if control.http_enabled {
        println!("  HTTP:       http://{}:{}", control.bind_address, control.http_port);
    }
}

/// Resolves on SIGINT or SIGTERM and names the signal.
async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}

/// The first signal asks DaemonCore to shut down; a second one exits at once.
fn spawn_signal_listener(event_tx: mpsc::Sender<core::DaemonEvent>) {
    tokio::spawn(async move {
        let name = wait_for_signal().await;
        info!("Received {}, shutting down", name);
        let _ = event_tx.send(core::DaemonEvent::Shutdown).await;

        let name = wait_for_signal().await;
        warn!("Received {} again, exiting without cleanup", name);
        std::process::exit(130);
    });
}

#[cfg(feature = "gpio")]
fn input_sources(config: &Config) -> anyhow::Result<Vec<Box<dyn InputSource>>> {
    if !config.gpio.enabled {
        info!("GPIO disabled in configuration");
        return Ok(Vec::new());
    }
    let pins = config.buttons.iter().map(|b| b.pin);
    let gpio: Box<dyn InputSource> = Box::new(gpio::GpioInput::new(&config.gpio, pins)?);
    Ok(vec![gpio])
}

#[cfg(not(feature = "gpio"))]
fn input_sources(config: &Config) -> anyhow::Result<Vec<Box<dyn InputSource>>> {
    if config.gpio.enabled {
        warn!("Built without the gpio feature; presses arrive only over the socket and HTTP API");
    }
    Ok(Vec::new())
}

async fn run(
    config: Config,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> anyhow::Result<()> {
    let api = &config.moppy_api;
    let timeout = api.request_timeout();
    if timeout.is_none() {
        warn!("No request_timeout_ms configured; a hung Moppy API keeps its button busy");
    }

    let client = Arc::new(MoppyClient::new(&api.base_url, timeout)?);
    if !client.health_check().await {
        anyhow::bail!("Cannot connect to Moppy API at {}", client.base_url());
    }
    info!("Connected to Moppy API at {}", client.base_url());

    info!(
        mode = ?config.gpio.mode,
        pull = ?config.gpio.pull_up_down,
        bounce_ms = config.gpio.bounce_time,
        "GPIO settings"
    );

    let registry = ButtonRegistry::from_buttons(config.buttons.iter().cloned());
    let coordinator = Arc::new(PressCoordinator::new(client, registry));

    // Every input surface funnels into DaemonCore
    let (event_tx, event_rx) = mpsc::channel::<core::DaemonEvent>(256);
    let shutdown = CancellationToken::new();
    let control = &config.control;

    if control.socket_enabled {
        let _socket_handle = socket::start_server(
            control.bind_address.clone(),
            control.socket_port,
            socket::SocketContext {
                coordinator: coordinator.clone(),
                event_tx: event_tx.clone(),
                broadcast_tx: broadcast_tx.clone(),
                shutdown: shutdown.clone(),
            },
        );
    }

    if control.http_enabled {
        let _http_handle = http::start_server(
            control.bind_address.clone(),
            control.http_port,
            coordinator.clone(),
            event_tx.clone(),
            shutdown.clone(),
        );
    }

    let inputs = ActiveInputs::start(input_sources(&config)?, &event_tx)?;
    spawn_signal_listener(event_tx);

    info!(
        buttons = coordinator.registry().len(),
        "Button controller ready, waiting for presses"
    );
    // a press makes at most four requests
    let drain_grace = timeout.map_or(core::DEFAULT_DRAIN_GRACE, |t| t * 4);
    let daemon_core = core::DaemonCore::new(coordinator, config.gpio.bounce_window(), broadcast_tx)
        .with_drain_grace(drain_grace);
    let result = daemon_core.run(event_rx).await;

    drop(inputs);
    shutdown.cancel();
    info!("Shutdown complete");
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate().context("Invalid configuration")?;

    if cli.check {
        print_summary(&config);
        return Ok(());
    }

    // Created before logging so the broadcast layer can forward into it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);
    logging::init(&config.logging, broadcast_tx.clone())?;
    info!("Config loaded from: {:?}", cli.config);

    run(config, broadcast_tx).await
}
