use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod actors;
mod bus;
mod state;

use actors::Actor;
use bus::BusSender;
use novadrill::{NovaMessage, TransportKind};
use state::SystemState;

#[derive(Parser, Debug, Clone)]
#[command(name = "novadrill", about = "Drill controller for the Nova table tennis robot")]
struct Config {
    /// Config file path (default: ~/.config/novadrill/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the simulated robot instead of Bluetooth
    #[arg(long)]
    mock: bool,

    /// Connect to the robot on start
    #[arg(long)]
    connect: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("novadrill=info,novadrill_app=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("debug logging enabled");

    let cli = Config::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(state::config::default_config_path);

    let rt = tokio::runtime::Runtime::new()?;
    let _guard = rt.enter();

    // Single unified bus
    let (bus_tx, _) = broadcast::channel::<NovaMessage>(1024);

    // Build shared state root (loads or creates the config file)
    let (system_state, stats_writer) = SystemState::new(&config_path);
    let state = Arc::new(system_state);

    // CLI overrides are written through so the robot actor's reconfigure
    // check compares against the section it was built with.
    if cli.mock || cli.connect {
        state.system.update(|c| {
            if cli.mock {
                c.robot.transport = TransportKind::Mock;
            }
            if cli.connect {
                c.robot.auto_connect = true;
            }
        });
    }

    // System actor: config commands and statistics.
    // Must be fully up before other actors start so no bus events are missed.
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let sender = BusSender::new("system".into(), bus_tx.clone(), Arc::clone(&shutdown));
        let receiver = sender.subscribe();
        let (actor, ready_rx) =
            actors::system::SystemActor::new(stats_writer, Arc::clone(&state), bus_tx.clone());
        actor.start(Arc::clone(&state), sender, receiver);
        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("system actor failed to start"))?;
        state.register_actor("system".into(), Box::new(actor), shutdown);
    }

    // Start all actors from config (robot, webservers)
    let snap = state.system.snapshot();
    for ra in actors::resolve_actors(&snap) {
        tracing::info!("starting actor '{}' ({})", ra.id, ra.name);
        actors::start_actor(ra.id, ra.actor, &state, &bus_tx);
    }

    // Drain bus (keeps broadcast channel healthy when no other subscriber)
    let mut drain_rx = bus_tx.subscribe();
    let drain_handle = tokio::spawn(async move {
        loop {
            match drain_rx.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("drain subscriber lagged, dropped {n} events");
                }
            }
        }
    });

    rt.block_on(async { tokio::signal::ctrl_c().await })?;

    // Shutdown: stop all actors via registry. The robot halts the motors
    // and closes the link on its own thread.
    tracing::info!("shutting down...");
    for id in state.actor_ids() {
        state.stop_actor(&id);
    }
    // Drop bus_tx closes the broadcast channel as secondary signal
    drop(bus_tx);
    drain_handle.abort();

    // Give the robot thread a moment to send the stop packet.
    std::thread::sleep(std::time::Duration::from_millis(500));

    Ok(())
}
