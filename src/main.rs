//! Blight - session daemon for e-ink tablets
//!
//! Owns the framebuffer and composites client surfaces onto it, forwards
//! input to the focused client, and supervises client processes, pausing
//! and resuming them on request. Clients find the daemon over D-Bus.

mod channel;
mod compositor;
mod config;
mod dbus;
mod input;
mod session;
mod supervisor;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::compositor::{Dispatcher, SurfaceRegistry};
use crate::config::Config;
use crate::session::Session;
use crate::supervisor::{AckRouter, OsProcessControl, Supervisor};

const USAGE: &str = "\
Usage: blight [OPTIONS]

Options:
  -c, --config <PATH>  Read configuration from PATH
      --system         Serve on the system bus
      --session        Serve on the session bus
  -h, --help           Print this help";

struct Args {
    config: Option<PathBuf>,
    system: Option<bool>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config: None,
        system: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--system" => args.system = Some(true),
            "--session" => args.system = Some(false),
            "-h" | "--help" => return Ok(None),
            other => anyhow::bail!("Unknown argument {:?}\n\n{}", other, USAGE),
        }
    }
    Ok(Some(args))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "blight=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(args) = parse_args()? else {
        println!("{}", USAGE);
        return Ok(());
    };

    info!("Starting Blight session daemon");

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let system = args.system.unwrap_or(config.bus.system);

    // Acknowledgement handlers go in before any child exists
    let acks = AckRouter::new();
    let _listener = acks
        .listen()
        .context("Failed to install acknowledgement handlers")?;

    let (framebuffer, driver) = compositor::open_display(&config.display)?;
    let registry = Arc::new(Mutex::new(SurfaceRegistry::new()));
    let dispatcher = Dispatcher::start(registry, framebuffer, driver)
        .context("Failed to start compositor thread")?;

    let (supervisor, finished) =
        Supervisor::new(config.supervisor.clone(), Arc::new(OsProcessControl), acks)
            .context("Failed to start exit watcher")?;
    let devices = config.input.devices.clone();
    let session = Session::new(config, dispatcher, supervisor, finished);

    let _conn = dbus::serve(session.clone(), system).await?;
    let readers = input::spawn_readers(&session, &devices);

    // Handle SIGTERM and SIGINT
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    if shutdown_rx.recv().await.is_none() {
        error!("Signal handler stopped unexpectedly");
    }

    for reader in readers {
        reader.abort();
    }
    session.shutdown().await;
    info!("Blight stopped");
    Ok(())
}
