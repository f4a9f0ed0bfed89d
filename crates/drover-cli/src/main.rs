//! Drover - control plane CLI
//!
//! Runs the control listener for agent notifications and drives agents from the command
//! line: status queries and confirmed stops.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{build_settings, load_config_file, Overrides, Settings};
use drover_control::{ControlPlane, ControlSender, ServerState, StopOutcome};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Control plane for agent-managed backend servers", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Communications port used by agents and the listener
    #[arg(long, global = true, env = "DROVER_PORT")]
    port: Option<u16>,

    /// Shared key (16, 24 or 32 bytes)
    #[arg(long, global = true, env = "DROVER_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control listener until Ctrl+C
    Serve,
    /// Ask an agent whether its server is running
    Status {
        /// Server address
        #[arg(long)]
        server: IpAddr,
    },
    /// Stop a server and wait for its agent to confirm
    Stop {
        /// Server address
        #[arg(long)]
        server: IpAddr,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Some(load_config_file(path)?)
        }
        None => None,
    };

    build_settings(
        file,
        Overrides {
            port: cli.port,
            key: cli.key.clone(),
        },
    )
}

async fn serve(settings: Settings) -> Result<()> {
    let registry = settings.registry()?;
    let listen_addr = settings.control.listen_addr();
    let plane = ControlPlane::new(settings.control, registry);

    let listener = plane
        .listen(listen_addr)
        .await
        .context("Failed to start control listener")?;
    info!(servers = plane.registry().count(), "Control plane running");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = listener.run() => {
            error!("Control listener exited");
        }
    }

    Ok(())
}

async fn status(settings: Settings, server: IpAddr) -> Result<()> {
    let sender = ControlSender::from_config(&settings.control);
    if sender.is_running(server).await {
        println!("{}: {}", server, ServerState::Started);
    } else {
        println!("{}: not running", server);
    }
    Ok(())
}

async fn stop(settings: Settings, server: IpAddr) -> Result<()> {
    let registry = settings.registry()?;
    if registry.get(&server).is_none() {
        info!(server = %server, "Server not in configuration, registering as started");
        registry.register(server, ServerState::Started, true);
    }

    let listen_addr = settings.control.listen_addr();
    let plane = ControlPlane::new(settings.control, registry);

    // The confirmation arrives through the listener
    let listener = plane
        .listen(listen_addr)
        .await
        .context("Failed to start control listener")?;
    let listener_task = tokio::spawn(listener.run());

    let outcome = plane
        .stop_server(server)
        .await
        .with_context(|| format!("Failed to stop server {}", server));
    listener_task.abort();

    match outcome? {
        StopOutcome::Confirmed => println!("{}: stopped", server),
        StopOutcome::TimedOut => {
            println!("{}: no confirmation before timeout", server);
        }
        StopOutcome::Abandoned => println!("{}: stop abandoned", server),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let settings = load_settings(&cli).context("Failed to build configuration")?;

    match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Status { server } => status(settings, server).await,
        Commands::Stop { server } => stop(settings, server).await,
    }
}
