mod bus_commands;
mod config_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use potat_config::PotatConfig;

#[derive(Parser)]
#[command(name = "potat", about = "Potat relay: message bus to WebSocket fan-out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of the standard locations.
    #[arg(long, global = true, env = "POTAT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory searched for `potat.{toml,yaml,yml,json}`.
    #[arg(long, global = true, env = "POTAT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay: socket server, bus bridge and rate limiter.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Publish one raw payload on a bus subject.
    Publish {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        payload: String,
    },
    /// Send one JSON job request over the bus and print the reply.
    Request {
        /// JSON payload; anything that is not valid JSON is sent as a string.
        #[arg(long)]
        payload: String,
        /// Seconds to wait for the reply (defaults to `broker.request_timeout_secs`).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<PotatConfig> {
    if let Some(dir) = &cli.config_dir {
        potat_config::set_config_dir(dir.clone());
    }
    match &cli.config {
        Some(path) => potat_config::load_config(path),
        None => Ok(potat_config::discover_and_load()),
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to bind SIGTERM, listening for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                },
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = load(&cli)?;

    match cli.command {
        Commands::Gateway { bind, port } => {
            info!(version = env!("CARGO_PKG_VERSION"), "potat starting");
            if let Some(bind) = bind {
                config.socket.bind = bind;
            }
            if let Some(port) = port {
                config.socket.port = port;
            }
            let shutdown = CancellationToken::new();
            spawn_signal_listener(shutdown.clone());
            potat_gateway::start_gateway(config, shutdown).await
        },
        Commands::Publish { subject, payload } => {
            bus_commands::publish(&config, &subject, payload).await
        },
        Commands::Request {
            payload,
            timeout_secs,
        } => bus_commands::request(&config, &payload, timeout_secs).await,
        Commands::Config { action } => config_commands::handle_config(action, &config),
    }
}
