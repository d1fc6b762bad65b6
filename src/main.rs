use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

mod config;
mod error;
mod filter;
mod message;
mod milter;
mod policy;
mod rewrite;
mod session;
mod stages;
mod transaction;

use config::{ConfigSource, Overrides};
use filter::ForwardMilter;
use milter::MilterServer;
use policy::HttpPolicyClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket path for milter communication
    #[arg(long, env = "FORWARD_MILTER_SOCKET", default_value = "/var/run/forwardmilter/forward.sock")]
    socket: PathBuf,

    /// JSON config file with the policy endpoints
    #[arg(long, env = "FORWARD_MILTER_CONFIG")]
    config: Option<PathBuf>,

    /// Endpoint answering whether a recipient exists (overrides the config file)
    #[arg(long, env = "CHECK_EMAIL_URL")]
    check_email_url: Option<String>,

    /// Endpoint deciding whether a message is forwarded (overrides the config file)
    #[arg(long, env = "FORWARD_PARAMS_URL")]
    forward_params_url: Option<String>,

    /// Timeout for a single policy request, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// How often to check the config file for changes, in seconds (0 disables reloading)
    #[arg(long, env = "RELOAD_INTERVAL_SECS", default_value = "30")]
    reload_interval_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Starting Forward Milter");
    info!("Socket: {:?}", args.socket);

    let source = ConfigSource::new(
        args.config.clone(),
        Overrides {
            check_email_url: args.check_email_url.clone(),
            forward_params_url: args.forward_params_url.clone(),
            request_timeout_secs: args.request_timeout_secs,
        },
    );
    let policy_config = source.load().context("Invalid configuration")?;
    info!("Check email URL: {}", policy_config.check_email_url);
    info!("Forward params URL: {}", policy_config.forward_params_url);

    let (config_tx, config_rx) = watch::channel(policy_config);
    if args.reload_interval_secs > 0 {
        let interval = Duration::from_secs(args.reload_interval_secs);
        if config::spawn_reloader(source, config_tx, interval).is_none() {
            info!("No config file given, endpoint reloading disabled");
        }
    }

    let policy = HttpPolicyClient::new(config_rx).context("Failed to set up policy client")?;

    // Ensure socket directory exists
    if let Some(socket_dir) = args.socket.parent() {
        fs::create_dir_all(socket_dir)
            .with_context(|| format!("Failed to create socket directory: {:?}", socket_dir))?;
    }

    // Remove existing socket
    if args.socket.exists() {
        fs::remove_file(&args.socket)
            .with_context(|| format!("Failed to remove existing socket: {:?}", args.socket))?;
    }

    let milter = ForwardMilter::new(Arc::new(policy));
    let server = MilterServer::new(milter);

    info!("Forward Milter started successfully");

    let socket_path = args.socket.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cleaning up...");
            if socket_path.exists() {
                let _ = fs::remove_file(&socket_path);
            }
            std::process::exit(0);
        }
    });

    server.run(&args.socket).await
        .context("Failed to run milter server")?;

    Ok(())
}
