//! ab-launcher - self-updating A/B application launcher
//!
//! The launcher is the durable, rarely-changing component installed on
//! client machines. Each run it refreshes the inactive slot from the update
//! host if a newer version is published, verifies the active slot's signed
//! manifest, starts the application under supervision, and falls back to
//! the other slot when the active one is corrupt. The child's exit code is
//! forwarded as the launcher's own.
//!
//! Status narration goes through a single watch channel consumed by one
//! long-lived task; there is no polling loop.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use launcher_core::config::LauncherConfig;
use launcher_core::orchestrator::Orchestrator;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Verification key baked in at build time. Configuration may override it
/// with `public_key_pem` or `public_key_path` for staging environments.
const DEFAULT_PUBLIC_KEY_PEM: &str = include_str!("../keys/dev_public.pem");

/// ab-launcher - self-updating application launcher
#[derive(Parser, Debug)]
#[command(name = "ab-launcher")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the launcher configuration file
    #[arg(short, long, default_value = "launcher.toml")]
    config: PathBuf,

    /// Override the base directory holding the slot state
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Override the update metadata URL
    #[arg(long)]
    update_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config = if args.config.exists() {
        LauncherConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = %args.config.display(), "no config file found, using defaults");
        LauncherConfig::default()
    };
    if let Some(base_path) = args.base_path {
        config.base_path = base_path;
    }
    if let Some(update_url) = args.update_url {
        config.update_info_url = update_url;
    }

    let public_key_pem = config
        .resolve_public_key_pem(DEFAULT_PUBLIC_KEY_PEM)
        .context("failed to read verification key")?;

    info!(
        base = %config.base_path.display(),
        update_url = %config.update_info_url,
        "launcher starting"
    );

    let (orchestrator, mut status) =
        Orchestrator::new(config, &public_key_pem).context("failed to initialize launcher")?;

    // Single long-lived status consumer: every phase of the run updates one
    // message, and the UI layer (here: the log) observes each change.
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let message = status.borrow_and_update().clone();
            info!(status = %message);
        }
    });

    match orchestrator.run().await {
        Ok(mut handle) => {
            info!(pid = handle.pid(), "application running");
            let code = handle.wait().await;
            info!(code, "application exited; forwarding exit code");
            std::process::exit(code);
        },
        Err(e) => {
            error!(error = %e, "launcher failed");
            Err(e.into())
        },
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}
