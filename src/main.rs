use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::FailoverLimiter;

/// Administrative front end for the Turnstile rate limiter.
#[derive(Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report availability, active flag, and health per backend
    Status,
    /// Run a read/write round trip against every backend
    Test,
    /// Check whether a key is currently limited (records the request)
    Check {
        /// Throttled subject, e.g. "ip:1.2.3.4"
        #[arg(long)]
        key: String,
        /// Override the configured request limit
        #[arg(long)]
        max: Option<u64>,
        /// Override the configured window in seconds
        #[arg(long)]
        window: Option<u64>,
    },
    /// Drop every observation for a key
    Reset {
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => TurnstileConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path, e))?,
        None => TurnstileConfig::default(),
    };

    let max_requests = config.limiter.max_requests;
    let window_secs = config.limiter.time_window_secs;
    let limiter = FailoverLimiter::new(&config).await;
    info!(
        storage = ?limiter.active_storage().map(|k| k.to_string()),
        "Rate limiter initialized"
    );

    match cli.command {
        Command::Status => {
            let status = limiter.storage_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Test => {
            let report = limiter.test_all_storages().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Check { key, max, window } => {
            let max = max.unwrap_or(max_requests);
            let window = window.unwrap_or(window_secs);
            let limited = limiter.is_limited_with(&key, max, window).await;
            let info = limiter.info_with(&key, max, window).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "limited": limited,
                    "info": info,
                }))?
            );
        }
        Command::Reset { key } => {
            let ok = limiter.reset(&key).await;
            println!("{}", serde_json::json!({ "reset": ok }));
        }
    }

    Ok(())
}
