use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LogFormat, LoggingSettings, RatekeeperConfig};
use ratekeeper::maintenance::{emit_stats, MaintenanceHandle};
use ratekeeper::ratelimit::{ConfigRegistry, RateLimiter};
use ratekeeper::store::InMemoryStore;

/// Ratekeeper rate limiting engine.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML); RATEKEEPER__* environment variables override it
    #[arg(long, global = true)]
    config: Option<String>,

    /// Rules file overriding the named rate limit types
    #[arg(long, global = true)]
    rules: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run checks for a named type and print each result as JSON
    Check {
        /// Named rate limit type, e.g. `api` or `login`
        #[arg(long = "type")]
        kind: String,

        /// Identifier the limit applies to, e.g. a user id or IP address
        #[arg(long)]
        identifier: String,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        requests: u32,

        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Print the registered rate limit types
    Types,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper");

    let registry: ConfigRegistry = match cli.rules.as_deref().or(config.rules_path.as_deref()) {
        Some(path) => ConfigRegistry::from_file(path)?,
        None => ConfigRegistry::with_defaults(),
    };

    match cli.command {
        Command::Types => {
            for name in registry.names() {
                let rule = registry.get(name)?;
                println!(
                    "{}",
                    serde_json::json!({
                        "type": name,
                        "algorithm": rule.algorithm,
                        "limit": rule.limit,
                        "window": rule.window,
                        "burst": rule.burst,
                        "refill_rate": rule.refill_rate,
                    })
                );
            }
        }
        Command::Check {
            kind,
            identifier,
            requests,
            interval_ms,
        } => {
            // Validate the type before starting anything
            registry.get(&kind)?;

            let store = Arc::new(InMemoryStore::new());
            let limiter =
                Arc::new(RateLimiter::new(store).with_settings(config.limiter.clone()));
            info!(instance = %limiter.instance_id(), "Rate limiter initialized");

            let maintenance =
                MaintenanceHandle::from_settings(limiter.clone(), &config.maintenance);

            let run = async {
                for i in 0..requests {
                    if i > 0 && interval_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    }
                    let result = registry
                        .check_by_type(&limiter, &kind, &identifier, &())
                        .await?;
                    println!("{}", serde_json::to_string(&result)?);
                }
                anyhow::Ok(())
            };

            tokio::select! {
                result = run => result?,
                _ = shutdown_signal() => warn!("Interrupted before all checks ran"),
            }

            emit_stats(&limiter);
            maintenance.shutdown().await;
        }
    }

    info!("Ratekeeper stopped");
    Ok(())
}

/// Install the global tracing subscriber; logs go to stderr so stdout stays JSON.
fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match settings.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
