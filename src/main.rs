use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tokio::signal;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::{gated, Limiter, LimiterCell, TollgateError};

/// The one limiter this process shares across all callers.
static LIMITER: LimiterCell = LimiterCell::new();

/// Fire a burst of simulated remote calls through a shared rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Requests admitted per window (overrides the configuration)
    #[arg(long)]
    capacity: Option<u32>,

    /// Window length in milliseconds (overrides the configuration)
    #[arg(long)]
    window_ms: Option<u64>,

    /// Number of simulated calls to issue at once
    #[arg(short, long, default_value_t = 25)]
    requests: usize,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Outcome of a burst, printed as JSON when the run ends.
#[derive(Debug, Serialize)]
struct BurstSummary {
    requests: usize,
    admitted: usize,
    rejected: usize,
    capacity: u32,
    window_ms: u128,
    refills: u64,
    elapsed_ms: u128,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load_unvalidated(cli.config.as_deref())?;
    if let Some(capacity) = cli.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(window_ms) = cli.window_ms {
        config.limiter.window_ms = window_ms;
    }
    if cli.json_logs {
        config.logging.format = LogFormat::Json;
    }
    config.validate()?;

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter = LIMITER.get_or_init(&config.limiter)?;
    info!(
        capacity = limiter.capacity(),
        window = ?limiter.window(),
        requests = cli.requests,
        "Issuing burst"
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..cli.requests)
        .map(|id| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                gated(limiter.as_ref(), || simulated_remote_call(id, started)).await
            })
        })
        .collect();

    let burst = join_all(handles);
    tokio::pin!(burst);

    let results = tokio::select! {
        results = &mut burst => results,
        _ = shutdown_signal() => {
            // Pending callers are released with a closed error.
            limiter.shutdown().await;
            burst.await
        }
    };

    let mut admitted = 0;
    let mut rejected = 0;
    for result in results {
        match result? {
            Ok(_) => admitted += 1,
            Err(TollgateError::Closed) => rejected += 1,
            Err(e) => return Err(e.into()),
        }
    }

    let summary = summarize(&limiter, cli.requests, admitted, rejected, started.elapsed());
    limiter.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Tollgate stopped");
    Ok(())
}

/// Stand-in for the remote service client: records when the call got through.
async fn simulated_remote_call(id: usize, started: Instant) -> Duration {
    let elapsed = started.elapsed();
    info!(request = id, elapsed_ms = elapsed.as_millis() as u64, "Request admitted");
    elapsed
}

fn summarize(
    limiter: &Arc<Limiter>,
    requests: usize,
    admitted: usize,
    rejected: usize,
    elapsed: Duration,
) -> BurstSummary {
    if rejected > 0 {
        warn!(rejected = rejected, "Some requests were rejected by shutdown");
    }

    BurstSummary {
        requests,
        admitted,
        rejected,
        capacity: limiter.capacity(),
        window_ms: limiter.window().as_millis(),
        refills: limiter.refill_count(),
        elapsed_ms: elapsed.as_millis(),
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
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
            info!("Received Ctrl+C, shutting down limiter");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down limiter");
        }
    }
}
