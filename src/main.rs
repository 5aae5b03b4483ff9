use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use admission::admission::{AdmissionControl, Dispatcher, EntityId, PolicyTable, RateLimits, Rejection};
use admission::config::AdmissionConfig;

#[derive(Debug, Parser)]
#[command(name = "admission", version, about = "Per-principal message admission control")]
struct Cli {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate limits file, replacing the limits from the configuration
    #[arg(long)]
    rate_limits: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the rate limits and print the resolved policies
    Check,
    /// Push a burst of messages through admission control
    Simulate {
        /// Principal the simulated entities declare
        #[arg(long)]
        principal: Option<String>,
        /// Number of entities sharing the principal
        #[arg(long, default_value_t = 1)]
        entities: usize,
        /// Messages submitted per entity
        #[arg(long, default_value_t = 10)]
        messages: usize,
        /// Interval between metrics reports in milliseconds
        #[arg(long, default_value_t = 500)]
        report_ms: u64,
    },
}

/// Dispatcher that logs every decision.
#[derive(Default)]
struct LoggingDispatcher {
    forwarded: AtomicU64,
}

#[async_trait]
impl Dispatcher<String> for LoggingDispatcher {
    async fn forward(&self, entity: &EntityId, message: String) {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        debug!(entity = %entity, message = %message, "Message forwarded");
    }

    async fn reject(&self, entity: &EntityId, rejection: Rejection) {
        warn!(entity = %entity, reason = %rejection, "Entity rejected");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AdmissionConfig::load(cli.config.as_deref())?;
    if let Some(path) = &cli.rate_limits {
        config.rate_limits = RateLimits::from_file(path)?;
    }

    init_tracing(
        cli.log_level.as_deref().unwrap_or(&config.logging.level),
        cli.json_logs || config.logging.json,
    );
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policies = config.policy_table()?;
    info!(
        explicit = policies.explicit().len(),
        aggregate_default = ?policies.aggregate_default(),
        "Rate limits loaded"
    );

    match cli.command {
        Command::Check => check(&policies)?,
        Command::Simulate {
            principal,
            entities,
            messages,
            report_ms,
        } => {
            simulate(
                policies,
                principal,
                entities,
                messages,
                Duration::from_millis(report_ms.max(1)),
            )
            .await?
        }
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn check(policies: &PolicyTable) -> anyhow::Result<()> {
    let mut resolved = serde_json::Map::new();
    for (principal, policy) in policies.explicit() {
        resolved.insert(principal.to_string(), serde_json::to_value(policy)?);
    }

    let report = serde_json::json!({
        "limits": resolved,
        "aggregate_default": policies.aggregate_default(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn simulate(
    policies: PolicyTable,
    principal: Option<String>,
    entities: usize,
    messages: usize,
    report_every: Duration,
) -> anyhow::Result<()> {
    let dispatcher = Arc::new(LoggingDispatcher::default());
    let control: AdmissionControl<String, LoggingDispatcher> =
        AdmissionControl::new(policies, Arc::clone(&dispatcher));

    let ids: Vec<EntityId> = (0..entities).map(|_| EntityId::random()).collect();
    for id in &ids {
        control.on_entity_registered(id.clone(), principal.clone())?;
    }

    let mut admitted = 0u64;
    for n in 0..messages {
        for id in &ids {
            match control.submit(id, format!("message-{}", n)) {
                Ok(_) => admitted += 1,
                Err(e) => warn!(entity = %id, error = %e, "Message refused"),
            }
        }
    }
    info!(admitted = admitted, entities = ids.len(), "Burst submitted");

    let mut report = tokio::time::interval(report_every);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => {
                println!("{}", control.metrics().to_json()?);
                if dispatcher.forwarded.load(Ordering::SeqCst) >= admitted {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    for id in &ids {
        control.on_entity_removed(id)?;
    }
    control.shutdown();
    info!("Simulation finished");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
