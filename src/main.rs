use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{AdmissionService, Descriptor, RuleCatalog};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Parser)]
#[command(name = "tollgate", version, about = "Evaluate requests against rate limit rules")]
struct Cli {
    /// Service configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Rule file; overrides `rules_path` from the configuration
    #[arg(short, long, global = true)]
    rules: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate one request, optionally several times in a row
    Check {
        #[command(flatten)]
        request: RequestArgs,

        /// Number of consecutive evaluations
        #[arg(short = 'n', long, default_value_t = 1)]
        repeat: u32,
    },
    /// Send a steady stream of identical requests until interrupted
    Simulate {
        #[command(flatten)]
        request: RequestArgs,

        /// Requests per second
        #[arg(long, default_value_t = 10)]
        rate: u64,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Seconds between idle bucket sweeps
        #[arg(long, default_value_t = 30)]
        sweep_interval_secs: u64,
    },
}

#[derive(Args)]
struct RequestArgs {
    /// Request descriptor as key=value; repeat for each attribute
    #[arg(short, long = "descriptor", value_parser = parse_descriptor)]
    descriptors: Vec<Descriptor>,

    /// Tokens charged per request
    #[arg(long, default_value_t = 1)]
    hits: u64,
}

fn parse_descriptor(raw: &str) -> Result<Descriptor, String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty descriptor key in '{}'", raw));
    }
    Ok(Descriptor::new(key, value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let service = Arc::new(build_service(&cli)?);

    match cli.command {
        Command::Check { request, repeat } => {
            for _ in 0..repeat {
                let result = service.evaluate_hits(
                    &service.settings().domain_priority,
                    &request.descriptors,
                    request.hits,
                )?;
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Command::Simulate {
            request,
            rate,
            duration_secs,
            sweep_interval_secs,
        } => {
            ensure!(sweep_interval_secs > 0, "--sweep-interval-secs must be positive");
            simulate(
                Arc::clone(&service),
                request,
                request_period(rate)?,
                duration_secs.map(Duration::from_secs),
                Duration::from_secs(sweep_interval_secs),
            )
            .await?;
        }
    }

    println!("{}", serde_json::to_string(&service.stats())?);
    Ok(())
}

/// Interval between simulated requests sent at `rate` per second.
fn request_period(rate: u64) -> anyhow::Result<Duration> {
    ensure!(rate > 0, "--rate must be positive");
    ensure!(
        rate <= NANOS_PER_SECOND,
        "--rate must be at most {} requests per second",
        NANOS_PER_SECOND
    );
    Ok(Duration::from_nanos(NANOS_PER_SECOND / rate))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_service(cli: &Cli) -> anyhow::Result<AdmissionService> {
    let config = TollgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(
        priority = ?config.admission.domain_priority,
        burst_floor = config.admission.minimum_burst_floor,
        precise_refill = config.admission.precise_refill,
        "Configuration loaded"
    );

    let catalog = match cli.rules.as_deref().or(config.rules_path.as_deref()) {
        Some(path) => RuleCatalog::from_file(path)
            .with_context(|| format!("loading rules from {}", path))?,
        None => {
            info!("No rule file configured, using built-in rules");
            RuleCatalog::builtin()
        }
    };

    Ok(AdmissionService::new(Arc::new(catalog), config.admission))
}

async fn simulate(
    service: Arc<AdmissionService>,
    request: RequestArgs,
    period: Duration,
    duration: Option<Duration>,
    sweep_every: Duration,
) -> anyhow::Result<()> {
    let mut requests = tokio::time::interval(period);
    let mut sweeps = tokio::time::interval(sweep_every);
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    let shutdown = shutdown_signal();
    tokio::pin!(deadline, shutdown);

    info!(period = ?period, "Starting simulated request stream");

    loop {
        tokio::select! {
            _ = requests.tick() => {
                let result = service.evaluate_hits(
                    &service.settings().domain_priority,
                    &request.descriptors,
                    request.hits,
                )?;
                println!("{}", serde_json::to_string(&result)?);
            }
            _ = sweeps.tick() => {
                service.sweep_idle();
            }
            _ = &mut deadline => {
                info!("Simulation finished");
                break;
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, stopping simulation");
                break;
            }
        }
    }

    Ok(())
}

/// Wait for Ctrl+C.
async fn shutdown_signal() {
    if signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
