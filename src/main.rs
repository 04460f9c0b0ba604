//! Fleetwatch
//!
//! Starts a fleet of services in dependency order and collects their metrics.
//!
//! ```text
//! fleetwatch --config fleet.yaml run        # bring up and collect
//! fleetwatch --config fleet.yaml check      # validate and print start order
//! fleetwatch --config fleet.yaml probe web  # run one health probe
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetwatch::config::{format_duration, FleetConfig};
use fleetwatch::health::{probe_for, probe_with_deadline};
use fleetwatch::{Fleet, FleetOptions, ServiceGraph};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Fleetwatch - health-gated fleet startup and metrics collection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fleet configuration file
    #[arg(short, long, env = "FLEETWATCH_CONFIG", default_value = "fleet.yaml")]
    config: PathBuf,

    /// Control/query server bind address
    #[arg(long, env = "FLEETWATCH_LISTEN", default_value = "0.0.0.0:9090")]
    listen: SocketAddr,

    /// Container runtime CLI used for image and build services
    #[arg(long, env = "FLEETWATCH_RUNTIME", default_value = "docker")]
    runtime: String,

    /// Stop launched services on shutdown
    #[arg(long, env = "FLEETWATCH_TEARDOWN")]
    teardown: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the fleet and collect metrics until interrupted
    Run,
    /// Validate the configuration and print the start order
    Check,
    /// Run one health probe for a service
    Probe {
        /// Service name
        service: String,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = FleetConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Some(Command::Check) => check(&config),
        Some(Command::Probe { ref service }) => probe(&config, service).await,
        Some(Command::Run) | None => run(&args, config).await,
    }
}

async fn run(args: &Args, config: FleetConfig) -> anyhow::Result<()> {
    info!("Starting Fleetwatch");
    info!("  Config: {}", args.config.display());
    info!("  Services: {}", config.services.len());
    info!("  Scrape targets: {}", config.scrape_targets.len());
    info!("  Retention: {}", format_duration(config.global.retention));
    info!("  Runtime: {}", args.runtime);

    let fleet = Fleet::new(
        config,
        FleetOptions {
            config_path: Some(args.config.clone()),
            listen: Some(args.listen),
            runtime: args.runtime.clone(),
            teardown: args.teardown,
        },
    );

    let cancel = fleet.cancellation();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        cancel.cancel();
    });

    fleet.run().await?;
    info!("Shutdown complete");
    Ok(())
}

fn check(config: &FleetConfig) -> anyhow::Result<()> {
    let graph = ServiceGraph::new(&config.services)?;
    let order = graph.start_order()?;

    println!("Configuration OK");
    println!("Start order:");
    for (i, name) in order.iter().enumerate() {
        let deps = config
            .service(name)
            .map(|spec| spec.depends_on.join(", "))
            .unwrap_or_default();
        if deps.is_empty() {
            println!("  {}. {}", i + 1, name);
        } else {
            println!("  {}. {} (after {})", i + 1, name, deps);
        }
    }
    for target in &config.scrape_targets {
        println!(
            "Scrape {} at {} every {}",
            target.job,
            target.url(),
            format_duration(target.effective_interval(&config.global))
        );
    }
    Ok(())
}

async fn probe(config: &FleetConfig, service: &str) -> anyhow::Result<()> {
    let Some(spec) = config.service(service) else {
        bail!("service {} is not declared", service);
    };
    let Some(check) = &spec.healthcheck else {
        println!("{} has no health check; it is healthy once launched", service);
        return Ok(());
    };

    let probe = probe_for(&check.probe)?;
    let timeout: Duration = check.timeout;
    let outcome = probe_with_deadline(probe.as_ref(), service, timeout).await;
    println!("{}: {}", service, outcome.label());
    outcome.into_result(service, timeout)?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
