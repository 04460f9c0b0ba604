//! Fleet runtime
//!
//! Wires the pieces together:
//!
//! ```text
//! DependencyOrchestrator ──events──▶ collector gate ──▶ ScrapeScheduler
//!        │                                                  │ ScrapeBatch
//!        ▼                                                  ▼
//! ServiceHealthMonitor                              TimeSeriesStore ◀── control server
//! ```
//!
//! Every background task runs under a child of one root cancellation token.
//! Cancelling the root (Ctrl-C) stops scraping, probing, ingestion and
//! eviction, then optionally tears launched services down in reverse order.
//!
//! A failed startup does not stop anything: services already up keep being
//! monitored and scraped, the failure is reported on `/api/v1/status`, and
//! [`Fleet::run_with`] returns it once the root token is cancelled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{format_duration, FleetConfig};
use crate::error::{Error, Result};
use crate::health::ServiceHealthMonitor;
use crate::orchestrator::{
    DependencyOrchestrator, Launcher, RuntimeLauncher, ServiceGraph, StartOrder, StartupEvent,
};
use crate::scrape::{HttpScraper, ScrapeScheduler, Scraper};
use crate::server;
use crate::store::TimeSeriesStore;

/// Capacity of the scheduler → store channel, in batches
const INGEST_BUFFER: usize = 256;

// =============================================================================
// Collector
// =============================================================================

/// The embedded collector: scheduler plus store, and the configuration they
/// were last started with.
pub struct Collector {
    store: Arc<TimeSeriesStore>,
    scheduler: Arc<ScrapeScheduler>,
    config: RwLock<Arc<FleetConfig>>,
    config_path: Option<PathBuf>,
    /// Serializes starting the scheduler against applying a new config
    lifecycle: AsyncMutex<()>,
    startup_error: RwLock<Option<String>>,
}

impl Collector {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        scheduler: Arc<ScrapeScheduler>,
        config: FleetConfig,
        config_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            config: RwLock::new(Arc::new(config)),
            config_path,
            lifecycle: AsyncMutex::new(()),
            startup_error: RwLock::new(None),
        })
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<ScrapeScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> Arc<FleetConfig> {
        self.config.read().clone()
    }

    /// Scraping has begun
    pub fn is_ready(&self) -> bool {
        self.scheduler.is_started()
    }

    /// Why fleet startup failed, if it did
    pub fn startup_error(&self) -> Option<String> {
        self.startup_error.read().clone()
    }

    pub fn record_startup_failure(&self, error: &Error) {
        *self.startup_error.write() = Some(error.to_string());
    }

    /// Start pulling every configured target
    pub async fn start_scraping(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let config = self.config();
        info!(
            "Starting collection of {} targets",
            config.scrape_targets.len()
        );
        self.scheduler
            .start(config.scrape_targets.clone(), config.global.clone())
            .await;
    }

    /// Re-read the configuration file and apply it
    pub async fn reload(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| Error::Config("no configuration file to reload".to_string()))?;
        let config = FleetConfig::load(path)?;
        self.apply(config).await
    }

    /// Apply a validated configuration: new retention first, then the new
    /// target set. A rejected retention leaves everything as it was.
    #[instrument(skip_all)]
    pub async fn apply(&self, config: FleetConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.store.reload(config.global.retention)?;

        let config = Arc::new(config);
        *self.config.write() = config.clone();

        if self.scheduler.is_started() {
            self.scheduler
                .reload(config.scrape_targets.clone(), config.global.clone())
                .await;
        }
        info!(
            "Configuration applied: {} targets, retention {}",
            config.scrape_targets.len(),
            format_duration(config.global.retention)
        );
        Ok(())
    }
}

// =============================================================================
// Fleet
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct FleetOptions {
    /// Configuration file, used again by `POST /-/reload`
    pub config_path: Option<PathBuf>,
    /// Control/query server address; no server when unset
    pub listen: Option<SocketAddr>,
    /// Container runtime CLI
    pub runtime: String,
    /// Stop launched services on shutdown
    pub teardown: bool,
}

pub struct Fleet {
    config: FleetConfig,
    options: FleetOptions,
    cancel: CancellationToken,
}

impl Fleet {
    pub fn new(config: FleetConfig, options: FleetOptions) -> Self {
        Self {
            config,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Root token; cancelling it shuts the fleet down
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run with the container runtime launcher and the HTTP scraper
    pub async fn run(self) -> Result<()> {
        let launcher = Arc::new(RuntimeLauncher::new(self.options.runtime.clone()));
        let scraper = Arc::new(HttpScraper::new()?);
        self.run_with(launcher, scraper).await
    }

    /// Run until the root token is cancelled. A startup failure is returned
    /// only then; until cancellation the healthy part of the fleet keeps
    /// running.
    pub async fn run_with(
        self,
        launcher: Arc<dyn Launcher>,
        scraper: Arc<dyn Scraper>,
    ) -> Result<()> {
        let Fleet {
            config,
            options,
            cancel,
        } = self;

        let graph = ServiceGraph::new(&config.services)?;
        graph.topological_order()?;

        let listener = match options.listen {
            Some(addr) => Some(server::bind(addr).await?),
            None => None,
        };

        // Collector
        let store = Arc::new(TimeSeriesStore::new(config.global.retention)?);
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_BUFFER);
        let ingest = tokio::spawn(store.clone().run_ingest(ingest_rx, cancel.child_token()));
        let retention = tokio::spawn(
            store
                .clone()
                .run_retention(config.global.eviction_interval, cancel.child_token()),
        );

        let scheduler = ScrapeScheduler::new(scraper, ingest_tx, cancel.child_token());
        let collector = Collector::new(
            store,
            scheduler.clone(),
            config.clone(),
            options.config_path.clone(),
        );

        let server = listener.map(|listener| {
            tokio::spawn(server::serve(listener, collector.clone(), cancel.child_token()))
        });

        // Orchestrator
        let monitor = ServiceHealthMonitor::with_cancellation(cancel.child_token());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator = DependencyOrchestrator::new(launcher, monitor.clone(), config.global.clone())
            .with_events(events_tx);

        let gate = tokio::spawn(collector_gate(
            config.collector.service.clone(),
            events_rx,
            collector.clone(),
            cancel.child_token(),
        ));

        let outcome = tokio::select! {
            result = orchestrator.start(&graph) => result,
            _ = cancel.cancelled() => {
                info!("Shutdown requested during startup");
                Ok(StartOrder::default())
            }
        };

        match &outcome {
            Ok(order) if !cancel.is_cancelled() => {
                info!("Fleet up: {}", order.healthy.join(", "));
                cancel.cancelled().await;
                info!("Shutdown requested");
            }
            Ok(_) => {}
            Err(e) => {
                error!("Fleet startup failed: {}", e);
                collector.record_startup_failure(e);
                let healthy: Vec<String> = monitor
                    .services()
                    .into_iter()
                    .filter(|s| monitor.current_state(s).is_some_and(|h| h.is_healthy()))
                    .collect();
                warn!(
                    "Leaving {} healthy service(s) running until shutdown: {}",
                    healthy.len(),
                    healthy.join(", ")
                );
                cancel.cancelled().await;
                info!("Shutdown requested");
            }
        }

        // Shutdown
        scheduler.stop().await;
        monitor.shutdown().await;
        cancel.cancel();
        if let Err(e) = gate.await {
            warn!("Collector gate task ended abnormally: {}", e);
        }
        for (name, handle) in [("ingest", ingest), ("retention", retention)] {
            if let Err(e) = handle.await {
                warn!("Store {} task ended abnormally: {}", name, e);
            }
        }
        if let Some(server) = server {
            match server.await {
                Ok(Err(e)) => warn!("Control server stopped with error: {}", e),
                Err(e) => warn!("Control server task ended abnormally: {}", e),
                Ok(Ok(())) => {}
            }
        }

        if options.teardown {
            let order = StartOrder {
                launched: orchestrator.launched(),
                healthy: Vec::new(),
            };
            info!("Tearing down {} services", order.launched.len());
            orchestrator.stop(&graph, &order).await;
        }

        info!("Fleet stopped");
        outcome.map(|_| ())
    }
}

/// Start scraping once the gate service reports healthy, or at once when
/// there is no gate
async fn collector_gate(
    gate: Option<String>,
    mut events: mpsc::UnboundedReceiver<StartupEvent>,
    collector: Arc<Collector>,
    cancel: CancellationToken,
) {
    let mut waiting = match gate {
        Some(service) => {
            info!("Collection waits for {} to become healthy", service);
            Some(service)
        }
        None => {
            collector.start_scraping().await;
            None
        }
    };

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            StartupEvent::Launched { service } => debug!("{} launched", service),
            StartupEvent::Healthy { service } if waiting.as_deref() == Some(service.as_str()) => {
                waiting = None;
                collector.start_scraping().await;
            }
            StartupEvent::Failed { service, reason } => {
                if waiting.as_deref() == Some(service.as_str()) {
                    warn!("Collection gate {} failed: {}", service, reason);
                }
            }
            StartupEvent::Healthy { .. } => {}
        }
    }

    if let Some(service) = waiting {
        warn!("Collection never started; {} did not become healthy", service);
    }
}
