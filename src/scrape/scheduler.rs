//! Scrape Scheduler
//!
//! One task per target, each on its own interval. A tick awaits its own pull
//! (bounded by the effective timeout) before the next tick can fire, so a slow
//! target never stalls the others and never accumulates concurrent requests.
//! Missed ticks are skipped rather than queued.
//!
//! A failed tick leaves a gap: nothing is sent to the store, the target is
//! marked `down`, and the loop carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::exposition::{self, ExposedSample};
use crate::config::{format_duration, GlobalConfig, ScrapeTarget};
use crate::error::{Error, Result};
use crate::store::{Labels, Sample, ScrapeBatch};
use crate::telemetry::{SCRAPES_TOTAL, SCRAPE_DURATION};

// =============================================================================
// Scraper Port
// =============================================================================

/// Fetches a target's exposition payload
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn fetch(&self, target: &ScrapeTarget, timeout: Duration) -> Result<String>;
}

/// reqwest-backed scraper; any non-2xx status is a failure
pub struct HttpScraper {
    client: Client,
}

impl HttpScraper {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("fleetwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn fetch(&self, target: &ScrapeTarget, timeout: Duration) -> Result<String> {
        let response = self
            .client
            .get(target.url())
            .header(reqwest::header::ACCEPT, "text/plain")
            .timeout(timeout)
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ScrapeFailure {
                job: target.job.clone(),
                reason: format!("server returned HTTP status {}", status),
            });
        }
        response.text().await.map_err(Error::Http)
    }
}

// =============================================================================
// Target Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    Unknown,
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub job: String,
    pub url: String,
    pub instance: String,
    pub interval: String,
    pub health: TargetHealth,
    pub last_scrape: Option<DateTime<Utc>>,
    pub last_duration_seconds: Option<f64>,
    pub last_error: Option<String>,
    /// Samples delivered by the last successful scrape
    pub samples: usize,
}

impl TargetStatus {
    fn pending(target: &ScrapeTarget, global: &GlobalConfig) -> Self {
        Self {
            job: target.job.clone(),
            url: target.url(),
            instance: target.instance(),
            interval: format_duration(target.effective_interval(global)),
            health: TargetHealth::Unknown,
            last_scrape: None,
            last_duration_seconds: None,
            last_error: None,
            samples: 0,
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct TaskSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Scrape task ended abnormally: {}", e);
            }
        }
        debug!("Scrape tasks stopped");
    }
}

pub struct ScrapeScheduler {
    scraper: Arc<dyn Scraper>,
    ingest_tx: mpsc::Sender<ScrapeBatch>,
    global: RwLock<GlobalConfig>,
    status: DashMap<String, TargetStatus>,
    /// Held across a whole stop-and-replace so restarts never interleave
    tasks: AsyncMutex<Option<TaskSet>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl ScrapeScheduler {
    pub fn new(
        scraper: Arc<dyn Scraper>,
        ingest_tx: mpsc::Sender<ScrapeBatch>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            scraper,
            ingest_tx,
            global: RwLock::new(GlobalConfig::default()),
            status: DashMap::new(),
            tasks: AsyncMutex::new(None),
            cancel,
            started: AtomicBool::new(false),
        })
    }

    /// Whether `start` has run
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn one task per target. Replaces any running set.
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn start(self: &Arc<Self>, targets: Vec<ScrapeTarget>, global: GlobalConfig) {
        let mut tasks = self.tasks.lock().await;
        if let Some(set) = tasks.take() {
            set.shutdown().await;
        }
        *self.global.write() = global.clone();

        self.status
            .retain(|job, _| targets.iter().any(|t| &t.job == job));

        let cancel = self.cancel.child_token();
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            self.status
                .entry(target.job.clone())
                .and_modify(|s| {
                    s.url = target.url();
                    s.instance = target.instance();
                    s.interval = format_duration(target.effective_interval(&global));
                })
                .or_insert_with(|| TargetStatus::pending(&target, &global));

            let every = target.effective_interval(&global);
            info!(
                "Scraping {} at {} every {}",
                target.job,
                target.url(),
                format_duration(every)
            );
            handles.push(tokio::spawn(target_loop(
                self.clone(),
                target,
                every,
                cancel.clone(),
            )));
        }

        *tasks = Some(TaskSet { cancel, handles });
        self.started.store(true, Ordering::Release);
    }

    /// Stop the current set and start `targets` under the new global settings
    pub async fn reload(self: &Arc<Self>, targets: Vec<ScrapeTarget>, global: GlobalConfig) {
        info!("Reloading {} scrape targets", targets.len());
        self.start(targets, global).await;
    }

    /// Cancel every target task; in-flight pulls are aborted
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(set) = tasks.take() {
            set.shutdown().await;
        }
    }

    /// Status of every configured target, sorted by job
    pub fn targets(&self) -> Vec<TargetStatus> {
        let mut all: Vec<TargetStatus> = self.status.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.job.cmp(&b.job));
        all
    }

    pub fn target(&self, job: &str) -> Option<TargetStatus> {
        self.status.get(job).map(|s| s.clone())
    }

    /// One scrape tick. `now` stamps samples that carry no explicit
    /// timestamp. Returns the number of samples sent to the store.
    #[instrument(skip(self, target), fields(job = %target.job))]
    pub async fn scrape_once(&self, target: &ScrapeTarget, now: DateTime<Utc>) -> Result<usize> {
        let timeout = {
            let global = self.global.read();
            target.effective_timeout(&global)
        };

        let started = Instant::now();
        let result = self.pull(target, timeout, now).await;
        let elapsed = started.elapsed();
        SCRAPE_DURATION
            .with_label_values(&[&target.job])
            .observe(elapsed.as_secs_f64());

        let mut status = self
            .status
            .entry(target.job.clone())
            .or_insert_with(|| TargetStatus::pending(target, &self.global.read()));
        status.last_scrape = Some(now);
        status.last_duration_seconds = Some(elapsed.as_secs_f64());

        match &result {
            Ok(count) => {
                SCRAPES_TOTAL.with_label_values(&[&target.job, "success"]).inc();
                status.health = TargetHealth::Up;
                status.last_error = None;
                status.samples = *count;
                debug!("Scraped {} samples in {:?}", count, elapsed);
            }
            Err(e) => {
                SCRAPES_TOTAL.with_label_values(&[&target.job, "failure"]).inc();
                status.health = TargetHealth::Down;
                status.last_error = Some(e.to_string());
                if e.is_absorbed() {
                    warn!("{}", e);
                } else {
                    error!("{}", e);
                }
            }
        }
        result
    }

    async fn pull(
        &self,
        target: &ScrapeTarget,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let failure = |reason: String| Error::ScrapeFailure {
            job: target.job.clone(),
            reason,
        };

        let payload = match tokio::time::timeout(timeout, self.scraper.fetch(target, timeout)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(Error::ScrapeFailure { reason, .. })) => return Err(failure(reason)),
            Ok(Err(e)) => return Err(failure(e.to_string())),
            Err(_) => {
                return Err(failure(format!(
                    "timed out after {}",
                    format_duration(timeout)
                )))
            }
        };

        let exposed = exposition::parse(&payload).map_err(|e| failure(e.to_string()))?;
        if let Some(limit) = target.sample_limit {
            if exposed.len() > limit {
                return Err(failure(format!(
                    "sample limit exceeded: {} > {}",
                    exposed.len(),
                    limit
                )));
            }
        }

        let instance = target.instance();
        let samples: Vec<Sample> = exposed
            .into_iter()
            .map(|s| label_sample(target, &instance, s, now))
            .collect();
        let count = samples.len();

        self.ingest_tx
            .send(ScrapeBatch {
                job: target.job.clone(),
                collected_at: now,
                samples,
            })
            .await
            .map_err(|_| failure("store ingest channel closed".to_string()))?;
        Ok(count)
    }
}

async fn target_loop(
    scheduler: Arc<ScrapeScheduler>,
    target: ScrapeTarget,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            // Failures are recorded in the target status
            _ = scheduler.scrape_once(&target, Utc::now()) => {}
        }
    }
    debug!("Scrape loop for {} stopped", target.job);
}

/// Attach `job`, `instance` and the target labels. A payload label that
/// collides with one of those is kept as `exported_<name>`.
fn label_sample(
    target: &ScrapeTarget,
    instance: &str,
    exposed: ExposedSample,
    now: DateTime<Utc>,
) -> Sample {
    let mut labels = Labels::new();
    labels.insert("job".to_string(), target.job.clone());
    labels.insert("instance".to_string(), instance.to_string());
    for (key, value) in &target.labels {
        labels.entry(key.clone()).or_insert_with(|| value.clone());
    }

    for (key, value) in exposed.labels {
        if labels.contains_key(&key) {
            labels.insert(format!("exported_{}", key), value);
        } else {
            labels.insert(key, value);
        }
    }

    Sample {
        job: target.job.clone(),
        name: exposed.name,
        labels,
        value: exposed.value,
        timestamp: exposed.timestamp.unwrap_or(now),
    }
}
