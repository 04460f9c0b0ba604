//! In-memory time-series store
//!
//! Series are keyed by metric name plus the full label set. Points inside a
//! series are kept in timestamp order; anything at or before the newest point
//! is refused, which keeps eviction a cheap pop from the front.
//!
//! Readers take a shared lock and copy out what they need, so a query never
//! observes half of an ingest batch or half of an eviction pass.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::sample::{Labels, Point, ScrapeBatch};
use super::selector::Selector;
use crate::config::format_duration;
use crate::error::{Error, Result};
use crate::telemetry::{STORE_DROPPED, STORE_SAMPLES, STORE_SERIES};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Labels,
}

/// Result of one ingest call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    /// Out-of-order or duplicate timestamps
    pub rejected: usize,
}

/// Latest point of a series at an evaluation time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstantSample {
    pub metric: String,
    pub labels: Labels,
    pub point: Point,
}

/// All points of a series inside a window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSeries {
    pub metric: String,
    pub labels: Labels,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub series: usize,
    pub samples: usize,
    pub retention: String,
    pub ingested_total: u64,
    pub rejected_total: u64,
    pub evicted_total: u64,
}

#[derive(Default)]
struct Counters {
    ingested: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

pub struct TimeSeriesStore {
    series: RwLock<BTreeMap<SeriesKey, VecDeque<Point>>>,
    retention: RwLock<Duration>,
    counters: Counters,
}

impl TimeSeriesStore {
    pub fn new(retention: Duration) -> Result<Self> {
        validate_retention(retention)?;
        Ok(Self {
            series: RwLock::new(BTreeMap::new()),
            retention: RwLock::new(retention),
            counters: Counters::default(),
        })
    }

    pub fn retention(&self) -> Duration {
        *self.retention.read()
    }

    /// Swap in a new retention window. The next eviction pass uses it;
    /// samples already evicted under the old window stay gone.
    #[instrument(skip(self), fields(retention = %format_duration(retention)))]
    pub fn reload(&self, retention: Duration) -> Result<()> {
        validate_retention(retention)?;
        let previous = std::mem::replace(&mut *self.retention.write(), retention);
        info!(
            "Retention changed from {} to {}",
            format_duration(previous),
            format_duration(retention)
        );
        Ok(())
    }

    /// Append a whole batch under one write lock
    pub fn ingest(&self, batch: ScrapeBatch) -> IngestReport {
        let mut report = IngestReport::default();
        {
            let mut series = self.series.write();
            for sample in batch.samples {
                let key = SeriesKey {
                    name: sample.name,
                    labels: sample.labels,
                };
                let points = series.entry(key).or_default();
                match points.back() {
                    Some(last) if last.timestamp >= sample.timestamp => {
                        report.rejected += 1;
                    }
                    _ => {
                        points.push_back(Point {
                            timestamp: sample.timestamp,
                            value: sample.value,
                        });
                        report.accepted += 1;
                    }
                }
            }
            // A batch that only carried rejected samples may have created
            // empty series
            series.retain(|_, points| !points.is_empty());
            self.publish_sizes(&series);
        }

        self.counters
            .ingested
            .fetch_add(report.accepted as u64, Ordering::Relaxed);
        if report.rejected > 0 {
            self.counters
                .rejected
                .fetch_add(report.rejected as u64, Ordering::Relaxed);
            STORE_DROPPED
                .with_label_values(&["out_of_order"])
                .inc_by(report.rejected as u64);
            debug!(
                "Job {}: refused {} out-of-order samples",
                batch.job, report.rejected
            );
        }
        report
    }

    /// Remove every point strictly older than `cutoff`. Returns the number
    /// of points removed.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        {
            let mut series = self.series.write();
            for points in series.values_mut() {
                while points.front().is_some_and(|p| p.timestamp < cutoff) {
                    points.pop_front();
                    removed += 1;
                }
            }
            series.retain(|_, points| !points.is_empty());
            self.publish_sizes(&series);
        }

        if removed > 0 {
            self.counters
                .evicted
                .fetch_add(removed as u64, Ordering::Relaxed);
            STORE_DROPPED
                .with_label_values(&["retention"])
                .inc_by(removed as u64);
        }
        removed
    }

    /// Evict against the current retention window as seen from `now`
    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let window = self.retention();
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w));
        match cutoff {
            Some(cutoff) => self.evict_older_than(cutoff),
            None => 0,
        }
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    /// Newest point of each matching series within `lookback` of `at`
    pub fn query_instant(
        &self,
        selector: &Selector,
        at: DateTime<Utc>,
        lookback: Duration,
    ) -> Vec<InstantSample> {
        let earliest = chrono::Duration::from_std(lookback)
            .ok()
            .and_then(|d| at.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let series = self.series.read();
        series
            .iter()
            .filter(|(key, _)| selector.matches(&key.name, &key.labels))
            .filter_map(|(key, points)| {
                let point = points
                    .iter()
                    .rev()
                    .find(|p| p.timestamp <= at)
                    .filter(|p| p.timestamp >= earliest)?;
                Some(InstantSample {
                    metric: key.name.clone(),
                    labels: key.labels.clone(),
                    point: *point,
                })
            })
            .collect()
    }

    /// Points of each matching series inside `[start, end]`. Series with no
    /// point in the window are omitted.
    pub fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<RangeSeries> {
        let series = self.series.read();
        series
            .iter()
            .filter(|(key, _)| selector.matches(&key.name, &key.labels))
            .filter_map(|(key, points)| {
                let window: Vec<Point> = points
                    .iter()
                    .filter(|p| p.timestamp >= start && p.timestamp <= end)
                    .copied()
                    .collect();
                (!window.is_empty()).then(|| RangeSeries {
                    metric: key.name.clone(),
                    labels: key.labels.clone(),
                    points: window,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let (series, samples) = {
            let map = self.series.read();
            (map.len(), map.values().map(VecDeque::len).sum())
        };
        StoreStats {
            series,
            samples,
            retention: format_duration(self.retention()),
            ingested_total: self.counters.ingested.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Consume scrape batches until cancelled or every sender is gone.
    /// Batches already queued at cancellation are still ingested.
    pub async fn run_ingest(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ScrapeBatch>,
        cancel: CancellationToken,
    ) {
        info!("Store ingest loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    rx.close();
                    while let Some(batch) = rx.recv().await {
                        self.ingest(batch);
                    }
                    break;
                }
                batch = rx.recv() => match batch {
                    Some(batch) if batch.is_empty() => {
                        debug!("Job {}: empty batch", batch.job);
                    }
                    Some(batch) => {
                        let job = batch.job.clone();
                        let received = batch.len();
                        let report = self.ingest(batch);
                        debug!(
                            "Job {}: stored {} of {} samples",
                            job, report.accepted, received
                        );
                    }
                    None => break,
                },
            }
        }
        info!("Store ingest loop stopped");
    }

    /// Periodic eviction, one pass per `every`
    pub async fn run_retention(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Retention loop started (every {})", format_duration(every));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.evict_expired();
                    if removed > 0 {
                        debug!("Evicted {} expired samples", removed);
                    }
                }
            }
        }
        info!("Retention loop stopped");
    }

    fn publish_sizes(&self, series: &BTreeMap<SeriesKey, VecDeque<Point>>) {
        STORE_SERIES.set(series.len() as i64);
        STORE_SAMPLES.set(series.values().map(VecDeque::len).sum::<usize>() as i64);
    }
}

fn validate_retention(retention: Duration) -> Result<()> {
    if retention.is_zero() {
        return Err(Error::StoreReload(
            "retention window must be positive".to_string(),
        ));
    }
    if chrono::Duration::from_std(retention).is_err() {
        warn!("Rejected retention {:?}", retention);
        return Err(Error::StoreReload(format!(
            "retention window {:?} is out of range",
            retention
        )));
    }
    Ok(())
}
