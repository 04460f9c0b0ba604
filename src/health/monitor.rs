//! Service Health Monitor
//!
//! Runs one probe loop per launched service and publishes its
//! [`HealthSnapshot`] on a `watch` channel. Readers never block the loop:
//! [`ServiceHealthMonitor::current_state`] reads the latest value and
//! [`ServiceHealthMonitor::await_healthy`] waits on the channel.
//!
//! Each tick spawns a probe tagged with a fresh generation. Results travel
//! back to the loop over an mpsc channel and are applied by a single
//! [`HealthTracker`], which discards results older than the last applied
//! generation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::probe::{probe_with_deadline, HealthProbe, Outcome};
use super::state::{HealthSnapshot, HealthState, HealthTracker, Observation};
use crate::config::HealthCheckSpec;
use crate::error::{Error, Result};
use crate::telemetry;

struct MonitorHandle {
    state_rx: watch::Receiver<HealthSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Keeps the channel open for services that have no probe loop
    _static_tx: Option<watch::Sender<HealthSnapshot>>,
}

/// Owns the health state of every launched service
pub struct ServiceHealthMonitor {
    monitors: DashMap<String, MonitorHandle>,
    cancel: CancellationToken,
}

impl ServiceHealthMonitor {
    pub fn new() -> Arc<Self> {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Monitor whose loops all stop when `parent` is cancelled
    pub fn with_cancellation(parent: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            monitors: DashMap::new(),
            cancel: parent,
        })
    }

    /// Start probing `service`. Replaces any existing monitor for it.
    #[instrument(skip(self, spec, probe))]
    pub fn watch(&self, service: &str, spec: &HealthCheckSpec, probe: Arc<dyn HealthProbe>) {
        self.unwatch(service);

        let (tx, rx) = watch::channel(HealthSnapshot::starting());
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(monitor_loop(
            service.to_string(),
            spec.clone(),
            probe,
            tx,
            cancel.clone(),
        ));

        debug!(
            "Watching {} every {:?} (timeout {:?})",
            service, spec.interval, spec.timeout
        );

        self.monitors.insert(
            service.to_string(),
            MonitorHandle {
                state_rx: rx,
                cancel,
                task: Some(task),
                _static_tx: None,
            },
        );
    }

    /// Register a service without a health check: healthy once launched
    pub fn mark_healthy(&self, service: &str) {
        self.unwatch(service);

        let (tx, rx) = watch::channel(HealthSnapshot::healthy());
        telemetry::HEALTH_TRANSITIONS
            .with_label_values(&[service, HealthState::Healthy.as_str()])
            .inc();
        info!("{} has no health check; treating as healthy", service);

        self.monitors.insert(
            service.to_string(),
            MonitorHandle {
                state_rx: rx,
                cancel: self.cancel.child_token(),
                task: None,
                _static_tx: Some(tx),
            },
        );
    }

    /// Latest state without waiting; `None` if the service is not monitored
    pub fn current_state(&self, service: &str) -> Option<HealthState> {
        self.monitors
            .get(service)
            .map(|handle| handle.state_rx.borrow().state)
    }

    pub fn snapshot(&self, service: &str) -> Option<HealthSnapshot> {
        self.monitors
            .get(service)
            .map(|handle| handle.state_rx.borrow().clone())
    }

    pub fn subscribe(&self, service: &str) -> Option<watch::Receiver<HealthSnapshot>> {
        self.monitors
            .get(service)
            .map(|handle| handle.state_rx.clone())
    }

    /// Wait until `service` is healthy or `deadline` elapses.
    ///
    /// Returns immediately when the service is already healthy.
    #[instrument(skip(self))]
    pub async fn await_healthy(&self, service: &str, deadline: Duration) -> Result<()> {
        let mut rx = self
            .subscribe(service)
            .ok_or_else(|| Error::UnknownService(service.to_string()))?;

        if rx.borrow().state.is_healthy() {
            return Ok(());
        }

        let waited = timeout(deadline, rx.wait_for(|snapshot| snapshot.state.is_healthy()))
            .await
            .map(|changed| changed.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal(format!(
                "health monitor for {} stopped",
                service
            ))),
            Err(_) => Err(Error::UnhealthyTimeout {
                service: service.to_string(),
                deadline,
            }),
        }
    }

    /// Stop monitoring `service`, cancelling its loop and in-flight probes.
    /// Returns whether a monitor existed.
    pub fn unwatch(&self, service: &str) -> bool {
        match self.monitors.remove(service) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                debug!("Stopped monitoring {}", service);
                true
            }
            None => false,
        }
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop every monitor and wait for the loops to exit
    pub async fn shutdown(&self) {
        let names = self.services();
        let mut tasks = Vec::new();
        for name in names {
            if let Some((_, mut handle)) = self.monitors.remove(&name) {
                handle.cancel.cancel();
                if let Some(task) = handle.task.take() {
                    tasks.push(task);
                }
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn monitor_loop(
    service: String,
    spec: HealthCheckSpec,
    probe: Arc<dyn HealthProbe>,
    state_tx: watch::Sender<HealthSnapshot>,
    cancel: CancellationToken,
) {
    let mut tracker = HealthTracker::from_spec(&spec);
    let mut ticker = interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let (result_tx, mut result_rx) = mpsc::channel::<(u64, Outcome)>(16);
    let mut in_flight = JoinSet::new();
    let mut next_generation: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Monitor loop for {} cancelled", service);
                break;
            }

            Some((generation, outcome)) = result_rx.recv() => {
                apply_outcome(&service, &mut tracker, &state_tx, generation, outcome);
            }

            _ = ticker.tick() => {
                next_generation += 1;
                let generation = next_generation;
                let probe = Arc::clone(&probe);
                let tx = result_tx.clone();
                let name = service.clone();
                let probe_timeout = spec.timeout;
                in_flight.spawn(async move {
                    let outcome = probe_with_deadline(probe.as_ref(), &name, probe_timeout).await;
                    let _ = tx.send((generation, outcome)).await;
                });
            }

            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    in_flight.abort_all();
}

fn apply_outcome(
    service: &str,
    tracker: &mut HealthTracker,
    state_tx: &watch::Sender<HealthSnapshot>,
    generation: u64,
    outcome: Outcome,
) {
    let observation = tracker.observe(generation, &outcome);
    let counted = match observation {
        Observation::Stale => "stale",
        _ => outcome.label(),
    };
    telemetry::PROBES_TOTAL
        .with_label_values(&[service, counted])
        .inc();

    match observation {
        Observation::Stale => {
            debug!(
                "Discarding stale probe result for {} (generation {} <= {})",
                service,
                generation,
                tracker.applied_generation()
            );
        }
        Observation::Unchanged(_) => {
            if let Outcome::Failure(reason) = &outcome {
                debug!("Probe for {} failed: {}", service, reason);
            }
            state_tx.send_modify(|snapshot| {
                snapshot.generation = generation;
                snapshot.last_outcome = Some(outcome);
            });
        }
        Observation::Transition { from, to } => {
            match to {
                HealthState::Unhealthy => warn!("{} is unhealthy (was {})", service, from),
                _ => info!("{} is {} (was {})", service, to, from),
            }
            telemetry::HEALTH_TRANSITIONS
                .with_label_values(&[service, to.as_str()])
                .inc();
            state_tx.send_modify(|snapshot| {
                snapshot.state = to;
                snapshot.generation = generation;
                snapshot.last_outcome = Some(outcome);
                snapshot.changed_at = Utc::now();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeSpec;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a script of outcomes, then repeats the last one
    struct ScriptedProbe {
        script: Mutex<VecDeque<Outcome>>,
        last: Mutex<Outcome>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Outcome::Success),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, _service: &str) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(outcome) => {
                    *self.last.lock() = outcome.clone();
                    outcome
                }
                None => self.last.lock().clone(),
            }
        }
    }

    fn spec(interval_secs: u64, retries: u32) -> HealthCheckSpec {
        let mut spec = HealthCheckSpec::new(ProbeSpec::Tcp("unused:0".into()));
        spec.interval = Duration::from_secs(interval_secs);
        spec.timeout = Duration::from_secs(1);
        spec.retries = retries;
        spec
    }

    fn fail() -> Outcome {
        Outcome::Failure("down".into())
    }

    // =========================================================================
    // State Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_becomes_healthy_after_first_success() {
        let monitor = ServiceHealthMonitor::new();
        let probe = ScriptedProbe::new(vec![Outcome::Success]);
        monitor.watch("a", &spec(5, 3), probe.clone());

        monitor
            .await_healthy("a", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(monitor.current_state("a"), Some(HealthState::Healthy));
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_healthy_on_healthy_issues_no_probe() {
        let monitor = ServiceHealthMonitor::new();
        let probe = ScriptedProbe::new(vec![Outcome::Success]);
        monitor.watch("a", &spec(60, 3), probe.clone());
        monitor
            .await_healthy("a", Duration::from_secs(1))
            .await
            .unwrap();
        let calls = probe.calls();

        let started = tokio::time::Instant::now();
        monitor
            .await_healthy("a", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(probe.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_healthy_times_out() {
        let monitor = ServiceHealthMonitor::new();
        monitor.watch("db", &spec(1, 3), ScriptedProbe::new(vec![fail()]));

        let result = monitor.await_healthy("db", Duration::from_secs(5)).await;
        assert_matches!(result, Err(Error::UnhealthyTimeout { service, .. }) if service == "db");
        assert_eq!(monitor.current_state("db"), Some(HealthState::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_to_unhealthy_at_threshold() {
        let monitor = ServiceHealthMonitor::new();
        let probe = ScriptedProbe::new(vec![Outcome::Success, fail(), fail(), fail()]);
        monitor.watch("web", &spec(1, 3), probe);
        let mut rx = monitor.subscribe("web").unwrap();

        rx.wait_for(|s| s.generation == 3).await.unwrap();
        assert_eq!(monitor.current_state("web"), Some(HealthState::Healthy));

        rx.wait_for(|s| s.generation == 4).await.unwrap();
        assert_eq!(monitor.current_state("web"), Some(HealthState::Unhealthy));
    }

    #[tokio::test]
    async fn test_mark_healthy_without_check() {
        let monitor = ServiceHealthMonitor::new();
        monitor.mark_healthy("collector");

        assert_eq!(monitor.current_state("collector"), Some(HealthState::Healthy));
        monitor
            .await_healthy("collector", Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let monitor = ServiceHealthMonitor::new();
        assert!(monitor.current_state("ghost").is_none());
        assert_matches!(
            monitor.await_healthy("ghost", Duration::from_millis(1)).await,
            Err(Error::UnknownService(_))
        );
    }

    /// First call answers Failure after `delay`; every later call succeeds at once
    struct SlowFirstFailure {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for SlowFirstFailure {
        async fn check(&self, _service: &str) -> Outcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.delay).await;
                fail()
            } else {
                Outcome::Success
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_from_older_probe_is_discarded() {
        let monitor = ServiceHealthMonitor::new();
        let mut check = spec(1, 1);
        check.timeout = Duration::from_secs(5);
        let probe = Arc::new(SlowFirstFailure {
            delay: Duration::from_millis(1500),
            calls: AtomicUsize::new(0),
        });
        let stale_before = telemetry::PROBES_TOTAL
            .with_label_values(&["late-result", "stale"])
            .get();

        monitor.watch("late-result", &check, probe);
        monitor
            .await_healthy("late-result", Duration::from_secs(2))
            .await
            .unwrap();

        // Generation 1's failure lands at 1.5s, after generation 2 succeeded
        tokio::time::sleep(Duration::from_millis(600)).await;
        let snapshot = monitor.snapshot("late-result").unwrap();
        assert_eq!(snapshot.state, HealthState::Healthy);
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.last_outcome, Some(Outcome::Success));
        assert_eq!(
            telemetry::PROBES_TOTAL
                .with_label_values(&["late-result", "stale"])
                .get(),
            stale_before + 1
        );
    }

    // =========================================================================
    // Cancellation Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_stops_probing() {
        let monitor = ServiceHealthMonitor::new();
        let probe = ScriptedProbe::new(vec![Outcome::Success]);
        monitor.watch("a", &spec(1, 3), probe.clone());
        monitor
            .await_healthy("a", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(monitor.unwatch("a"));
        assert!(!monitor.unwatch("a"));
        tokio::task::yield_now().await;
        let calls = probe.calls();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls(), calls);
        assert!(monitor.current_state("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_all() {
        let root = CancellationToken::new();
        let monitor = ServiceHealthMonitor::with_cancellation(root.clone());
        let probe = ScriptedProbe::new(vec![Outcome::Success]);
        monitor.watch("a", &spec(1, 3), probe.clone());
        monitor.watch("b", &spec(1, 3), probe.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        root.cancel();
        monitor.shutdown().await;
        let calls = probe.calls();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls(), calls);
        assert!(monitor.services().is_empty());
    }
}
