//! Dependency Orchestrator
//!
//! Starts services so that each one launches only after every service it
//! depends on reports healthy. Independent branches start concurrently; a
//! service is dispatched the moment its last dependency turns healthy.
//!
//! # Failure policy
//!
//! 1. A cyclic graph fails before anything is launched
//! 2. A launch failure or an elapsed startup deadline aborts the rest of
//!    the sequence
//! 3. Services already started are left running and keep being monitored

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use super::graph::ServiceGraph;
use super::launcher::Launcher;
use crate::config::{GlobalConfig, HealthCheckSpec, ServiceSpec};
use crate::error::Result;
use crate::health::{probe_for, HealthProbe, ServiceHealthMonitor};

/// Builds the probe for a service's health check
pub type ProbeFactory =
    Arc<dyn Fn(&ServiceSpec, &HealthCheckSpec) -> Result<Arc<dyn HealthProbe>> + Send + Sync>;

/// Progress notifications published while starting the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupEvent {
    Launched { service: String },
    Healthy { service: String },
    Failed { service: String, reason: String },
}

/// Order in which services were launched and became healthy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartOrder {
    pub launched: Vec<String>,
    pub healthy: Vec<String>,
}

impl StartOrder {
    /// Position of `service` in the launch order
    pub fn position(&self, service: &str) -> Option<usize> {
        self.launched.iter().position(|s| s == service)
    }
}

/// Health-gated startup sequencer
pub struct DependencyOrchestrator {
    launcher: Arc<dyn Launcher>,
    monitor: Arc<ServiceHealthMonitor>,
    global: GlobalConfig,
    probe_factory: ProbeFactory,
    events: Option<mpsc::UnboundedSender<StartupEvent>>,
    /// Services whose launch succeeded, in launch order
    launched: Mutex<Vec<String>>,
}

impl DependencyOrchestrator {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        monitor: Arc<ServiceHealthMonitor>,
        global: GlobalConfig,
    ) -> Self {
        Self {
            launcher,
            monitor,
            global,
            probe_factory: Arc::new(|_: &ServiceSpec, check: &HealthCheckSpec| {
                probe_for(&check.probe)
            }),
            events: None,
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Replace how probes are built (tests, custom transports)
    pub fn with_probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = factory;
        self
    }

    /// Publish startup progress on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<StartupEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn monitor(&self) -> &Arc<ServiceHealthMonitor> {
        &self.monitor
    }

    /// Services launched so far, including those launched before a failed
    /// `start` gave up
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    /// Start every service in `graph`, gated on dependency health
    #[instrument(skip(self, graph), fields(services = graph.len()))]
    pub async fn start(&self, graph: &ServiceGraph) -> Result<StartOrder> {
        // Rejects cycles before any launch
        graph.topological_order()?;

        let mut waiting_on: Vec<usize> = graph
            .nodes()
            .iter()
            .map(|node| node.dependencies.len())
            .collect();
        let mut order = StartOrder::default();
        let mut pending = FuturesUnordered::new();

        for idx in 0..graph.len() {
            if waiting_on[idx] == 0 {
                pending.push(self.dispatch(idx, &graph.node(idx).spec));
            }
        }

        while let Some((idx, result)) = pending.next().await {
            let name = graph.name(idx).to_string();

            if let Err(e) = result {
                error!("Startup aborted at {}: {}", name, e);
                self.emit(StartupEvent::Failed {
                    service: name,
                    reason: e.to_string(),
                });
                if !pending.is_empty() {
                    warn!(
                        "Leaving {} in-progress service(s) running unconfirmed",
                        pending.len()
                    );
                }
                return Err(e);
            }

            info!("{} is healthy", name);
            order.healthy.push(name.clone());
            self.emit(StartupEvent::Healthy { service: name });

            let mut unblocked = Vec::new();
            for &dependent in &graph.node(idx).dependents {
                waiting_on[dependent] -= 1;
                if waiting_on[dependent] == 0 {
                    unblocked.push(dependent);
                }
            }
            unblocked.sort_unstable();
            for dependent in unblocked {
                pending.push(self.dispatch(dependent, &graph.node(dependent).spec));
            }
        }

        order.launched = self.launched();
        info!("All {} services healthy", order.healthy.len());
        Ok(order)
    }

    /// Stop launched services in reverse launch order
    #[instrument(skip(self, graph, order))]
    pub async fn stop(&self, graph: &ServiceGraph, order: &StartOrder) {
        for name in order.launched.iter().rev() {
            self.monitor.unwatch(name);
            let Some(idx) = graph.index_of(name) else {
                continue;
            };
            if let Err(e) = self.launcher.stop(&graph.node(idx).spec).await {
                warn!("Failed to stop {}: {}", name, e);
            }
        }
    }

    fn dispatch<'a>(
        &'a self,
        idx: usize,
        spec: &'a ServiceSpec,
    ) -> impl Future<Output = (usize, Result<()>)> + 'a {
        async move { (idx, self.bring_up(spec).await) }
    }

    async fn bring_up(&self, spec: &ServiceSpec) -> Result<()> {
        info!("Launching {} ({})", spec.name, spec.launch);
        self.launcher.launch(spec).await?;
        self.launched.lock().push(spec.name.clone());
        self.emit(StartupEvent::Launched {
            service: spec.name.clone(),
        });

        match &spec.healthcheck {
            Some(check) => {
                let probe = (self.probe_factory)(spec, check)?;
                self.monitor.watch(&spec.name, check, probe);
            }
            None => self.monitor.mark_healthy(&spec.name),
        }

        self.monitor
            .await_healthy(&spec.name, spec.startup_deadline(&self.global))
            .await
    }

    fn emit(&self, event: StartupEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchDescriptor, ProbeSpec};
    use crate::error::Error;
    use crate::health::{HealthState, Outcome};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Records launches together with the health of each dependency at the
    /// moment of launch.
    struct RecordingLauncher {
        monitor: Arc<ServiceHealthMonitor>,
        log: Mutex<Vec<(String, Vec<(String, Option<HealthState>)>)>>,
        fail: Option<String>,
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        async fn launch(&self, service: &ServiceSpec) -> Result<()> {
            if self.fail.as_deref() == Some(service.name.as_str()) {
                return Err(Error::Launch {
                    service: service.name.clone(),
                    reason: "refused".into(),
                });
            }
            let deps = service
                .depends_on
                .iter()
                .map(|d| (d.clone(), self.monitor.current_state(d)))
                .collect();
            self.log.lock().push((service.name.clone(), deps));
            Ok(())
        }

        async fn stop(&self, _service: &ServiceSpec) -> Result<()> {
            Ok(())
        }
    }

    /// Healthy after a fixed number of failed probes
    struct Delayed {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl HealthProbe for Delayed {
        async fn check(&self, _service: &str) -> Outcome {
            let mut left = self.failures_left.lock();
            if *left == 0 {
                Outcome::Success
            } else {
                *left -= 1;
                Outcome::Failure("warming up".into())
            }
        }
    }

    fn checked(name: &str, deps: &[&str]) -> ServiceSpec {
        let mut check = HealthCheckSpec::new(ProbeSpec::Tcp(format!("{}:0", name)));
        check.interval = Duration::from_secs(1);
        check.timeout = Duration::from_millis(500);
        ServiceSpec::new(name, LaunchDescriptor::Builtin)
            .depends_on(deps.iter().copied())
            .with_healthcheck(check)
    }

    fn harness(
        warmups: HashMap<String, u32>,
        fail: Option<&str>,
    ) -> (DependencyOrchestrator, Arc<RecordingLauncher>) {
        let monitor = ServiceHealthMonitor::new();
        let launcher = Arc::new(RecordingLauncher {
            monitor: monitor.clone(),
            log: Mutex::new(Vec::new()),
            fail: fail.map(String::from),
        });
        let mut global = GlobalConfig::default();
        global.startup_timeout = Duration::from_secs(10);

        let warmups = Arc::new(warmups);
        let factory: ProbeFactory = Arc::new(move |spec: &ServiceSpec, _: &HealthCheckSpec| {
            let failures = warmups.get(&spec.name).copied().unwrap_or(0);
            Ok(Arc::new(Delayed {
                failures_left: Mutex::new(failures),
            }) as Arc<dyn HealthProbe>)
        });

        let orchestrator = DependencyOrchestrator::new(launcher.clone(), monitor, global)
            .with_probe_factory(factory);
        (orchestrator, launcher)
    }

    // =========================================================================
    // Ordering Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_dependent_launches_after_dependency_healthy() {
        let (orchestrator, launcher) = harness(HashMap::new(), None);
        let graph = ServiceGraph::new(&[checked("a", &[]), checked("b", &["a"])]).unwrap();

        let order = orchestrator.start(&graph).await.unwrap();
        assert_eq!(order.launched, vec!["a", "b"]);
        assert_eq!(order.healthy, vec!["a", "b"]);

        let log = launcher.log.lock();
        assert_eq!(log[1].0, "b");
        assert_eq!(
            log[1].1,
            vec![("a".to_string(), Some(HealthState::Healthy))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_branches_not_serialized() {
        // "slow" needs 3 extra probes; "fast" and its dependent must not wait
        let warmups = HashMap::from([("slow".to_string(), 3)]);
        let (orchestrator, _) = harness(warmups, None);
        let graph = ServiceGraph::new(&[
            checked("slow", &[]),
            checked("fast", &[]),
            checked("after-fast", &["fast"]),
            checked("after-both", &["slow", "after-fast"]),
        ])
        .unwrap();

        let order = orchestrator.start(&graph).await.unwrap();

        assert_eq!(order.launched[..2], ["slow", "fast"]);
        assert!(order.position("after-fast").unwrap() < order.position("after-both").unwrap());
        // after-fast became healthy before slow did
        let healthy_pos = |n: &str| order.healthy.iter().position(|s| s == n).unwrap();
        assert!(healthy_pos("after-fast") < healthy_pos("slow"));
        assert_eq!(order.healthy.last().map(String::as_str), Some("after-both"));
    }

    #[tokio::test]
    async fn test_service_without_check_healthy_on_launch() {
        let (orchestrator, _) = harness(HashMap::new(), None);
        let graph = ServiceGraph::new(&[
            ServiceSpec::new("plain", LaunchDescriptor::Builtin),
            ServiceSpec::new("next", LaunchDescriptor::Builtin).depends_on(["plain"]),
        ])
        .unwrap();

        let order = orchestrator.start(&graph).await.unwrap();
        assert_eq!(order.healthy, vec!["plain", "next"]);
    }

    // =========================================================================
    // Failure Tests
    // =========================================================================

    #[tokio::test]
    async fn test_cycle_launches_nothing() {
        let (orchestrator, launcher) = harness(HashMap::new(), None);
        let graph = ServiceGraph::new(&[
            checked("free", &[]),
            checked("a", &["b"]),
            checked("b", &["a"]),
        ])
        .unwrap();

        assert_matches!(orchestrator.start(&graph).await, Err(Error::Cycle { .. }));
        assert!(launcher.log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_deadline_aborts_and_keeps_started() {
        let warmups = HashMap::from([("db".to_string(), 1_000)]);
        let (orchestrator, launcher) = harness(warmups, None);
        let mut db = checked("db", &[]);
        db.startup_timeout = Some(Duration::from_secs(3));
        let graph = ServiceGraph::new(&[
            db,
            checked("cache", &[]),
            checked("api", &["db", "cache"]),
        ])
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = orchestrator.with_events(tx);
        let result = orchestrator.start(&graph).await;

        assert_matches!(
            result,
            Err(Error::UnhealthyTimeout { service, deadline })
                if service == "db" && deadline == Duration::from_secs(3)
        );
        let launched: Vec<String> = launcher.log.lock().iter().map(|(n, _)| n.clone()).collect();
        assert!(!launched.contains(&"api".to_string()));

        // The healthy independent branch stays up and monitored
        assert_eq!(
            orchestrator.monitor().current_state("cache"),
            Some(HealthState::Healthy)
        );

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&StartupEvent::Healthy {
            service: "cache".into()
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, StartupEvent::Failed { service, .. } if service == "db")));
    }

    #[tokio::test]
    async fn test_launch_failure_aborts() {
        let (orchestrator, _) = harness(HashMap::new(), Some("b"));
        let graph = ServiceGraph::new(&[
            ServiceSpec::new("a", LaunchDescriptor::Builtin),
            ServiceSpec::new("b", LaunchDescriptor::Builtin).depends_on(["a"]),
            ServiceSpec::new("c", LaunchDescriptor::Builtin).depends_on(["b"]),
        ])
        .unwrap();

        assert_matches!(
            orchestrator.start(&graph).await,
            Err(Error::Launch { service, .. }) if service == "b"
        );
        assert!(orchestrator.monitor().current_state("c").is_none());
        assert_eq!(orchestrator.launched(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_launch_not_recorded_among_independents() {
        let (orchestrator, _) = harness(HashMap::new(), Some("broken"));
        let graph = ServiceGraph::new(&[
            ServiceSpec::new("ok", LaunchDescriptor::Builtin),
            ServiceSpec::new("broken", LaunchDescriptor::Builtin),
        ])
        .unwrap();

        assert!(orchestrator.start(&graph).await.is_err());
        let launched = orchestrator.launched();
        assert!(!launched.contains(&"broken".to_string()));
        assert!(orchestrator.monitor().current_state("broken").is_none());
    }

    #[tokio::test]
    async fn test_stop_unwatches_in_reverse() {
        let (orchestrator, _) = harness(HashMap::new(), None);
        let graph = ServiceGraph::new(&[
            ServiceSpec::new("a", LaunchDescriptor::Builtin),
            ServiceSpec::new("b", LaunchDescriptor::Builtin).depends_on(["a"]),
        ])
        .unwrap();
        let order = orchestrator.start(&graph).await.unwrap();

        orchestrator.stop(&graph, &order).await;
        assert!(orchestrator.monitor().services().is_empty());
    }
}
