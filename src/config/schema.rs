//! Fleet configuration schema
//!
//! The whole file is loaded once at startup into an immutable [`FleetConfig`]
//! and shared read-only. Runtime changes go through the collector's reload
//! path, which builds a fresh `FleetConfig` rather than mutating this one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration::{serde_duration, serde_duration_opt};
use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

fn default_scrape_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retention() -> Duration {
    Duration::from_secs(15 * 86_400)
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retries() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// =============================================================================
// Top Level
// =============================================================================

/// Complete fleet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    /// Global scrape/retention/startup settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Collector gating
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Services in declaration order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    /// Targets pulled by the scrape scheduler
    #[serde(default)]
    pub scrape_targets: Vec<ScrapeTarget>,
}

/// Global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default = "default_scrape_interval", with = "serde_duration")]
    pub scrape_interval: Duration,

    #[serde(default = "default_scrape_timeout", with = "serde_duration")]
    pub scrape_timeout: Duration,

    #[serde(default = "default_retention", with = "serde_duration")]
    pub retention: Duration,

    #[serde(default = "default_eviction_interval", with = "serde_duration")]
    pub eviction_interval: Duration,

    /// Default deadline for a launched service to become healthy
    #[serde(default = "default_startup_timeout", with = "serde_duration")]
    pub startup_timeout: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
            retention: default_retention(),
            eviction_interval: default_eviction_interval(),
            startup_timeout: default_startup_timeout(),
        }
    }
}

/// Which service gates the start of scraping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Scraping begins once this service is healthy. Unset means immediately.
    #[serde(default)]
    pub service: Option<String>,
}

// =============================================================================
// Services
// =============================================================================

/// A declared service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,

    /// `launch: builtin` or a one-key map such as `launch: {image: ...}`
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub launch: LaunchDescriptor,

    #[serde(default)]
    pub ports: Vec<EndpointSpec>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub healthcheck: Option<HealthCheckSpec>,

    /// Overrides `global.startup_timeout` for this service
    #[serde(default, with = "serde_duration_opt")]
    pub startup_timeout: Option<Duration>,
}

impl ServiceSpec {
    /// Minimal service with no ports, environment, dependencies or check
    pub fn new(name: impl Into<String>, launch: LaunchDescriptor) -> Self {
        Self {
            name: name.into(),
            launch,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            depends_on: Vec::new(),
            healthcheck: None,
            startup_timeout: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_healthcheck(mut self, check: HealthCheckSpec) -> Self {
        self.healthcheck = Some(check);
        self
    }

    /// Startup deadline for this service given the global default
    pub fn startup_deadline(&self, global: &GlobalConfig) -> Duration {
        self.startup_timeout.unwrap_or(global.startup_timeout)
    }
}

/// How the runtime brings a service up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchDescriptor {
    /// Prebuilt container image
    Image(String),
    /// Container build context, built then run
    Build(String),
    /// Host process argv
    Command(Vec<String>),
    /// The collector embedded in this process
    Builtin,
}

impl fmt::Display for LaunchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchDescriptor::Image(image) => write!(f, "image {}", image),
            LaunchDescriptor::Build(context) => write!(f, "build {}", context),
            LaunchDescriptor::Command(argv) => write!(f, "command {}", argv.join(" ")),
            LaunchDescriptor::Builtin => write!(f, "builtin"),
        }
    }
}

/// Transport protocol of an exposed endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Exposed port mapping, written `host:container[/proto]` or `port[/proto]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointSpec {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl TryFrom<String> for EndpointSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EndpointSpec> for String {
    fn from(value: EndpointSpec) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for EndpointSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ports, protocol) = match s.trim().split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some((_, other)) => {
                return Err(Error::Config(format!(
                    "unknown protocol '{}' in port mapping {}",
                    other, s
                )))
            }
            None => (s.trim(), Protocol::Tcp),
        };

        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port '{}' in mapping {}", p, s)))
        };

        let (host_port, container_port) = match ports.split_once(':') {
            Some((host, container)) => (parse_port(host)?, parse_port(container)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };

        Ok(Self {
            host_port,
            container_port,
            protocol,
        })
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}:{}/{}", self.host_port, self.container_port, proto)
    }
}

// =============================================================================
// Health Checks
// =============================================================================

/// Health-check policy of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSpec {
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub probe: ProbeSpec,

    #[serde(default = "default_probe_interval", with = "serde_duration")]
    pub interval: Duration,

    #[serde(default = "default_probe_timeout", with = "serde_duration")]
    pub timeout: Duration,

    /// Consecutive non-successes before Healthy flips to Unhealthy
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Consecutive successes before the service counts as Healthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl HealthCheckSpec {
    pub fn new(probe: ProbeSpec) -> Self {
        Self {
            probe,
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            retries: default_retries(),
            success_threshold: default_success_threshold(),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.retries
    }
}

/// Readiness signal of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSpec {
    /// GET the URL, any 2xx is healthy
    Http(String),
    /// Run argv, exit code 0 is healthy
    Command(Vec<String>),
    /// Connect to `host:port`
    Tcp(String),
}

// =============================================================================
// Scrape Targets
// =============================================================================

/// A producer pulled by the scrape scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeTarget {
    pub job: String,

    /// `host:port`, or a base URL with scheme
    pub address: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Overrides `global.scrape_interval`
    #[serde(default, with = "serde_duration_opt")]
    pub interval: Option<Duration>,

    /// Overrides `global.scrape_timeout`
    #[serde(default, with = "serde_duration_opt")]
    pub timeout: Option<Duration>,

    /// Attached to every sample from this target
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// More samples than this in one scrape fails the scrape
    #[serde(default)]
    pub sample_limit: Option<usize>,
}

impl ScrapeTarget {
    pub fn new(job: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            address: address.into(),
            metrics_path: default_metrics_path(),
            interval: None,
            timeout: None,
            labels: BTreeMap::new(),
            sample_limit: None,
        }
    }

    /// Full URL of the exposition endpoint
    pub fn url(&self) -> String {
        let base = self.address.trim_end_matches('/');
        let path = if self.metrics_path.starts_with('/') {
            self.metrics_path.clone()
        } else {
            format!("/{}", self.metrics_path)
        };

        if base.contains("://") {
            format!("{}{}", base, path)
        } else {
            format!("http://{}{}", base, path)
        }
    }

    /// Value of the `instance` label: the address without scheme
    pub fn instance(&self) -> String {
        let without_scheme = self
            .address
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.address);
        without_scheme.trim_end_matches('/').to_string()
    }

    pub fn effective_interval(&self, global: &GlobalConfig) -> Duration {
        self.interval.unwrap_or(global.scrape_interval)
    }

    /// Scrape timeout, never longer than the interval so pulls of one target
    /// cannot overlap.
    pub fn effective_timeout(&self, global: &GlobalConfig) -> Duration {
        let timeout = self.timeout.unwrap_or(global.scrape_timeout);
        timeout.min(self.effective_interval(global))
    }
}

// =============================================================================
// Loading & Validation
// =============================================================================

impl FleetConfig {
    /// Load and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Check every cross-reference and bound. Dependency cycles are reported
    /// by the orchestrator's graph, not here.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(Error::Config("service with empty name".to_string()));
            }
            if !names.insert(service.name.as_str()) {
                return Err(Error::DuplicateService(service.name.clone()));
            }
        }

        for service in &self.services {
            for dep in &service.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            if let LaunchDescriptor::Command(argv) = &service.launch {
                if argv.is_empty() {
                    return Err(Error::Config(format!(
                        "service {} has an empty launch command",
                        service.name
                    )));
                }
            }

            if let Some(check) = &service.healthcheck {
                if check.retries == 0 || check.success_threshold == 0 {
                    return Err(Error::Config(format!(
                        "service {}: health-check thresholds must be at least 1",
                        service.name
                    )));
                }
                if let ProbeSpec::Command(argv) = &check.probe {
                    if argv.is_empty() {
                        return Err(Error::Config(format!(
                            "service {} has an empty probe command",
                            service.name
                        )));
                    }
                }
            }
        }

        if let Some(gate) = &self.collector.service {
            if !names.contains(gate.as_str()) {
                return Err(Error::Config(format!(
                    "collector gate names undeclared service {}",
                    gate
                )));
            }
        }

        let mut jobs = HashSet::new();
        for target in &self.scrape_targets {
            if target.job.trim().is_empty() {
                return Err(Error::Config("scrape target with empty job".to_string()));
            }
            if !jobs.insert(target.job.as_str()) {
                return Err(Error::Config(format!(
                    "scrape job declared more than once: {}",
                    target.job
                )));
            }
            if target.address.trim().is_empty() {
                return Err(Error::Config(format!(
                    "scrape job {} has no address",
                    target.job
                )));
            }
            if let Some(timeout) = target.timeout {
                let interval = target.effective_interval(&self.global);
                if timeout > interval {
                    return Err(Error::Config(format!(
                        "scrape job {}: timeout {:?} exceeds interval {:?}",
                        target.job, timeout, interval
                    )));
                }
            }
        }

        Ok(())
    }
}
