//! Health Probes
//!
//! A probe performs one readiness check against one service. Probes never
//! fail the caller: every result, including transport errors, is an
//! [`Outcome`] value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::trace;

use crate::config::ProbeSpec;
use crate::error::{Error, Result};

/// Result of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    Failure(String),
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure(_) => "failure",
            Outcome::Timeout => "timeout",
        }
    }

    /// Convert into a `Result` for callers that report to an operator
    pub fn into_result(self, service: &str, timeout: Duration) -> Result<()> {
        match self {
            Outcome::Success => Ok(()),
            Outcome::Failure(reason) => Err(Error::ProbeFailure {
                service: service.to_string(),
                reason,
            }),
            Outcome::Timeout => Err(Error::ProbeTimeout {
                service: service.to_string(),
                timeout,
            }),
        }
    }
}

/// A readiness check against one service
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, service: &str) -> Outcome;
}

/// Run a probe under a hard deadline.
///
/// The probe future is dropped when the deadline passes, so a late answer is
/// never observed.
pub async fn probe_with_deadline(
    probe: &dyn HealthProbe,
    service: &str,
    timeout: Duration,
) -> Outcome {
    match tokio::time::timeout(timeout, probe.check(service)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            trace!(service, ?timeout, "probe deadline elapsed");
            Outcome::Timeout
        }
    }
}

/// Build the probe described by a health-check spec
pub fn probe_for(spec: &ProbeSpec) -> Result<Arc<dyn HealthProbe>> {
    Ok(match spec {
        ProbeSpec::Http(url) => Arc::new(HttpProbe::new(url.clone())?),
        ProbeSpec::Command(argv) => Arc::new(CommandProbe::new(argv.clone())?),
        ProbeSpec::Tcp(address) => Arc::new(TcpProbe::new(address.clone())),
    })
}

// =============================================================================
// HTTP
// =============================================================================

/// GETs a URL; any 2xx status is healthy
pub struct HttpProbe {
    url: String,
    client: Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, _service: &str) -> Outcome {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => Outcome::Success,
            Ok(response) => Outcome::Failure(format!("HTTP status {}", response.status())),
            Err(e) => Outcome::Failure(e.to_string()),
        }
    }
}

// =============================================================================
// Command
// =============================================================================

/// Runs a command; exit code 0 is healthy
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| Error::Config("probe command is empty".to_string()))?;
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self, _service: &str) -> Outcome {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => Outcome::Success,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Outcome::Failure(format!("exited with {}", output.status))
                } else {
                    Outcome::Failure(format!("exited with {}: {}", output.status, stderr))
                }
            }
            Err(e) => Outcome::Failure(format!("cannot run {}: {}", self.program, e)),
        }
    }
}

// =============================================================================
// TCP
// =============================================================================

/// Connects to `host:port`
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, _service: &str) -> Outcome {
        match TcpStream::connect(&self.address).await {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::Failure(format!("connect {}: {}", self.address, e)),
        }
    }
}
