//! Error types for fleetwatch

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating the fleet or collecting metrics
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be decoded
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[source] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Health Errors
    // =========================================================================
    /// A health probe did not answer within its deadline
    #[error("Health probe for {service} timed out after {timeout:?}")]
    ProbeTimeout { service: String, timeout: Duration },

    /// A health probe answered with a failure
    #[error("Health probe for {service} failed: {reason}")]
    ProbeFailure { service: String, reason: String },

    /// No monitor is registered for the service
    #[error("Service is not monitored: {0}")]
    UnknownService(String),

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    /// The dependency graph contains a cycle
    #[error("Dependency cycle detected between services: {}", services.join(" -> "))]
    Cycle { services: Vec<String> },

    /// A service depends on a service that is not declared
    #[error("Service {service} depends on undeclared service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    /// The same service name is declared twice
    #[error("Service declared more than once: {0}")]
    DuplicateService(String),

    /// A service never became healthy within its startup deadline
    #[error("Service {service} did not become healthy within {deadline:?}")]
    UnhealthyTimeout { service: String, deadline: Duration },

    /// The runtime failed to launch or stop a service
    #[error("Failed to launch service {service}: {reason}")]
    Launch { service: String, reason: String },

    // =========================================================================
    // Collection Errors
    // =========================================================================
    /// A scrape tick failed; recovered locally by the scheduler
    #[error("Scrape of job {job} failed: {reason}")]
    ScrapeFailure { job: String, reason: String },

    /// Exposition payload could not be parsed
    #[error("Malformed exposition line {line}: {reason}")]
    ExpositionParse { line: usize, reason: String },

    /// A new store configuration was rejected
    #[error("Store reload rejected: {0}")]
    StoreReload(String),

    /// A series selector could not be parsed
    #[error("Invalid series selector: {0}")]
    InvalidSelector(String),
}

impl Error {
    /// Whether this error is an expected steady-state event that is absorbed
    /// by the layer that produced it rather than surfaced to the operator.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            Error::ProbeTimeout { .. }
                | Error::ProbeFailure { .. }
                | Error::ScrapeFailure { .. }
                | Error::ExpositionParse { .. }
        )
    }
}
