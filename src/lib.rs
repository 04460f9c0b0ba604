//! Fleetwatch - Health-Gated Fleet Startup with an Embedded Metrics Collector
//!
//! Brings a set of interdependent services up in dependency order, launching
//! each one only after everything it depends on reports healthy, and runs a
//! pull-based metrics collector over the resulting fleet.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (startup order) → Health Monitor (readiness)
//!        ↓ collector gate
//! Scrape Scheduler (pull) → Time-Series Store (retention) → Query Server
//! ```
//!
//! # Modules
//!
//! - [`config`] - Fleet configuration and duration parsing
//! - [`error`] - Error types
//! - [`fleet`] - Runtime wiring and shutdown
//! - [`health`] - Health probes and the per-service monitor
//! - [`orchestrator`] - Dependency graph and startup sequencing
//! - [`scrape`] - Exposition parsing and the scrape scheduler
//! - [`server`] - Control and query HTTP server
//! - [`store`] - In-memory time-series store
//! - [`telemetry`] - Our own Prometheus metrics

pub mod config;
pub mod error;
pub mod fleet;
pub mod health;
pub mod orchestrator;
pub mod scrape;
pub mod server;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use config::FleetConfig;
pub use error::{Error, Result};
pub use fleet::{Collector, Fleet, FleetOptions};
pub use health::{HealthState, ServiceHealthMonitor};
pub use orchestrator::{DependencyOrchestrator, ServiceGraph};
pub use scrape::ScrapeScheduler;
pub use store::{Selector, TimeSeriesStore};
