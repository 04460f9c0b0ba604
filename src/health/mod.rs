//! Health module
//!
//! Readiness probes, the per-service health state machine, and the monitor
//! that drives them.

mod monitor;
mod probe;
mod state;

pub use monitor::ServiceHealthMonitor;
pub use probe::{
    probe_for, probe_with_deadline, CommandProbe, HealthProbe, HttpProbe, Outcome, TcpProbe,
};
pub use state::{HealthSnapshot, HealthState, HealthTracker, Observation};
