//! Configuration module
//!
//! YAML fleet description plus human duration parsing.

mod duration;
mod schema;

pub use duration::{format_duration, parse_duration};
pub use schema::{
    CollectorConfig, EndpointSpec, FleetConfig, GlobalConfig, HealthCheckSpec, LaunchDescriptor,
    ProbeSpec, Protocol, ScrapeTarget, ServiceSpec,
};
