//! Self-telemetry
//!
//! The collector's own metrics, exposed at `/metrics` by the control server.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

pub static SCRAPES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fleetwatch_scrapes_total",
        "Scrape ticks by job and result",
        &["job", "result"]
    )
    .expect("register fleetwatch_scrapes_total")
});

pub static SCRAPE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fleetwatch_scrape_duration_seconds",
        "Duration of scrape pulls",
        &["job"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("register fleetwatch_scrape_duration_seconds")
});

pub static PROBES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fleetwatch_probes_total",
        "Health probes by service and outcome",
        &["service", "outcome"]
    )
    .expect("register fleetwatch_probes_total")
});

pub static HEALTH_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fleetwatch_health_transitions_total",
        "Health state transitions by service and new state",
        &["service", "state"]
    )
    .expect("register fleetwatch_health_transitions_total")
});

pub static STORE_SERIES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("fleetwatch_store_series", "Series held by the store")
        .expect("register fleetwatch_store_series")
});

pub static STORE_SAMPLES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("fleetwatch_store_samples", "Samples held by the store")
        .expect("register fleetwatch_store_samples")
});

pub static STORE_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fleetwatch_store_dropped_samples_total",
        "Samples removed or refused by the store",
        &["reason"]
    )
    .expect("register fleetwatch_store_dropped_samples_total")
});

/// Render the default registry in the text exposition format
pub fn render() -> (String, Vec<u8>) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode self metrics: {}", e);
        buffer.clear();
    }
    (encoder.format_type().to_string(), buffer)
}
