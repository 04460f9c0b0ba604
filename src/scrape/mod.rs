//! Scrape module
//!
//! Pulls text exposition payloads from configured targets and feeds them to
//! the store.

pub mod exposition;
mod scheduler;

pub use exposition::ExposedSample;
pub use scheduler::{HttpScraper, ScrapeScheduler, Scraper, TargetHealth, TargetStatus};
