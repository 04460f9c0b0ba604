//! Sample records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Label set, sorted by name so equal sets compare and hash equal
pub type Labels = BTreeMap<String, String>;

/// One scraped value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Job of the target the sample was pulled from
    pub job: String,
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Every sample from one successful scrape tick of one target; ingested
/// atomically.
#[derive(Debug, Clone)]
pub struct ScrapeBatch {
    pub job: String,
    pub collected_at: DateTime<Utc>,
    pub samples: Vec<Sample>,
}

impl ScrapeBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A stored point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}
