//! Store module
//!
//! Retention-bounded in-memory time-series storage fed by the scrape
//! scheduler.

mod sample;
mod selector;
mod tsdb;

pub use sample::{Labels, Point, Sample, ScrapeBatch};
pub use selector::{LabelMatcher, MatchOp, Selector};
pub use tsdb::{
    IngestReport, InstantSample, RangeSeries, SeriesKey, StoreStats, TimeSeriesStore,
};

pub(crate) use selector::{is_metric_name, read_quoted};
