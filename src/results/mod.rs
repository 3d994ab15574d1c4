// src/results/mod.rs
//! Result records, the per-year aggregate and the HTTP query surface.

pub mod aggregate;
pub mod catalog;
pub mod record;
pub mod server;

pub use aggregate::{AggregateStage, Aggregator};
pub use catalog::CodeCatalog;
pub use record::ResultRecord;
