//! paddock-ingest library interface
//!
//! Exposes the pipeline stages for integration testing

pub mod adapters;
pub mod fetch;
pub mod normalize;
pub mod outlier;
pub mod pipeline;
pub mod rate_limit;
pub mod reconcile;
pub mod retry;
pub mod types;
pub mod writer;

pub use crate::pipeline::{Pipeline, RunSummary};
