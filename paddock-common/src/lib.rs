//! Shared types for the paddock data pipeline
//!
//! Holds the error type, configuration loading, and run identity helpers
//! used by the ingestion crate.

pub mod config;
pub mod error;
pub mod run;

pub use error::{Error, Result};
