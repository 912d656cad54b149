//! Source adapters: one per external source format
//!
//! Adapters turn a fetched payload into typed [`RawRecord`]s. The set is
//! closed and selected by configuration, never by sniffing the payload.
//! Missing optional fields become absent fields, not zeros; a missing
//! mandatory structural anchor is a [`AdapterError::SchemaMismatch`], which
//! is surfaced as a run-level alert because it means the source changed
//! format.

use crate::types::{RaceRef, RawRecord, SourceId};
use chrono::{DateTime, Utc};
use paddock_common::config::AdapterKind;
use thiserror::Error;

pub mod ergast;
pub mod motorsport_pages;
pub mod openmeteo;

pub use ergast::ErgastAdapter;
pub use motorsport_pages::MotorsportPagesAdapter;
pub use openmeteo::OpenMeteoAdapter;

/// Adapter failure modes
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A mandatory structural anchor is missing: the source changed format.
    /// Never guessed around; surfaced to the run report.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// Per-fetch context an adapter stamps onto the records it emits
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub source_id: SourceId,
    pub source_priority: u32,
    pub fetched_at: DateTime<Utc>,
    /// Target race for payloads that do not identify one themselves
    pub race: Option<RaceRef>,
}

/// Capability shared by every source adapter
pub trait SourceAdapter: Send + Sync {
    /// Extract typed records from one fetched payload
    fn extract(
        &self,
        payload: &str,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Select the adapter for a configured source
pub fn adapter_for(kind: AdapterKind) -> Box<dyn SourceAdapter> {
    match kind {
        AdapterKind::Ergast => Box::new(ErgastAdapter),
        AdapterKind::Openmeteo => Box::new(OpenMeteoAdapter),
        AdapterKind::MotorsportPages => Box::new(MotorsportPagesAdapter),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub fn context(source: &str, priority: u32) -> ExtractionContext {
        ExtractionContext {
            source_id: SourceId::new(source),
            source_priority: priority,
            fetched_at: Utc.with_ymd_and_hms(2021, 9, 13, 8, 0, 0).unwrap(),
            race: None,
        }
    }

    pub fn context_with_race(
        source: &str,
        priority: u32,
        year: i32,
        round: u32,
    ) -> ExtractionContext {
        ExtractionContext {
            race: Some(RaceRef { year, round }),
            ..context(source, priority)
        }
    }
}
