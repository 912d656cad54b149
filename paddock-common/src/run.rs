//! Run identity and timestamp helpers

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifier for a single pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a fresh run identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
