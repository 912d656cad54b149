// Shared types and data contracts for the ingestion pipeline.
//
// These are the explicit contracts between pipeline stages: adapters emit
// RawRecords, the normalizer rewrites them in place (new values, same shape),
// the reconciler folds each NaturalKey group into one CanonicalEntity plus
// ConflictReports, and the outlier gate splits entities into accepted and
// quarantined sets. Everything is immutable once constructed.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Tolerance for float agreement checks.
///
/// Two sources reporting the same physical quantity through different raw
/// units land within this band after unit conversion; differences inside it
/// are not conflicts.
pub const FLOAT_TOLERANCE: f64 = 0.1;

// ============================================================================
// Source identity
// ============================================================================

/// Stable identifier for one external source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Entity kinds and field values
// ============================================================================

/// The closed set of canonical entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Driver,
    Constructor,
    Race,
    RaceResult,
    LapRecord,
    Weather,
    Ranking,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Driver => "driver",
            EntityKind::Constructor => "constructor",
            EntityKind::Race => "race",
            EntityKind::RaceResult => "race_result",
            EntityKind::LapRecord => "lap_record",
            EntityKind::Weather => "weather",
            EntityKind::Ranking => "ranking",
        }
    }

    /// Fields a canonical entity of this kind must carry.
    ///
    /// A mandatory field with no usable value across all sources is emitted
    /// as explicitly missing and reported as an incomplete entity, never
    /// filled with a default.
    pub fn mandatory_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Driver => &["name"],
            EntityKind::Constructor => &["name"],
            EntityKind::Race => &["race_name", "date"],
            EntityKind::RaceResult => &["driver", "constructor", "position"],
            EntityKind::LapRecord => &["driver", "best_lap_time"],
            EntityKind::Weather => &["temperature"],
            EntityKind::Ranking => &["driver", "position", "points"],
        }
    }

    pub fn all() -> &'static [EntityKind] {
        &[
            EntityKind::Driver,
            EntityKind::Constructor,
            EntityKind::Race,
            EntityKind::RaceResult,
            EntityKind::LapRecord,
            EntityKind::Weather,
            EntityKind::Ranking,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single field value in canonical form
///
/// `Unparsed` marks input the normalizer could not interpret. It is carried,
/// never dropped, and never participates in reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    /// Physical quantities, already in the canonical unit for the field
    Float(f64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    /// Raw input the normalizer could not interpret
    Unparsed(String),
}

impl FieldValue {
    pub fn is_unparsed(&self) -> bool {
        matches!(self, FieldValue::Unparsed(_))
    }

    /// Numeric view for the outlier gate; None for non-numeric values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Agreement check used by the reconciler.
    ///
    /// Floats agree within [`FLOAT_TOLERANCE`] so that unit-converted values
    /// from different sources are not reported as conflicts; everything else
    /// must match exactly.
    pub fn approx_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Float(a), FieldValue::Float(b)) => (a - b).abs() <= FLOAT_TOLERANCE,
            (FieldValue::Float(a), FieldValue::Integer(b))
            | (FieldValue::Integer(b), FieldValue::Float(a)) => {
                (a - *b as f64).abs() <= FLOAT_TOLERANCE
            }
            (a, b) => a == b,
        }
    }
}

// ============================================================================
// Natural keys
// ============================================================================

/// Deterministic identifier grouping records about the same real-world
/// entity across sources. Stable under the normalizer's canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NaturalKey {
    Race { year: i32, round: u32 },
    Driver { name: String },
    Constructor { name: String },
    RaceResult { year: i32, round: u32, driver: String },
    LapRecord { year: i32, round: u32, driver: String },
    Weather { year: i32, round: u32 },
    Ranking { year: i32, round: u32, driver: String },
}

impl NaturalKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            NaturalKey::Race { .. } => EntityKind::Race,
            NaturalKey::Driver { .. } => EntityKind::Driver,
            NaturalKey::Constructor { .. } => EntityKind::Constructor,
            NaturalKey::RaceResult { .. } => EntityKind::RaceResult,
            NaturalKey::LapRecord { .. } => EntityKind::LapRecord,
            NaturalKey::Weather { .. } => EntityKind::Weather,
            NaturalKey::Ranking { .. } => EntityKind::Ranking,
        }
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NaturalKey::Race { year, round } => write!(f, "race:{}:{}", year, round),
            NaturalKey::Driver { name } => write!(f, "driver:{}", name),
            NaturalKey::Constructor { name } => write!(f, "constructor:{}", name),
            NaturalKey::RaceResult { year, round, driver } => {
                write!(f, "race_result:{}:{}:{}", year, round, driver)
            }
            NaturalKey::LapRecord { year, round, driver } => {
                write!(f, "lap_record:{}:{}:{}", year, round, driver)
            }
            NaturalKey::Weather { year, round } => write!(f, "weather:{}:{}", year, round),
            NaturalKey::Ranking { year, round, driver } => {
                write!(f, "ranking:{}:{}:{}", year, round, driver)
            }
        }
    }
}

// ============================================================================
// Raw records (adapter output, normalizer input/output)
// ============================================================================

/// One record as extracted from a single source fetch.
///
/// Immutable once created; the normalizer produces a new record rather than
/// mutating. `BTreeMap` keeps field iteration order deterministic, which the
/// idempotence guarantee depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: SourceId,
    pub entity_kind: EntityKind,
    pub natural_key: NaturalKey,
    pub fields: BTreeMap<String, FieldValue>,
    pub fetched_at: DateTime<Utc>,
    /// Priority weight of the originating source; higher wins conflicts
    pub source_priority: u32,
}

impl RawRecord {
    /// Content hash for same-source deduplication.
    ///
    /// Excludes `fetched_at`: a retried fetch returning identical content is
    /// a duplicate even though its timestamp differs.
    pub fn content_hash(&self) -> String {
        #[derive(Serialize)]
        struct HashView<'a> {
            source_id: &'a SourceId,
            entity_kind: EntityKind,
            natural_key: &'a NaturalKey,
            fields: &'a BTreeMap<String, FieldValue>,
        }

        let view = HashView {
            source_id: &self.source_id,
            entity_kind: self.entity_kind,
            natural_key: &self.natural_key,
            fields: &self.fields,
        };
        // BTreeMap ordering makes this serialization canonical
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        format!("{:x}", digest)
    }
}

// ============================================================================
// Canonical entities (reconciler output)
// ============================================================================

/// One canonical field with its contributing sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalField {
    /// `None` means the field is explicitly missing (mandatory field with no
    /// usable value), never a fabricated default
    pub value: Option<FieldValue>,
    /// Every source that supplied the winning value
    pub provenance: Vec<SourceId>,
}

/// The single reconciled representation of one real-world entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub kind: EntityKind,
    pub key: NaturalKey,
    pub fields: BTreeMap<String, CanonicalField>,
}

impl CanonicalEntity {
    /// Union of all sources contributing any field
    pub fn provenance(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> = self
            .fields
            .values()
            .flat_map(|f| f.provenance.iter().cloned())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

// ============================================================================
// Conflict and quarantine reporting
// ============================================================================

/// How a field disagreement was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Highest source priority won
    Priority,
    /// Priorities tied; latest fetch won
    Recency,
    /// Priority and fetch time tied; first record in deterministic order won
    FirstSeen,
}

/// Record of one field-level disagreement between sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub key: NaturalKey,
    pub field: String,
    pub winner: SourceId,
    pub winning_value: FieldValue,
    /// Sources whose values were overridden, with the values they reported
    pub losers: Vec<(SourceId, FieldValue)>,
    pub resolution: Resolution,
}

/// A mandatory field left unresolved after reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncompleteField {
    pub key: NaturalKey,
    pub kind: EntityKind,
    pub field: String,
    /// Raw text the sources supplied when none of it parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Which detector rule flagged a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorRule {
    ZScore,
    Iqr,
}

/// One statistically suspect field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFlag {
    pub field: String,
    pub value: f64,
    pub rule: DetectorRule,
    /// The statistic that tripped the rule (Z-score, or distance past the
    /// IQR fence in fence widths)
    pub statistic: f64,
    pub threshold: f64,
}

/// A canonical entity held for review. Never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub key: NaturalKey,
    pub kind: EntityKind,
    pub entity: CanonicalEntity,
    pub offenders: Vec<FieldFlag>,
}

// ============================================================================
// Fetch bookkeeping (ephemeral, per run)
// ============================================================================

/// The race a request targets, for payloads that are not self-describing
/// (weather archives, scraped performance pages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceRef {
    pub year: i32,
    pub round: u32,
}

/// One request to issue against a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub source_id: SourceId,
    pub url: String,
    /// Target race, when the payload itself does not identify one
    pub race: Option<RaceRef>,
}

/// Classified result of a single fetch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(String),
    /// Retryable: timeouts, 5xx, rate-limit responses, connection resets
    TransientFailure(String),
    /// Not retryable: other 4xx, malformed descriptor
    PermanentFailure(String),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::TransientFailure(_) => "transient_failure",
            FetchOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// Bookkeeping for one attempt; discarded at end of run
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub request: RequestDescriptor,
    pub attempt_number: u32,
    pub outcome_label: &'static str,
    pub timestamp: DateTime<Utc>,
}
