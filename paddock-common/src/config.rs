//! Configuration loading for pipeline runs
//!
//! All tuning knobs live in an external TOML file: per-source request
//! templates, rate-limit bounds, retry budgets, priority weights, identity
//! pools, detector thresholds, and the locations of the alias table and
//! reference distribution files. Nothing here is hardcoded per record.
//!
//! Config path resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `PADDOCK_CONFIG` environment variable

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no CLI path is given
pub const CONFIG_ENV_VAR: &str = "PADDOCK_CONFIG";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Directory receiving per-run output (one subdirectory per run)
    pub output_dir: PathBuf,
    /// Path to the versioned name alias table
    pub alias_table: PathBuf,
    /// Path to the historical reference distributions used by the outlier gate
    pub reference_distributions: PathBuf,
    /// Outlier detector thresholds
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Configured sources, one entry per external system
    #[serde(rename = "source")]
    pub sources: Vec<SourceConfig>,
}

/// Statistical thresholds for the outlier gate
///
/// Externalized because the reference distributions evolve as more seasons
/// of data accumulate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorConfig {
    /// Flag when |Z| exceeds this value
    pub z_threshold: f64,
    /// Flag when outside `iqr_multiplier` x IQR of the quartile fence
    pub iqr_multiplier: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            iqr_multiplier: 1.5,
        }
    }
}

/// Which adapter parses a source's payloads (closed set, selected by config)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Ergast-style race/result/standings JSON
    Ergast,
    /// Open-Meteo hourly weather archive JSON
    Openmeteo,
    /// Scraped per-race performance pages (speeds, rpm, lap times)
    MotorsportPages,
}

/// Day/month ordering declared by the source's locale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    /// DD/MM/YYYY
    DayFirst,
    /// MM/DD/YYYY
    MonthFirst,
    /// YYYY-MM-DD
    Iso,
}

impl Default for DateOrder {
    fn default() -> Self {
        DateOrder::Iso
    }
}

/// One request template, optionally annotated with the race it targets.
///
/// Self-describing payloads (Ergast-style) use the plain string form;
/// weather archives and scraped performance pages need the detailed form so
/// their records can be keyed to a race.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RequestEntry {
    Path(String),
    Detailed {
        path: String,
        year: i32,
        round: u32,
    },
}

impl RequestEntry {
    pub fn path(&self) -> &str {
        match self {
            RequestEntry::Path(path) => path,
            RequestEntry::Detailed { path, .. } => path,
        }
    }

    pub fn race(&self) -> Option<(i32, u32)> {
        match self {
            RequestEntry::Path(_) => None,
            RequestEntry::Detailed { year, round, .. } => Some((*year, *round)),
        }
    }
}

/// Per-source configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Stable source identifier carried into provenance
    pub id: String,
    /// Adapter used to parse this source's payloads
    pub adapter: AdapterKind,
    /// Base URL the request templates append to
    pub base_url: String,
    /// Request templates issued for a run, relative to `base_url`
    pub requests: Vec<RequestEntry>,
    /// Priority weight; higher wins field conflicts
    pub priority: u32,
    /// Lower bound of the randomized pacing interval (seconds)
    pub min_interval_secs: f64,
    /// Upper bound of the randomized pacing interval (seconds)
    pub max_interval_secs: f64,
    /// Attempt budget per request, transient failures included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay after a transient failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Ceiling for the exponential backoff
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Per-request network timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum concurrent in-flight requests for this source
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Client identity pool (user-agent strings), rotated per permit
    pub identities: Vec<String>,
    /// Day/month ordering for this source's date strings
    #[serde(default)]
    pub date_order: DateOrder,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    8_000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    1
}

impl PipelineConfig {
    /// Load and validate a pipeline configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {} failed: {}", path.display(), e)))?;
        let config: PipelineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("parse {} failed: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            sources = config.sources.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("no sources configured".to_string()));
        }
        for source in &self.sources {
            if source.identities.is_empty() {
                return Err(Error::Config(format!(
                    "source '{}' has an empty identity pool",
                    source.id
                )));
            }
            if source.min_interval_secs > source.max_interval_secs {
                return Err(Error::Config(format!(
                    "source '{}': min_interval_secs > max_interval_secs",
                    source.id
                )));
            }
            if source.max_retries == 0 {
                return Err(Error::Config(format!(
                    "source '{}': max_retries must be at least 1",
                    source.id
                )));
            }
            // Adapters whose payloads are not self-describing need a target
            // race on every request
            let needs_race = matches!(
                source.adapter,
                AdapterKind::Openmeteo | AdapterKind::MotorsportPages
            );
            if needs_race {
                for request in &source.requests {
                    if request.race().is_none() {
                        return Err(Error::Config(format!(
                            "source '{}': request '{}' needs year and round",
                            source.id,
                            request.path()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Resolve the config file path.
///
/// The argument parser already folds `PADDOCK_CONFIG` into the CLI value,
/// so this only turns an absent path into a usable error.
pub fn resolve_config_path(cli_arg: Option<&str>) -> Result<PathBuf> {
    match cli_arg {
        Some(path) => Ok(PathBuf::from(path)),
        None => Err(Error::Config(format!(
            "no configuration file; pass --config or set {}",
            CONFIG_ENV_VAR
        ))),
    }
}

/// Versioned name alias table
///
/// Maps source-observed spellings to one canonical key. The table is
/// external configuration, loaded once per run and read-only afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AliasTable {
    /// Table revision, carried for auditing which aliases a run used
    pub version: String,
    /// observed spelling (case folded by the normalizer) -> canonical name
    pub aliases: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read alias table {} failed: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("parse alias table {} failed: {}", path.display(), e)))
    }

    /// Empty table (no aliases configured)
    pub fn empty() -> Self {
        Self {
            version: "0".to_string(),
            aliases: BTreeMap::new(),
        }
    }
}

/// Historical reference distribution for one numeric field
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReferenceDistribution {
    pub mean: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
}

/// Reference distributions keyed by "(entity_kind).(field)"
///
/// e.g. `[distributions."race_result.fastest_lap_speed"]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReferenceConfig {
    #[serde(default)]
    pub distributions: BTreeMap<String, ReferenceDistribution>,
}

impl ReferenceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("read reference file {} failed: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("parse reference file {} failed: {}", path.display(), e))
        })
    }
}
