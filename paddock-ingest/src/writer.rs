//! Run output
//!
//! Every run writes into its own `run-<run_id>/` directory under the
//! configured output root. Directories are append-only: a run never touches
//! another run's output, and a collision on the run directory is an error
//! rather than an overwrite. All files are serialized from pre-sorted data,
//! so identical pipeline output produces byte-identical files.
//!
//! Layout:
//!   run-<run_id>/
//!     <entity_kind>.json   one file per kind with any entities
//!     conflicts.json
//!     incomplete.json
//!     quarantine.json
//!     manifest.json        written last, marks the run complete

use crate::types::{CanonicalEntity, ConflictReport, IncompleteField, QuarantineRecord, SourceId};
use paddock_common::run::RunId;
use paddock_common::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct OutputWriter {
    run_dir: PathBuf,
}

impl OutputWriter {
    /// Creates the run directory. Fails if it already exists; output is
    /// append-only across runs.
    pub fn create(output_dir: &Path, run_id: &RunId) -> Result<Self> {
        let run_dir = output_dir.join(format!("run-{}", run_id));
        if run_dir.exists() {
            return Err(Error::InvalidInput(format!(
                "run directory already exists: {}",
                run_dir.display()
            )));
        }
        fs::create_dir_all(&run_dir)?;
        tracing::info!(dir = %run_dir.display(), "run directory created");
        Ok(Self { run_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.run_dir
    }

    /// Writes one file per entity kind, entities sorted by natural key, each
    /// with its contributing-source list. Returns per-kind counts for the
    /// manifest.
    pub fn write_entities(
        &self,
        entities: &[CanonicalEntity],
    ) -> Result<BTreeMap<String, usize>> {
        // Storage-facing record: the entity plus its pooled provenance
        #[derive(Serialize)]
        struct EntityRecord<'a> {
            #[serde(flatten)]
            entity: &'a CanonicalEntity,
            provenance: Vec<SourceId>,
        }

        let mut by_kind: BTreeMap<&'static str, Vec<&CanonicalEntity>> = BTreeMap::new();
        for entity in entities {
            by_kind.entry(entity.kind.as_str()).or_default().push(entity);
        }

        let mut counts = BTreeMap::new();
        for (kind, mut group) in by_kind {
            group.sort_by(|a, b| a.key.cmp(&b.key));
            let records: Vec<EntityRecord<'_>> = group
                .iter()
                .map(|entity| EntityRecord {
                    entity,
                    provenance: entity.provenance(),
                })
                .collect();
            self.write_json(&format!("{}.json", kind), &records)?;
            counts.insert(kind.to_string(), group.len());
        }
        Ok(counts)
    }

    pub fn write_conflicts(&self, conflicts: &[ConflictReport]) -> Result<()> {
        let mut sorted: Vec<&ConflictReport> = conflicts.iter().collect();
        sorted.sort_by(|a, b| (&a.key, &a.field).cmp(&(&b.key, &b.field)));
        self.write_json("conflicts.json", &sorted)
    }

    pub fn write_incomplete(&self, incomplete: &[IncompleteField]) -> Result<()> {
        let mut sorted: Vec<&IncompleteField> = incomplete.iter().collect();
        sorted.sort_by(|a, b| (&a.key, &a.field).cmp(&(&b.key, &b.field)));
        self.write_json("incomplete.json", &sorted)
    }

    pub fn write_quarantine(&self, quarantined: &[QuarantineRecord]) -> Result<()> {
        let mut sorted: Vec<&QuarantineRecord> = quarantined.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        self.write_json("quarantine.json", &sorted)
    }

    /// The manifest is written last so its presence marks a completed (or
    /// deliberately partial) run.
    pub fn write_manifest<T: Serialize>(&self, manifest: &T) -> Result<()> {
        self.write_json("manifest.json", manifest)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.run_dir.join(name);
        let mut body = serde_json::to_vec_pretty(value)?;
        body.push(b'\n');
        fs::write(&path, body)?;
        tracing::debug!(file = %path.display(), "output file written");
        Ok(())
    }
}
