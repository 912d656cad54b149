//! Cross-source reconciliation
//!
//! Merges normalized records about the same entity into one canonical
//! representation, field by field. Sources that agree pool their provenance;
//! disagreements are resolved by source priority, then fetch recency, then
//! deterministic first-seen order, and every override is reported as a
//! conflict. Mandatory fields with no usable value are emitted as explicitly
//! missing and reported, never defaulted.
//!
//! The whole pass is deterministic: records are deduplicated by content hash,
//! sorted before merging, and grouped through `BTreeMap`, so the same input
//! set always yields the same entities, conflicts, and reports.

use crate::types::{
    CanonicalEntity, CanonicalField, ConflictReport, EntityKind, FieldValue, IncompleteField,
    NaturalKey, RawRecord, Resolution, SourceId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Everything one reconciliation pass produces.
#[derive(Debug, Default)]
pub struct ReconcileOutput {
    pub entities: Vec<CanonicalEntity>,
    pub conflicts: Vec<ConflictReport>,
    pub incomplete: Vec<IncompleteField>,
    /// Records discarded as exact same-content duplicates
    pub duplicates_dropped: usize,
}

/// One source's vote for a field value.
#[derive(Debug, Clone)]
struct Candidate {
    source: SourceId,
    value: FieldValue,
    priority: u32,
    fetched_at: DateTime<Utc>,
}

pub struct Reconciler;

impl Reconciler {
    pub fn reconcile(records: Vec<RawRecord>) -> ReconcileOutput {
        let (records, duplicates_dropped) = dedup_by_content(records);

        let mut groups: BTreeMap<(EntityKind, NaturalKey), Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry((record.entity_kind, record.natural_key.clone()))
                .or_default()
                .push(record);
        }

        let mut output = ReconcileOutput {
            duplicates_dropped,
            ..Default::default()
        };
        for ((kind, key), group) in groups {
            merge_group(kind, key, group, &mut output);
        }

        tracing::info!(
            entities = output.entities.len(),
            conflicts = output.conflicts.len(),
            incomplete = output.incomplete.len(),
            duplicates_dropped = output.duplicates_dropped,
            "reconciliation complete"
        );
        output
    }
}

/// Drops records whose content hash was already seen, keeping the earliest in
/// deterministic order. The hash excludes `fetched_at`, so a re-fetch of
/// unchanged content collapses to one record.
fn dedup_by_content(mut records: Vec<RawRecord>) -> (Vec<RawRecord>, usize) {
    records.sort_by(|a, b| {
        (&a.source_id, a.fetched_at).cmp(&(&b.source_id, b.fetched_at))
    });
    let before = records.len();
    let mut seen = BTreeSet::new();
    records.retain(|record| seen.insert(record.content_hash()));
    let dropped = before - records.len();
    (records, dropped)
}

fn merge_group(
    kind: EntityKind,
    key: NaturalKey,
    group: Vec<RawRecord>,
    output: &mut ReconcileOutput,
) {
    // Union of field names across the group, with each source's vote
    let mut by_field: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for record in &group {
        for (name, value) in &record.fields {
            by_field.entry(name.clone()).or_default().push(Candidate {
                source: record.source_id.clone(),
                value: value.clone(),
                priority: record.source_priority,
                fetched_at: record.fetched_at,
            });
        }
    }

    let mut fields: BTreeMap<String, CanonicalField> = BTreeMap::new();
    for (name, candidates) in by_field {
        let field = resolve_field(&key, &name, candidates, &mut output.conflicts);
        fields.insert(name, field);
    }

    // Mandatory fields with no parsed value are emitted as explicitly
    // missing; an unparsed string moves into the incomplete report instead
    // of posing as a value.
    for mandatory in kind.mandatory_fields() {
        let raw = match fields.get_mut(*mandatory) {
            Some(field) => match field.value.take() {
                Some(FieldValue::Unparsed(raw)) => Some(raw),
                Some(value) => {
                    field.value = Some(value);
                    continue;
                }
                None => None,
            },
            None => {
                fields.insert(
                    mandatory.to_string(),
                    CanonicalField {
                        value: None,
                        provenance: Vec::new(),
                    },
                );
                None
            }
        };
        output.incomplete.push(IncompleteField {
            key: key.clone(),
            kind,
            field: mandatory.to_string(),
            raw,
        });
    }

    output.entities.push(CanonicalEntity { kind, key, fields });
}

/// Resolves one field across its candidates.
///
/// Unparsed values never vote. If every candidate is unparsed the first one
/// is carried so the raw input survives into the output.
fn resolve_field(
    key: &NaturalKey,
    name: &str,
    candidates: Vec<Candidate>,
    conflicts: &mut Vec<ConflictReport>,
) -> CanonicalField {
    let (votes, unparsed): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .partition(|c| !c.value.is_unparsed());

    if votes.is_empty() {
        let first = unparsed
            .into_iter()
            .next()
            .expect("field entry exists only when at least one record carried it");
        return CanonicalField {
            value: Some(first.value),
            provenance: vec![first.source],
        };
    }

    let representative = &votes[0];
    if votes.iter().all(|c| c.value.approx_eq(&representative.value)) {
        let mut provenance: Vec<SourceId> = votes.iter().map(|c| c.source.clone()).collect();
        provenance.sort();
        provenance.dedup();
        return CanonicalField {
            value: Some(representative.value.clone()),
            provenance,
        };
    }

    // Disagreement: priority, then recency, then first-seen
    let mut winner = 0;
    for (i, candidate) in votes.iter().enumerate().skip(1) {
        let best = &votes[winner];
        if candidate.priority > best.priority
            || (candidate.priority == best.priority && candidate.fetched_at > best.fetched_at)
        {
            winner = i;
        }
    }
    let winning = &votes[winner];

    // The label describes what separated the winner from the sources it
    // overrode; agreeing same-priority sources are provenance, not peers.
    let peers: Vec<&Candidate> = votes
        .iter()
        .filter(|c| {
            c.priority == winning.priority && !c.value.approx_eq(&winning.value)
        })
        .collect();
    let resolution = if peers.is_empty() {
        Resolution::Priority
    } else if peers.iter().all(|c| c.fetched_at < winning.fetched_at) {
        Resolution::Recency
    } else {
        Resolution::FirstSeen
    };

    let mut losers: Vec<(SourceId, FieldValue)> = votes
        .iter()
        .filter(|c| !c.value.approx_eq(&winning.value))
        .map(|c| (c.source.clone(), c.value.clone()))
        .collect();
    losers.sort_by(|a, b| a.0.cmp(&b.0));
    losers.dedup();

    let mut provenance: Vec<SourceId> = votes
        .iter()
        .filter(|c| c.value.approx_eq(&winning.value))
        .map(|c| c.source.clone())
        .collect();
    provenance.sort();
    provenance.dedup();

    conflicts.push(ConflictReport {
        key: key.clone(),
        field: name.to_string(),
        winner: winning.source.clone(),
        winning_value: winning.value.clone(),
        losers,
        resolution,
    });

    CanonicalField {
        value: Some(winning.value.clone()),
        provenance,
    }
}
