//! Run orchestration
//!
//! Drives one ingestion run end to end: per-source fetch workers (rate
//! limiting, retries, extraction), then the sequential normalize, reconcile,
//! validate, and write stages over the pooled records.
//!
//! Sources fetch concurrently with each other but sequentially within
//! themselves; a schema mismatch or exhausted retry on one source is counted
//! and logged without stopping the others. Cancellation abandons the
//! in-flight request and stops issuing new ones; the stages still run over
//! whatever was collected, so a cancelled run leaves a well-formed,
//! marked-partial output directory.

use crate::adapters::{adapter_for, AdapterError, ExtractionContext};
use crate::fetch::{Fetcher, Transport};
use crate::normalize::Normalizer;
use crate::outlier::{OutlierDetector, Validation};
use crate::rate_limit::RateLimiter;
use crate::reconcile::Reconciler;
use crate::retry::{RetryCoordinator, RetryPolicy, RequestState, TokioClock};
use crate::types::{
    CanonicalEntity, QuarantineRecord, RaceRef, RawRecord, RequestDescriptor, SourceId,
};
use crate::writer::OutputWriter;
use chrono::{DateTime, Utc};
use paddock_common::config::{AliasTable, DateOrder, PipelineConfig, ReferenceConfig, SourceConfig};
use paddock_common::run::{self, RunId};
use paddock_common::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Per-source fetch bookkeeping, reported in the manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceCounters {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub schema_mismatches: u32,
}

/// Manifest for one run, written as `manifest.json`.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when fetching was cancelled; the output covers what was collected
    pub cancelled: bool,
    pub sources: BTreeMap<String, SourceCounters>,
    pub entities: BTreeMap<String, usize>,
    pub accepted: usize,
    pub conflicts: usize,
    pub incomplete: usize,
    pub quarantined: usize,
    pub duplicates_dropped: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    normalizer: Normalizer,
    detector: OutlierDetector,
}

impl Pipeline {
    /// Loads the alias table and reference distributions named by the config.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let aliases = AliasTable::load(&config.alias_table)?;
        let references = ReferenceConfig::load(&config.reference_distributions)?;
        tracing::info!(
            alias_version = %aliases.version,
            aliases = aliases.aliases.len(),
            reference_fields = references.distributions.len(),
            "external tables loaded"
        );
        let normalizer = Normalizer::new(&aliases);
        let detector = OutlierDetector::new(config.detector.clone(), references);
        Ok(Self {
            config,
            normalizer,
            detector,
        })
    }

    pub async fn run(
        &self,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let run_id = RunId::generate();
        let started_at = run::now();
        tracing::info!(run_id = %run_id, sources = self.config.sources.len(), "run started");

        let writer = OutputWriter::create(&self.config.output_dir, &run_id)?;

        let (sources, records) = self.fetch_all(transport, started_at, &cancel).await?;
        let cancelled = cancel.is_cancelled();
        if cancelled {
            tracing::warn!(run_id = %run_id, "fetch cancelled, writing partial output");
        }

        let normalized = self.normalize_all(records);
        let reconciled = Reconciler::reconcile(normalized);

        let mut accepted: Vec<CanonicalEntity> = Vec::new();
        let mut quarantined: Vec<QuarantineRecord> = Vec::new();
        for entity in reconciled.entities {
            match self.detector.validate(entity) {
                Validation::Accepted(entity) => accepted.push(entity),
                Validation::Quarantined(record) => quarantined.push(record),
            }
        }

        let entities = writer.write_entities(&accepted)?;
        writer.write_conflicts(&reconciled.conflicts)?;
        writer.write_incomplete(&reconciled.incomplete)?;
        writer.write_quarantine(&quarantined)?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: run::now(),
            cancelled,
            sources,
            entities,
            accepted: accepted.len(),
            conflicts: reconciled.conflicts.len(),
            incomplete: reconciled.incomplete.len(),
            quarantined: quarantined.len(),
            duplicates_dropped: reconciled.duplicates_dropped,
        };
        writer.write_manifest(&summary)?;

        tracing::info!(
            run_id = %summary.run_id,
            accepted = accepted.len(),
            quarantined = summary.quarantined,
            conflicts = summary.conflicts,
            cancelled = summary.cancelled,
            dir = %writer.dir().display(),
            "run finished"
        );
        Ok(summary)
    }

    /// Runs one fetch worker per source and pools their records.
    async fn fetch_all(
        &self,
        transport: Arc<dyn Transport>,
        run_base: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(BTreeMap<String, SourceCounters>, Vec<RawRecord>)> {
        let mut workers: JoinSet<(String, SourceCounters, Vec<RawRecord>)> = JoinSet::new();
        for source in self.config.sources.clone() {
            let transport = Arc::clone(&transport);
            let cancel = cancel.clone();
            workers.spawn(async move { fetch_source(source, transport, run_base, cancel).await });
        }

        let mut sources = BTreeMap::new();
        let mut records = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let (source_id, counters, mut source_records) = joined
                .map_err(|e| Error::Internal(format!("fetch worker panicked: {}", e)))?;
            sources.insert(source_id, counters);
            records.append(&mut source_records);
        }
        Ok((sources, records))
    }

    fn normalize_all(&self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        let date_orders: BTreeMap<SourceId, DateOrder> = self
            .config
            .sources
            .iter()
            .map(|s| (SourceId::new(s.id.clone()), s.date_order))
            .collect();

        records
            .into_iter()
            .map(|record| {
                let order = date_orders
                    .get(&record.source_id)
                    .copied()
                    .unwrap_or_default();
                self.normalizer.normalize(record, order)
            })
            .collect()
    }
}

/// Sequentially works through one source's configured requests.
///
/// Records are stamped from the run base plus the request's position, not
/// the wall clock, so response timing never leaks into the recency
/// comparisons downstream and reruns over identical payloads reconcile
/// identically.
async fn fetch_source(
    source: SourceConfig,
    transport: Arc<dyn Transport>,
    run_base: DateTime<Utc>,
    cancel: CancellationToken,
) -> (String, SourceCounters, Vec<RawRecord>) {
    let source_id = SourceId::new(source.id.clone());
    let limiter = RateLimiter::new(&source);
    let fetcher = Fetcher::new(transport, Duration::from_secs(source.timeout_secs));
    let coordinator = RetryCoordinator::new(RetryPolicy::from_source(&source), TokioClock);
    let adapter = adapter_for(source.adapter);

    let mut counters = SourceCounters::default();
    let mut records = Vec::new();

    for (index, entry) in source.requests.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let descriptor = RequestDescriptor {
            source_id: source_id.clone(),
            url: join_url(&source.base_url, entry.path()),
            race: entry.race().map(|(year, round)| RaceRef { year, round }),
        };
        counters.attempted += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = coordinator.run(&descriptor, || async {
                let permit = limiter.acquire().await;
                fetcher.fetch(&descriptor, &permit).await
            }) => outcome,
        };

        if outcome.final_state != RequestState::Succeeded {
            counters.failed += 1;
            tracing::warn!(
                source = %source_id,
                url = %descriptor.url,
                attempts = outcome.attempts.len(),
                outcome = outcome.final_outcome.label(),
                "request gave up"
            );
            continue;
        }

        let body = match outcome.final_outcome {
            crate::types::FetchOutcome::Success(body) => body,
            _ => unreachable!("Succeeded state always carries a success outcome"),
        };
        let ctx = ExtractionContext {
            source_id: source_id.clone(),
            source_priority: source.priority,
            fetched_at: run_base + chrono::Duration::seconds(index as i64),
            race: descriptor.race,
        };
        match adapter.extract(&body, &ctx) {
            Ok(mut extracted) => {
                counters.succeeded += 1;
                records.append(&mut extracted);
            }
            Err(AdapterError::SchemaMismatch(reason)) => {
                // Source-local: alert and keep going
                counters.schema_mismatches += 1;
                tracing::error!(
                    source = %source_id,
                    url = %descriptor.url,
                    reason = %reason,
                    "payload no longer matches expected schema"
                );
            }
        }
    }

    tracing::info!(
        source = %source_id,
        attempted = counters.attempted,
        succeeded = counters.succeeded,
        failed = counters.failed,
        schema_mismatches = counters.schema_mismatches,
        "source fetch complete"
    );
    (source.id, counters, records)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
