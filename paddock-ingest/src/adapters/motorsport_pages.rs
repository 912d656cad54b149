//! Scraped performance-page adapter
//!
//! Parses per-driver performance documents scraped from motorsport result
//! pages: speed aggregates, engine figures and best lap time. Pages carry
//! mixed formats (bare numbers on some, annotated strings like "186.4 mph"
//! on others), so string values stay raw for the normalizer.

use super::{AdapterError, ExtractionContext, SourceAdapter};
use crate::types::{EntityKind, FieldValue, NaturalKey, RawRecord};
use serde::Deserialize;
use std::collections::BTreeMap;

pub struct MotorsportPagesAdapter;

#[derive(Debug, Deserialize)]
struct DriverPerformance {
    driver: String,
    performance: Performance,
}

#[derive(Debug, Deserialize)]
struct Performance {
    speeds: Option<Speeds>,
    engine: Option<Engine>,
    best_lap_time: Option<Measure>,
}

#[derive(Debug, Deserialize)]
struct Speeds {
    avg: Option<Measure>,
    max: Option<Measure>,
}

#[derive(Debug, Deserialize)]
struct Engine {
    avg_rpm: Option<Measure>,
}

/// Scraped cells are either plain numbers or annotated strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Measure {
    Number(f64),
    Raw(String),
}

impl Measure {
    fn into_field(self) -> FieldValue {
        match self {
            Measure::Number(n) => FieldValue::Float(n),
            Measure::Raw(s) => FieldValue::Text(s),
        }
    }
}

impl SourceAdapter for MotorsportPagesAdapter {
    fn extract(
        &self,
        payload: &str,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let race = ctx.race.ok_or_else(|| {
            AdapterError::SchemaMismatch("performance request lacks a race anchor".to_string())
        })?;

        let docs: Vec<DriverPerformance> = serde_json::from_str(payload)
            .map_err(|e| AdapterError::SchemaMismatch(format!("performance documents: {}", e)))?;

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            let mut fields = BTreeMap::new();
            fields.insert("driver".to_string(), FieldValue::Text(doc.driver.clone()));
            if let Some(speeds) = doc.performance.speeds {
                insert_measure(&mut fields, "avg_speed", speeds.avg);
                insert_measure(&mut fields, "max_speed", speeds.max);
            }
            if let Some(engine) = doc.performance.engine {
                insert_measure(&mut fields, "avg_rpm", engine.avg_rpm);
            }
            insert_measure(&mut fields, "best_lap_time", doc.performance.best_lap_time);

            records.push(RawRecord {
                source_id: ctx.source_id.clone(),
                entity_kind: EntityKind::LapRecord,
                natural_key: NaturalKey::LapRecord {
                    year: race.year,
                    round: race.round,
                    driver: doc.driver,
                },
                fields,
                fetched_at: ctx.fetched_at,
                source_priority: ctx.source_priority,
            });
        }

        tracing::debug!(
            source = %ctx.source_id,
            year = race.year,
            round = race.round,
            records = records.len(),
            "performance extraction complete"
        );
        Ok(records)
    }
}

fn insert_measure(fields: &mut BTreeMap<String, FieldValue>, key: &str, measure: Option<Measure>) {
    if let Some(measure) = measure {
        fields.insert(key.to_string(), measure.into_field());
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, context_with_race};
    use super::*;

    const PAYLOAD: &str = r#"[
        {
            "driver": "L. Hamilton",
            "performance": {
                "speeds": { "avg": "186.4 mph", "max": 223.8 },
                "engine": { "avg_rpm": 11450 },
                "best_lap_time": "1:24.812"
            }
        },
        {
            "driver": "M. Verstappen",
            "performance": {
                "speeds": { "avg": 298.1 },
                "best_lap_time": "1:25.110"
            }
        }
    ]"#;

    #[test]
    fn test_extracts_lap_records() {
        let adapter = MotorsportPagesAdapter;
        let records = adapter
            .extract(PAYLOAD, &context_with_race("pages", 2, 2021, 14))
            .unwrap();

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.entity_kind, EntityKind::LapRecord);
        assert_eq!(
            first.natural_key,
            NaturalKey::LapRecord {
                year: 2021,
                round: 14,
                driver: "L. Hamilton".to_string()
            }
        );
        assert_eq!(
            first.fields.get("avg_speed"),
            Some(&FieldValue::Text("186.4 mph".to_string()))
        );
        assert_eq!(first.fields.get("max_speed"), Some(&FieldValue::Float(223.8)));
        assert_eq!(first.fields.get("avg_rpm"), Some(&FieldValue::Float(11450.0)));
        assert_eq!(
            first.fields.get("best_lap_time"),
            Some(&FieldValue::Text("1:24.812".to_string()))
        );

        let second = &records[1];
        assert!(!second.fields.contains_key("max_speed"));
        assert!(!second.fields.contains_key("avg_rpm"));
    }

    #[test]
    fn test_non_array_payload_is_schema_mismatch() {
        let adapter = MotorsportPagesAdapter;
        let err = adapter
            .extract(
                r#"{"driver": "solo"}"#,
                &context_with_race("pages", 2, 2021, 14),
            )
            .unwrap_err();
        assert!(matches!(err, AdapterError::SchemaMismatch(_)));
    }

    #[test]
    fn test_document_without_performance_is_schema_mismatch() {
        let adapter = MotorsportPagesAdapter;
        let err = adapter
            .extract(
                r#"[{"driver": "L. Hamilton"}]"#,
                &context_with_race("pages", 2, 2021, 14),
            )
            .unwrap_err();
        assert!(matches!(err, AdapterError::SchemaMismatch(_)));
    }

    #[test]
    fn test_missing_race_anchor_is_rejected() {
        let adapter = MotorsportPagesAdapter;
        let err = adapter.extract("[]", &context("pages", 2)).unwrap_err();
        assert!(matches!(err, AdapterError::SchemaMismatch(_)));
    }
}
