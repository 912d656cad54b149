//! Open-Meteo archive adapter
//!
//! Parses the hourly-arrays payload and samples the mid-afternoon slot
//! (14:00 local), which brackets the usual race start. Weather requests are
//! configured per race, so the race anchor comes from the request context
//! rather than the payload.

use super::{AdapterError, ExtractionContext, SourceAdapter};
use crate::types::{EntityKind, FieldValue, NaturalKey, RawRecord};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Hour-of-day index sampled from each daily block.
const SAMPLE_HOUR: usize = 14;

pub struct OpenMeteoAdapter;

#[derive(Debug, Deserialize)]
struct Payload {
    hourly: Hourly,
    hourly_units: Option<HourlyUnits>,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    temperature_2m: Vec<f64>,
    relative_humidity_2m: Option<Vec<f64>>,
    precipitation: Option<Vec<f64>>,
    wind_speed_10m: Option<Vec<f64>>,
    wind_direction_10m: Option<Vec<f64>>,
    surface_pressure: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct HourlyUnits {
    temperature_2m: Option<String>,
    surface_pressure: Option<String>,
}

impl SourceAdapter for OpenMeteoAdapter {
    fn extract(
        &self,
        payload: &str,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let race = ctx.race.ok_or_else(|| {
            AdapterError::SchemaMismatch("weather request lacks a race anchor".to_string())
        })?;

        let parsed: Payload = serde_json::from_str(payload)
            .map_err(|e| AdapterError::SchemaMismatch(format!("hourly block: {}", e)))?;

        let hourly = &parsed.hourly;
        if hourly.temperature_2m.len() <= SAMPLE_HOUR {
            return Err(AdapterError::SchemaMismatch(format!(
                "temperature_2m has {} samples, need at least {}",
                hourly.temperature_2m.len(),
                SAMPLE_HOUR + 1
            )));
        }

        let units = parsed.hourly_units.as_ref();
        let mut fields = BTreeMap::new();
        fields.insert(
            "temperature".to_string(),
            with_unit(
                hourly.temperature_2m[SAMPLE_HOUR],
                units.and_then(|u| u.temperature_2m.as_deref()),
                "\u{b0}C",
            ),
        );
        insert_sample(&mut fields, "humidity", &hourly.relative_humidity_2m);
        insert_sample(&mut fields, "precipitation", &hourly.precipitation);
        insert_sample(&mut fields, "wind_speed", &hourly.wind_speed_10m);
        insert_sample(&mut fields, "wind_direction", &hourly.wind_direction_10m);
        if let Some(pressure) = &hourly.surface_pressure {
            if let Some(value) = pressure.get(SAMPLE_HOUR) {
                fields.insert(
                    "pressure".to_string(),
                    with_unit(
                        *value,
                        units.and_then(|u| u.surface_pressure.as_deref()),
                        "hPa",
                    ),
                );
            }
        }

        tracing::debug!(
            source = %ctx.source_id,
            year = race.year,
            round = race.round,
            "weather extraction complete"
        );
        Ok(vec![RawRecord {
            source_id: ctx.source_id.clone(),
            entity_kind: EntityKind::Weather,
            natural_key: NaturalKey::Weather {
                year: race.year,
                round: race.round,
            },
            fields,
            fetched_at: ctx.fetched_at,
            source_priority: ctx.source_priority,
        }])
    }
}

/// Canonical-unit values pass through as floats; anything else stays raw text
/// for the normalizer to convert.
fn with_unit(value: f64, unit: Option<&str>, canonical: &str) -> FieldValue {
    match unit {
        None => FieldValue::Float(value),
        Some(u) if u == canonical => FieldValue::Float(value),
        Some(u) => FieldValue::Text(format!("{} {}", value, u)),
    }
}

fn insert_sample(
    fields: &mut BTreeMap<String, FieldValue>,
    key: &str,
    series: &Option<Vec<f64>>,
) {
    if let Some(series) = series {
        if let Some(value) = series.get(SAMPLE_HOUR) {
            fields.insert(key.to_string(), FieldValue::Float(*value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, context_with_race};
    use super::*;

    fn hourly(values: &[f64]) -> String {
        serde_json::to_string(values).unwrap()
    }

    fn full_day(base: f64) -> Vec<f64> {
        (0..24).map(|h| base + h as f64).collect()
    }

    #[test]
    fn test_samples_hour_fourteen() {
        let payload = format!(
            r#"{{
                "hourly": {{
                    "temperature_2m": {},
                    "relative_humidity_2m": {},
                    "wind_speed_10m": {}
                }}
            }}"#,
            hourly(&full_day(10.0)),
            hourly(&full_day(40.0)),
            hourly(&full_day(5.0)),
        );

        let adapter = OpenMeteoAdapter;
        let records = adapter
            .extract(&payload, &context_with_race("meteo", 3, 2021, 14))
            .unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.entity_kind, EntityKind::Weather);
        assert_eq!(
            record.natural_key,
            NaturalKey::Weather { year: 2021, round: 14 }
        );
        assert_eq!(record.fields.get("temperature"), Some(&FieldValue::Float(24.0)));
        assert_eq!(record.fields.get("humidity"), Some(&FieldValue::Float(54.0)));
        assert_eq!(record.fields.get("wind_speed"), Some(&FieldValue::Float(19.0)));
        assert!(!record.fields.contains_key("pressure"));
    }

    #[test]
    fn test_fahrenheit_stays_raw_for_normalization() {
        let payload = format!(
            r#"{{
                "hourly": {{ "temperature_2m": {} }},
                "hourly_units": {{ "temperature_2m": "°F" }}
            }}"#,
            hourly(&full_day(60.0)),
        );

        let adapter = OpenMeteoAdapter;
        let records = adapter
            .extract(&payload, &context_with_race("meteo", 3, 2021, 14))
            .unwrap();

        assert_eq!(
            records[0].fields.get("temperature"),
            Some(&FieldValue::Text("74 \u{b0}F".to_string()))
        );
    }

    #[test]
    fn test_short_series_is_schema_mismatch() {
        let payload = r#"{ "hourly": { "temperature_2m": [10.0, 11.0] } }"#;

        let adapter = OpenMeteoAdapter;
        let err = adapter
            .extract(payload, &context_with_race("meteo", 3, 2021, 14))
            .unwrap_err();
        assert!(matches!(err, AdapterError::SchemaMismatch(_)));
    }

    #[test]
    fn test_missing_race_anchor_is_rejected() {
        let payload = format!(
            r#"{{ "hourly": {{ "temperature_2m": {} }} }}"#,
            hourly(&full_day(10.0)),
        );

        let adapter = OpenMeteoAdapter;
        let err = adapter.extract(&payload, &context("meteo", 3)).unwrap_err();
        assert!(matches!(err, AdapterError::SchemaMismatch(_)));
    }
}
