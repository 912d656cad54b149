//! Field normalization
//!
//! Total, pure pass over extracted records: converts units into canonical
//! metric forms (km/h, seconds, hPa, Celsius), parses dates per the source's
//! declared ordering, and unifies entity names through the alias table.
//! Normalization never fails a record; a value that cannot be interpreted is
//! kept as `FieldValue::Unparsed` so downstream stages still see it.
//!
//! Running the normalizer over already-normalized records is a no-op, which
//! keeps reruns byte-stable.

use crate::types::{FieldValue, NaturalKey, RawRecord};
use chrono::NaiveDate;
use paddock_common::config::{AliasTable, DateOrder};
use std::collections::BTreeMap;

const MPH_TO_KMH: f64 = 1.609344;
const INHG_TO_HPA: f64 = 33.8639;
const KPA_TO_HPA: f64 = 10.0;
const ATM_TO_HPA: f64 = 1013.25;

/// Minimum Jaro-Winkler similarity for a fuzzy alias match.
const FUZZY_ALIAS_THRESHOLD: f64 = 0.93;

/// How a field's raw value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldClass {
    Name,
    Date,
    Speed,
    Duration,
    Temperature,
    Pressure,
    Integer,
    Float,
    Text,
}

fn classify(field: &str) -> FieldClass {
    match field {
        "name" | "driver" | "constructor" => FieldClass::Name,
        "date" => FieldClass::Date,
        "fastest_lap_speed" | "avg_speed" | "max_speed" | "wind_speed" => FieldClass::Speed,
        "best_lap_time" | "race_time" => FieldClass::Duration,
        "temperature" => FieldClass::Temperature,
        "pressure" => FieldClass::Pressure,
        "position" | "grid" | "round" | "year" | "fastest_lap_rank" => FieldClass::Integer,
        "points" | "avg_rpm" | "humidity" | "precipitation" | "wind_direction" => FieldClass::Float,
        _ => FieldClass::Text,
    }
}

pub struct Normalizer {
    /// Folded alias -> canonical name.
    aliases: BTreeMap<String, String>,
}

impl Normalizer {
    pub fn new(table: &AliasTable) -> Self {
        let aliases = table
            .aliases
            .iter()
            .map(|(alias, canonical)| (fold(alias), canonical.clone()))
            .collect();
        Self { aliases }
    }

    /// Normalizes every field plus the name carried by the natural key.
    pub fn normalize(&self, record: RawRecord, date_order: DateOrder) -> RawRecord {
        let fields = record
            .fields
            .into_iter()
            .map(|(name, value)| {
                let normalized = self.normalize_value(classify(&name), value, date_order);
                (name, normalized)
            })
            .collect();

        RawRecord {
            natural_key: self.normalize_key(record.natural_key),
            fields,
            ..record
        }
    }

    fn normalize_value(
        &self,
        class: FieldClass,
        value: FieldValue,
        date_order: DateOrder,
    ) -> FieldValue {
        // Already-canonical and already-rejected values pass through untouched
        match (&class, &value) {
            (_, FieldValue::Unparsed(_)) => return value,
            (FieldClass::Date, FieldValue::Date(_)) => return value,
            (FieldClass::Integer, FieldValue::Integer(_)) => return value,
            (
                FieldClass::Speed
                | FieldClass::Duration
                | FieldClass::Temperature
                | FieldClass::Pressure
                | FieldClass::Float,
                FieldValue::Float(_),
            ) => return value,
            _ => {}
        }

        match class {
            FieldClass::Name => match value {
                FieldValue::Text(s) => FieldValue::Text(self.canonical_name(&s)),
                other => other,
            },
            FieldClass::Date => convert_text(value, |s| {
                parse_date(s, date_order).map(FieldValue::Date)
            }),
            FieldClass::Speed => convert_numeric(value, parse_speed),
            FieldClass::Duration => convert_numeric(value, parse_duration),
            FieldClass::Temperature => convert_numeric(value, parse_temperature),
            FieldClass::Pressure => convert_numeric(value, parse_pressure),
            FieldClass::Integer => convert_text(value, |s| {
                s.trim().parse::<i64>().ok().map(FieldValue::Integer)
            }),
            FieldClass::Float => convert_text(value, |s| {
                s.trim().parse::<f64>().ok().map(FieldValue::Float)
            }),
            FieldClass::Text => match value {
                FieldValue::Text(s) => FieldValue::Text(collapse_whitespace(&s)),
                other => other,
            },
        }
    }

    fn normalize_key(&self, key: NaturalKey) -> NaturalKey {
        match key {
            NaturalKey::Driver { name } => NaturalKey::Driver {
                name: self.canonical_name(&name),
            },
            NaturalKey::Constructor { name } => NaturalKey::Constructor {
                name: self.canonical_name(&name),
            },
            NaturalKey::RaceResult { year, round, driver } => NaturalKey::RaceResult {
                year,
                round,
                driver: self.canonical_name(&driver),
            },
            NaturalKey::LapRecord { year, round, driver } => NaturalKey::LapRecord {
                year,
                round,
                driver: self.canonical_name(&driver),
            },
            NaturalKey::Ranking { year, round, driver } => NaturalKey::Ranking {
                year,
                round,
                driver: self.canonical_name(&driver),
            },
            passthrough @ (NaturalKey::Race { .. } | NaturalKey::Weather { .. }) => passthrough,
        }
    }

    /// Alias resolution: exact folded lookup first, then a fuzzy pass to
    /// absorb scraping typos. Unmatched names keep their cleaned spelling.
    fn canonical_name(&self, raw: &str) -> String {
        let cleaned = collapse_whitespace(raw);
        let folded = fold(&cleaned);
        if let Some(canonical) = self.aliases.get(&folded) {
            return canonical.clone();
        }

        let mut best: Option<(f64, &String)> = None;
        for (alias, canonical) in &self.aliases {
            let score = strsim::jaro_winkler(&folded, alias);
            if score >= FUZZY_ALIAS_THRESHOLD
                && best.map_or(true, |(best_score, _)| score > best_score)
            {
                best = Some((score, canonical));
            }
        }
        match best {
            Some((_, canonical)) => canonical.clone(),
            None => cleaned,
        }
    }
}

fn convert_text<F>(value: FieldValue, parse: F) -> FieldValue
where
    F: Fn(&str) -> Option<FieldValue>,
{
    match value {
        FieldValue::Text(s) => parse(&s).unwrap_or(FieldValue::Unparsed(s)),
        other => other,
    }
}

/// Numeric classes accept ints as floats in addition to text forms.
fn convert_numeric<F>(value: FieldValue, parse: F) -> FieldValue
where
    F: Fn(&str) -> Option<f64>,
{
    match value {
        FieldValue::Text(s) => match parse(&s) {
            Some(n) => FieldValue::Float(n),
            None => FieldValue::Unparsed(s),
        },
        FieldValue::Integer(i) => FieldValue::Float(i as f64),
        other => other,
    }
}

fn parse_speed(raw: &str) -> Option<f64> {
    let (value, unit) = split_unit(raw)?;
    match unit.to_ascii_lowercase().as_str() {
        "" | "kph" | "km/h" => Some(value),
        "mph" => Some(value * MPH_TO_KMH),
        _ => None,
    }
}

/// Lap and race times: "M:SS.mmm", "H:MM:SS.mmm", or bare seconds.
fn parse_duration(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [seconds] => seconds.parse::<f64>().ok().filter(|s| *s >= 0.0),
        [minutes, seconds] => {
            let m = minutes.parse::<u32>().ok()?;
            let s = seconds.parse::<f64>().ok().filter(|s| *s >= 0.0 && *s < 60.0)?;
            Some(m as f64 * 60.0 + s)
        }
        [hours, minutes, seconds] => {
            let h = hours.parse::<u32>().ok()?;
            let m = minutes.parse::<u32>().ok().filter(|m| *m < 60)?;
            let s = seconds.parse::<f64>().ok().filter(|s| *s >= 0.0 && *s < 60.0)?;
            Some(h as f64 * 3600.0 + m as f64 * 60.0 + s)
        }
        _ => None,
    }
}

fn parse_temperature(raw: &str) -> Option<f64> {
    let (value, unit) = split_unit(raw)?;
    match unit {
        "" | "\u{b0}C" | "C" => Some(value),
        "\u{b0}F" | "F" => Some((value - 32.0) * 5.0 / 9.0),
        _ => None,
    }
}

fn parse_pressure(raw: &str) -> Option<f64> {
    let (value, unit) = split_unit(raw)?;
    match unit.to_ascii_lowercase().as_str() {
        "" | "hpa" => Some(value),
        "inhg" => Some(value * INHG_TO_HPA),
        "kpa" => Some(value * KPA_TO_HPA),
        "atm" => Some(value * ATM_TO_HPA),
        _ => None,
    }
}

/// Splits "186.4 mph" into (186.4, "mph"); a bare number yields ("", number).
fn split_unit(raw: &str) -> Option<(f64, &str)> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let value: f64 = raw[..split_at].parse().ok()?;
    Some((value, raw[split_at..].trim()))
}

fn parse_date(raw: &str, order: DateOrder) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    let formats: &[&str] = match order {
        DateOrder::Iso => &["%Y/%m/%d"],
        DateOrder::DayFirst => &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"],
        DateOrder::MonthFirst => &["%m/%d/%Y", "%m-%d-%Y"],
    };
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercases and strips common Latin diacritics for alias matching.
fn fold(s: &str) -> String {
    s.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            '\u{e0}'..='\u{e5}' => 'a',
            '\u{e7}' => 'c',
            '\u{e8}'..='\u{eb}' => 'e',
            '\u{ec}'..='\u{ef}' => 'i',
            '\u{f1}' => 'n',
            '\u{f2}'..='\u{f6}' | '\u{f8}' => 'o',
            '\u{f9}'..='\u{fc}' => 'u',
            '\u{fd}' | '\u{ff}' => 'y',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKind, SourceId, FLOAT_TOLERANCE};
    use chrono::Utc;

    fn table(pairs: &[(&str, &str)]) -> AliasTable {
        AliasTable {
            version: "test".to_string(),
            aliases: pairs
                .iter()
                .map(|(a, c)| (a.to_string(), c.to_string()))
                .collect(),
        }
    }

    fn record(kind: EntityKind, key: NaturalKey, fields: &[(&str, FieldValue)]) -> RawRecord {
        RawRecord {
            source_id: SourceId::new("test"),
            entity_kind: kind,
            natural_key: key,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            fetched_at: Utc::now(),
            source_priority: 1,
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(&table(&[
            ("L. Hamilton", "Lewis Hamilton"),
            ("Kimi Raikkonen", "Kimi R\u{e4}ikk\u{f6}nen"),
        ]))
    }

    #[test]
    fn test_mph_converts_to_kmh() {
        let n = normalizer();
        let rec = record(
            EntityKind::LapRecord,
            NaturalKey::LapRecord {
                year: 2021,
                round: 14,
                driver: "Lewis Hamilton".to_string(),
            },
            &[("avg_speed", FieldValue::Text("186.4 mph".to_string()))],
        );
        let out = n.normalize(rec, DateOrder::Iso);
        match out.fields.get("avg_speed") {
            Some(FieldValue::Float(v)) => assert!((v - 299.9).abs() < FLOAT_TOLERANCE),
            other => panic!("expected float speed, got {:?}", other),
        }
    }

    #[test]
    fn test_lap_time_formats() {
        assert!((parse_duration("1:24.812").unwrap() - 84.812).abs() < 1e-9);
        assert!((parse_duration("1:21:54.365").unwrap() - 4914.365).abs() < 1e-9);
        assert!((parse_duration("84.812").unwrap() - 84.812).abs() < 1e-9);
        assert_eq!(parse_duration("1:75.0"), None);
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn test_pressure_and_temperature_units() {
        assert!((parse_pressure("29.92 inHg").unwrap() - 1013.208).abs() < 0.01);
        assert!((parse_pressure("101.3 kPa").unwrap() - 1013.0).abs() < 1e-9);
        assert!((parse_temperature("74 \u{b0}F").unwrap() - 23.333).abs() < 0.001);
        assert!((parse_temperature("23.5").unwrap() - 23.5).abs() < 1e-9);
    }

    #[test]
    fn test_date_order_disambiguates() {
        assert_eq!(
            parse_date("12/09/2021", DateOrder::DayFirst),
            NaiveDate::from_ymd_opt(2021, 9, 12)
        );
        assert_eq!(
            parse_date("09/12/2021", DateOrder::MonthFirst),
            NaiveDate::from_ymd_opt(2021, 9, 12)
        );
        // ISO always wins regardless of declared order
        assert_eq!(
            parse_date("2021-09-12", DateOrder::DayFirst),
            NaiveDate::from_ymd_opt(2021, 9, 12)
        );
    }

    #[test]
    fn test_alias_unifies_names_and_key() {
        let n = normalizer();
        let rec = record(
            EntityKind::RaceResult,
            NaturalKey::RaceResult {
                year: 2021,
                round: 14,
                driver: "L. Hamilton".to_string(),
            },
            &[("driver", FieldValue::Text("L. Hamilton".to_string()))],
        );
        let out = n.normalize(rec, DateOrder::Iso);
        assert_eq!(
            out.natural_key,
            NaturalKey::RaceResult {
                year: 2021,
                round: 14,
                driver: "Lewis Hamilton".to_string()
            }
        );
        assert_eq!(
            out.fields.get("driver"),
            Some(&FieldValue::Text("Lewis Hamilton".to_string()))
        );
    }

    #[test]
    fn test_diacritic_fold_matches_alias() {
        let n = normalizer();
        assert_eq!(
            n.canonical_name("KIMI R\u{c4}IKK\u{d6}NEN"),
            "Kimi R\u{e4}ikk\u{f6}nen"
        );
    }

    #[test]
    fn test_fuzzy_alias_absorbs_typo() {
        let n = normalizer();
        assert_eq!(n.canonical_name("Kimi Raikonen"), "Kimi R\u{e4}ikk\u{f6}nen");
    }

    #[test]
    fn test_unknown_name_keeps_cleaned_spelling() {
        let n = normalizer();
        assert_eq!(n.canonical_name("  Esteban   Ocon "), "Esteban Ocon");
    }

    #[test]
    fn test_unparsable_value_is_preserved_not_dropped() {
        let n = normalizer();
        let rec = record(
            EntityKind::Race,
            NaturalKey::Race { year: 2021, round: 14 },
            &[("date", FieldValue::Text("next sunday".to_string()))],
        );
        let out = n.normalize(rec, DateOrder::Iso);
        assert_eq!(
            out.fields.get("date"),
            Some(&FieldValue::Unparsed("next sunday".to_string()))
        );
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let n = normalizer();
        let rec = record(
            EntityKind::RaceResult,
            NaturalKey::RaceResult {
                year: 2021,
                round: 14,
                driver: "L. Hamilton".to_string(),
            },
            &[
                ("driver", FieldValue::Text("L. Hamilton".to_string())),
                ("fastest_lap_speed", FieldValue::Text("186.4 mph".to_string())),
                ("position", FieldValue::Text("1".to_string())),
                ("race_time", FieldValue::Text("bogus:time".to_string())),
            ],
        );
        let once = n.normalize(rec, DateOrder::Iso);
        let twice = n.normalize(once.clone(), DateOrder::Iso);
        assert_eq!(once, twice);
    }
}
