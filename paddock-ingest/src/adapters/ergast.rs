//! Ergast-style race data adapter
//!
//! Parses the `MRData` JSON envelope: race tables with per-race results,
//! and driver standings tables. Emits Race, RaceResult, Driver, Constructor
//! and Ranking records. Values the normalizer must canonicalize (names,
//! dates, times, speeds) are carried as raw text.

use super::{AdapterError, ExtractionContext, SourceAdapter};
use crate::types::{EntityKind, FieldValue, NaturalKey, RawRecord};
use serde::Deserialize;
use std::collections::BTreeMap;

pub struct ErgastAdapter;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "MRData")]
    mr_data: MrData,
}

#[derive(Debug, Deserialize)]
struct MrData {
    #[serde(rename = "RaceTable")]
    race_table: Option<RaceTable>,
    #[serde(rename = "StandingsTable")]
    standings_table: Option<StandingsTable>,
}

#[derive(Debug, Deserialize)]
struct RaceTable {
    #[serde(rename = "Races", default)]
    races: Vec<Race>,
}

#[derive(Debug, Deserialize)]
struct Race {
    season: String,
    round: String,
    #[serde(rename = "raceName")]
    race_name: String,
    #[serde(rename = "Circuit")]
    circuit: Option<Circuit>,
    date: Option<String>,
    #[serde(rename = "Results", default)]
    results: Vec<RaceResult>,
}

#[derive(Debug, Deserialize)]
struct Circuit {
    #[serde(rename = "circuitName")]
    circuit_name: String,
}

#[derive(Debug, Deserialize)]
struct RaceResult {
    position: Option<String>,
    points: Option<String>,
    grid: Option<String>,
    #[serde(rename = "Driver")]
    driver: Driver,
    #[serde(rename = "Constructor")]
    constructor: Option<Constructor>,
    #[serde(rename = "Time")]
    time: Option<TimeValue>,
    #[serde(rename = "FastestLap")]
    fastest_lap: Option<FastestLap>,
}

#[derive(Debug, Deserialize)]
struct Driver {
    #[serde(rename = "givenName")]
    given_name: String,
    #[serde(rename = "familyName")]
    family_name: String,
    nationality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Constructor {
    name: String,
    nationality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeValue {
    time: String,
}

#[derive(Debug, Deserialize)]
struct FastestLap {
    rank: Option<String>,
    #[serde(rename = "Time")]
    time: Option<TimeValue>,
    #[serde(rename = "AverageSpeed")]
    average_speed: Option<AverageSpeed>,
}

#[derive(Debug, Deserialize)]
struct AverageSpeed {
    units: Option<String>,
    speed: String,
}

#[derive(Debug, Deserialize)]
struct StandingsTable {
    #[serde(rename = "StandingsLists", default)]
    standings_lists: Vec<StandingsList>,
}

#[derive(Debug, Deserialize)]
struct StandingsList {
    season: String,
    round: Option<String>,
    #[serde(rename = "DriverStandings", default)]
    driver_standings: Vec<DriverStanding>,
}

#[derive(Debug, Deserialize)]
struct DriverStanding {
    position: Option<String>,
    points: Option<String>,
    #[serde(rename = "Driver")]
    driver: Driver,
    #[serde(rename = "Constructors", default)]
    constructors: Vec<Constructor>,
}

impl SourceAdapter for ErgastAdapter {
    fn extract(
        &self,
        payload: &str,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let envelope: Envelope = serde_json::from_str(payload)
            .map_err(|e| AdapterError::SchemaMismatch(format!("MRData envelope: {}", e)))?;

        let mr_data = envelope.mr_data;
        if mr_data.race_table.is_none() && mr_data.standings_table.is_none() {
            return Err(AdapterError::SchemaMismatch(
                "MRData carries neither RaceTable nor StandingsTable".to_string(),
            ));
        }

        let mut records = Vec::new();

        if let Some(table) = mr_data.race_table {
            for race in table.races {
                extract_race(&race, ctx, &mut records)?;
            }
        }

        if let Some(table) = mr_data.standings_table {
            for list in table.standings_lists {
                extract_standings(&list, ctx, &mut records)?;
            }
        }

        tracing::debug!(
            source = %ctx.source_id,
            records = records.len(),
            "ergast extraction complete"
        );
        Ok(records)
    }
}

fn extract_race(
    race: &Race,
    ctx: &ExtractionContext,
    records: &mut Vec<RawRecord>,
) -> Result<(), AdapterError> {
    let (year, round) = parse_race_anchor(&race.season, &race.round)?;

    let mut fields = BTreeMap::new();
    fields.insert("year".to_string(), FieldValue::Integer(year as i64));
    fields.insert("round".to_string(), FieldValue::Integer(round as i64));
    fields.insert(
        "race_name".to_string(),
        FieldValue::Text(race.race_name.clone()),
    );
    if let Some(circuit) = &race.circuit {
        fields.insert(
            "circuit".to_string(),
            FieldValue::Text(circuit.circuit_name.clone()),
        );
    }
    if let Some(date) = &race.date {
        fields.insert("date".to_string(), FieldValue::Text(date.clone()));
    }
    records.push(make_record(
        ctx,
        EntityKind::Race,
        NaturalKey::Race { year, round },
        fields,
    ));

    for result in &race.results {
        let driver_name = full_name(&result.driver);

        // Driver entity
        let mut driver_fields = BTreeMap::new();
        driver_fields.insert("name".to_string(), FieldValue::Text(driver_name.clone()));
        if let Some(nationality) = &result.driver.nationality {
            driver_fields.insert(
                "nationality".to_string(),
                FieldValue::Text(nationality.clone()),
            );
        }
        records.push(make_record(
            ctx,
            EntityKind::Driver,
            NaturalKey::Driver {
                name: driver_name.clone(),
            },
            driver_fields,
        ));

        // Constructor entity
        if let Some(constructor) = &result.constructor {
            let mut constructor_fields = BTreeMap::new();
            constructor_fields.insert(
                "name".to_string(),
                FieldValue::Text(constructor.name.clone()),
            );
            if let Some(nationality) = &constructor.nationality {
                constructor_fields.insert(
                    "nationality".to_string(),
                    FieldValue::Text(nationality.clone()),
                );
            }
            records.push(make_record(
                ctx,
                EntityKind::Constructor,
                NaturalKey::Constructor {
                    name: constructor.name.clone(),
                },
                constructor_fields,
            ));
        }

        // Race result
        let mut result_fields = BTreeMap::new();
        result_fields.insert("driver".to_string(), FieldValue::Text(driver_name.clone()));
        if let Some(constructor) = &result.constructor {
            result_fields.insert(
                "constructor".to_string(),
                FieldValue::Text(constructor.name.clone()),
            );
        }
        insert_text(&mut result_fields, "position", result.position.as_deref());
        insert_text(&mut result_fields, "points", result.points.as_deref());
        insert_text(&mut result_fields, "grid", result.grid.as_deref());
        if let Some(time) = &result.time {
            result_fields.insert("race_time".to_string(), FieldValue::Text(time.time.clone()));
        }
        if let Some(lap) = &result.fastest_lap {
            insert_text(&mut result_fields, "fastest_lap_rank", lap.rank.as_deref());
            if let Some(time) = &lap.time {
                result_fields.insert(
                    "fastest_lap_time".to_string(),
                    FieldValue::Text(time.time.clone()),
                );
            }
            if let Some(speed) = &lap.average_speed {
                let raw = match &speed.units {
                    Some(units) => format!("{} {}", speed.speed, units),
                    None => speed.speed.clone(),
                };
                result_fields.insert("fastest_lap_speed".to_string(), FieldValue::Text(raw));
            }
        }
        records.push(make_record(
            ctx,
            EntityKind::RaceResult,
            NaturalKey::RaceResult {
                year,
                round,
                driver: driver_name,
            },
            result_fields,
        ));
    }

    Ok(())
}

fn extract_standings(
    list: &StandingsList,
    ctx: &ExtractionContext,
    records: &mut Vec<RawRecord>,
) -> Result<(), AdapterError> {
    let round = list.round.as_deref().unwrap_or("0");
    let (year, round) = parse_race_anchor(&list.season, round)?;

    for standing in &list.driver_standings {
        let driver_name = full_name(&standing.driver);

        let mut fields = BTreeMap::new();
        fields.insert("driver".to_string(), FieldValue::Text(driver_name.clone()));
        if let Some(constructor) = standing.constructors.first() {
            fields.insert(
                "constructor".to_string(),
                FieldValue::Text(constructor.name.clone()),
            );
        }
        insert_text(&mut fields, "position", standing.position.as_deref());
        insert_text(&mut fields, "points", standing.points.as_deref());

        records.push(make_record(
            ctx,
            EntityKind::Ranking,
            NaturalKey::Ranking {
                year,
                round,
                driver: driver_name,
            },
            fields,
        ));
    }

    Ok(())
}

/// Season and round anchor every key in the payload; non-numeric values mean
/// the source changed format
fn parse_race_anchor(season: &str, round: &str) -> Result<(i32, u32), AdapterError> {
    let year: i32 = season
        .parse()
        .map_err(|_| AdapterError::SchemaMismatch(format!("season not numeric: '{}'", season)))?;
    let round: u32 = round
        .parse()
        .map_err(|_| AdapterError::SchemaMismatch(format!("round not numeric: '{}'", round)))?;
    Ok((year, round))
}

fn full_name(driver: &Driver) -> String {
    format!("{} {}", driver.given_name, driver.family_name)
}

fn insert_text(fields: &mut BTreeMap<String, FieldValue>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), FieldValue::Text(value.to_string()));
    }
}

fn make_record(
    ctx: &ExtractionContext,
    kind: EntityKind,
    key: NaturalKey,
    fields: BTreeMap<String, FieldValue>,
) -> RawRecord {
    RawRecord {
        source_id: ctx.source_id.clone(),
        entity_kind: kind,
        natural_key: key,
        fields,
        fetched_at: ctx.fetched_at,
        source_priority: ctx.source_priority,
    }
}
