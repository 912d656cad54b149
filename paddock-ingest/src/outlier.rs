//! Statistical validation gate
//!
//! Checks numeric canonical fields against externally configured reference
//! distributions. A value past the Z-score threshold or outside the Tukey
//! IQR fences flags its whole entity for quarantine; quarantined entities are
//! written to a review file with every offending field, never dropped.
//!
//! Fields without a configured reference distribution are not judged.

use crate::types::{CanonicalEntity, DetectorRule, FieldFlag, QuarantineRecord};
use paddock_common::config::{DetectorConfig, ReferenceConfig, ReferenceDistribution};

/// Verdict for one canonical entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accepted(CanonicalEntity),
    Quarantined(QuarantineRecord),
}

pub struct OutlierDetector {
    config: DetectorConfig,
    references: ReferenceConfig,
}

impl OutlierDetector {
    pub fn new(config: DetectorConfig, references: ReferenceConfig) -> Self {
        Self { config, references }
    }

    pub fn validate(&self, entity: CanonicalEntity) -> Validation {
        let mut offenders = Vec::new();

        for (name, field) in &entity.fields {
            let Some(value) = field.value.as_ref().and_then(|v| v.as_f64()) else {
                continue;
            };
            let reference_key = format!("{}.{}", entity.kind, name);
            let Some(reference) = self.references.distributions.get(&reference_key) else {
                continue;
            };

            if let Some(flag) = self.z_score_flag(name, value, reference) {
                offenders.push(flag);
            }
            if let Some(flag) = self.iqr_flag(name, value, reference) {
                offenders.push(flag);
            }
        }

        if offenders.is_empty() {
            Validation::Accepted(entity)
        } else {
            tracing::warn!(
                key = %entity.key,
                kind = %entity.kind,
                offenders = offenders.len(),
                "entity quarantined"
            );
            Validation::Quarantined(QuarantineRecord {
                key: entity.key.clone(),
                kind: entity.kind,
                entity,
                offenders,
            })
        }
    }

    fn z_score_flag(
        &self,
        field: &str,
        value: f64,
        reference: &ReferenceDistribution,
    ) -> Option<FieldFlag> {
        // A degenerate distribution cannot score
        if reference.std_dev <= 0.0 {
            return None;
        }
        let z = (value - reference.mean).abs() / reference.std_dev;
        if z > self.config.z_threshold {
            Some(FieldFlag {
                field: field.to_string(),
                value,
                rule: DetectorRule::ZScore,
                statistic: z,
                threshold: self.config.z_threshold,
            })
        } else {
            None
        }
    }

    fn iqr_flag(
        &self,
        field: &str,
        value: f64,
        reference: &ReferenceDistribution,
    ) -> Option<FieldFlag> {
        let iqr = reference.q3 - reference.q1;
        if iqr <= 0.0 {
            return None;
        }
        // Distance past the nearer quartile, in IQR widths
        let statistic = if value > reference.q3 {
            (value - reference.q3) / iqr
        } else if value < reference.q1 {
            (reference.q1 - value) / iqr
        } else {
            return None;
        };
        if statistic > self.config.iqr_multiplier {
            Some(FieldFlag {
                field: field.to_string(),
                value,
                rule: DetectorRule::Iqr,
                statistic,
                threshold: self.config.iqr_multiplier,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanonicalField, EntityKind, FieldValue, NaturalKey, SourceId};
    use std::collections::BTreeMap;

    fn references(key: &str, dist: ReferenceDistribution) -> ReferenceConfig {
        let mut distributions = BTreeMap::new();
        distributions.insert(key.to_string(), dist);
        ReferenceConfig { distributions }
    }

    fn lap_entity(best_lap_seconds: f64) -> CanonicalEntity {
        let mut fields = BTreeMap::new();
        fields.insert(
            "best_lap_time".to_string(),
            CanonicalField {
                value: Some(FieldValue::Float(best_lap_seconds)),
                provenance: vec![SourceId::new("pages")],
            },
        );
        fields.insert(
            "driver".to_string(),
            CanonicalField {
                value: Some(FieldValue::Text("Lewis Hamilton".to_string())),
                provenance: vec![SourceId::new("pages")],
            },
        );
        CanonicalEntity {
            kind: EntityKind::LapRecord,
            key: NaturalKey::LapRecord {
                year: 2021,
                round: 14,
                driver: "Lewis Hamilton".to_string(),
            },
            fields,
        }
    }

    fn detector(references: ReferenceConfig) -> OutlierDetector {
        OutlierDetector::new(DetectorConfig::default(), references)
    }

    #[test]
    fn test_plausible_value_accepted() {
        let d = detector(references(
            "lap_record.best_lap_time",
            ReferenceDistribution {
                mean: 85.0,
                std_dev: 3.0,
                q1: 83.0,
                q3: 88.0,
            },
        ));
        let entity = lap_entity(84.8);
        assert_eq!(d.validate(entity.clone()), Validation::Accepted(entity));
    }

    #[test]
    fn test_z_score_outlier_quarantines_whole_entity() {
        let d = detector(references(
            "lap_record.best_lap_time",
            ReferenceDistribution {
                mean: 85.0,
                std_dev: 3.0,
                q1: 0.0,
                q3: 0.0,
            },
        ));
        // z = (200 - 85) / 3 > default threshold of 3.0
        match d.validate(lap_entity(200.0)) {
            Validation::Quarantined(record) => {
                assert_eq!(record.offenders.len(), 1);
                let flag = &record.offenders[0];
                assert_eq!(flag.rule, DetectorRule::ZScore);
                assert_eq!(flag.field, "best_lap_time");
                assert!(flag.statistic > flag.threshold);
                assert_eq!(record.entity.fields.len(), 2);
            }
            other => panic!("expected quarantine, got {:?}", other),
        }
    }

    #[test]
    fn test_iqr_fence_flags_low_values() {
        let d = detector(references(
            "lap_record.best_lap_time",
            ReferenceDistribution {
                mean: 0.0,
                std_dev: 0.0,
                q1: 83.0,
                q3: 88.0,
            },
        ));
        // 70 is (83 - 70) / 5 = 2.6 IQRs below Q1, past the 1.5 fence
        match d.validate(lap_entity(70.0)) {
            Validation::Quarantined(record) => {
                assert_eq!(record.offenders[0].rule, DetectorRule::Iqr);
            }
            other => panic!("expected quarantine, got {:?}", other),
        }
    }

    #[test]
    fn test_field_without_reference_is_not_judged() {
        let d = detector(references(
            "weather.temperature",
            ReferenceDistribution {
                mean: 20.0,
                std_dev: 1.0,
                q1: 18.0,
                q3: 22.0,
            },
        ));
        let entity = lap_entity(10_000.0);
        assert_eq!(d.validate(entity.clone()), Validation::Accepted(entity));
    }

    #[test]
    fn test_degenerate_distribution_does_not_flag() {
        let d = detector(references(
            "lap_record.best_lap_time",
            ReferenceDistribution {
                mean: 85.0,
                std_dev: 0.0,
                q1: 85.0,
                q3: 85.0,
            },
        ));
        let entity = lap_entity(200.0);
        assert_eq!(d.validate(entity.clone()), Validation::Accepted(entity));
    }
}
