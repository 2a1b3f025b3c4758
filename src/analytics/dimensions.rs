//! The dimension catalogue for cohort breakdowns.
//!
//! Each spec names one categorical or bucketed attribute, the physical
//! columns it is usually backed by, the source tables a generated query is
//! expected to read, and the output column convention the renderer relies on.

use serde::{Deserialize, Serialize};

/// One breakdown dimension, immutable.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DimensionSpec {
    /// Stable name; also the result key in `DimensionAnalysis`.
    pub name: &'static str,
    /// Natural-language description of what to group by.
    pub description: &'static str,
    /// Logical column roles the schema cache resolves to physical columns.
    pub logical_columns: &'static [&'static str],
    /// Tables a correct query for this dimension reads from.
    pub expected_tables: &'static [&'static str],
    /// Output columns the generated SQL must produce, in order.
    pub output_columns: &'static [&'static str],
}

/// Which key joins the cohort table to the clinical tables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinKey {
    PatientId,
    EncounterId,
}

impl JoinKey {
    pub fn column(&self) -> &'static str {
        match self {
            JoinKey::PatientId => "patient_id",
            JoinKey::EncounterId => "encounter_id",
        }
    }

    /// Pick the join key by inspecting the SQL that produced the cohort for
    /// lexical hints of one key over the other.
    pub fn infer(cohort_sql: &str) -> Self {
        let lower = cohort_sql.to_lowercase();
        let patient_hits = lower.matches("patient_id").count();
        let encounter_hits = lower.matches("encounter_id").count();
        if encounter_hits > patient_hits {
            JoinKey::EncounterId
        } else {
            JoinKey::PatientId
        }
    }
}

/// The default breakdown set: demographics, visit attributes, site attributes.
pub fn default_dimensions() -> Vec<DimensionSpec> {
    vec![
        DimensionSpec {
            name: "gender",
            description: "patient gender distribution",
            logical_columns: &["gender", "sex"],
            expected_tables: &["patients", "demographics"],
            output_columns: &["gender", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "race",
            description: "patient race distribution",
            logical_columns: &["race"],
            expected_tables: &["patients", "demographics"],
            output_columns: &["race", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "ethnicity",
            description: "patient ethnicity distribution",
            logical_columns: &["ethnicity"],
            expected_tables: &["patients", "demographics"],
            output_columns: &["ethnicity", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "visit_level",
            description: "level of care for each visit",
            logical_columns: &["visit_level", "level_of_care"],
            expected_tables: &["encounters", "visits"],
            output_columns: &[
                "visit_level",
                "patient_count",
                "encounter_count",
                "percentage",
            ],
        },
        DimensionSpec {
            name: "admit_type",
            description: "admission type for each visit",
            logical_columns: &["admit_type", "admission_type"],
            expected_tables: &["encounters", "visits"],
            output_columns: &["admit_type", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "admit_source",
            description: "admission source for each visit",
            logical_columns: &["admit_source", "admission_source"],
            expected_tables: &["encounters", "visits"],
            output_columns: &["admit_source", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "urban_rural",
            description: "urban versus rural site classification",
            logical_columns: &["urban_rural", "urban_rural_status"],
            expected_tables: &["sites", "facilities"],
            output_columns: &["urban_rural", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "teaching_status",
            description: "teaching status of the treating site",
            logical_columns: &["teaching_status", "teaching"],
            expected_tables: &["sites", "facilities"],
            output_columns: &["teaching_status", "patient_count", "percentage"],
        },
        DimensionSpec {
            name: "bed_count",
            description: "site size by licensed bed count bucket",
            logical_columns: &["bed_count", "beds", "bed_size"],
            expected_tables: &["sites", "facilities"],
            output_columns: &["bed_count", "patient_count", "percentage"],
        },
    ]
}
