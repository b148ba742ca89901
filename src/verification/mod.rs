// =====================================================
// END-TO-END VERIFICATION
// Client-reported row counts against destination counts
// =====================================================

use crate::destination::Destination;
use crate::error::FlockError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountMismatch {
    pub table: String,
    pub expected: i64,
    pub found: i64,
}

/// Outcome of an advisory check that runs after commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub checked: usize,
    pub mismatches: Vec<CountMismatch>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compares `expected` counts, keyed by schema table name, with the
/// destination. `dest_names` maps a table to the name its rows went to.
pub async fn verify_counts(
    destination: &dyn Destination,
    expected: &HashMap<String, i64>,
    dest_names: &HashMap<String, String>,
) -> Result<VerificationReport, FlockError> {
    let ordered = expected.iter().collect::<BTreeMap<_, _>>();
    let mut report = VerificationReport::default();

    for (table, expected_count) in ordered {
        let dest_name = dest_names
            .get(table)
            .map(String::as_str)
            .unwrap_or(table.as_str());
        let found = destination
            .count_rows(dest_name)
            .await
            .map_err(FlockError::VerificationQuery)?;

        report.checked += 1;
        if found != *expected_count {
            log::warn!(
                "Row count mismatch for '{}': client reported {}, destination has {}",
                table,
                expected_count,
                found
            );
            report.mismatches.push(CountMismatch {
                table: table.clone(),
                expected: *expected_count,
                found,
            });
        }
    }

    log::info!(
        "Verified {} table(s), {} mismatch(es)",
        report.checked,
        report.mismatches.len()
    );
    Ok(report)
}
