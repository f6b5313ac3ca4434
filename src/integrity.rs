//! Referential sanity checks over flagged rows.
//!
//! Findings are reported as [`DataIntegrityWarning`]s and never corrected.

use crate::errors::{ReconcileError, ReportedError};
use crate::models::DataIntegrityWarning;
use crate::store::{value_text, DataStore, Filter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Rows of `table` whose `flag_column` equals `flag_value` must point, via
/// `owner_column`, at an existing row of `owner_table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityRule {
    pub table: String,
    pub flag_column: String,
    pub flag_value: Value,
    pub owner_column: String,
    pub owner_table: String,
    #[serde(default = "default_id")]
    pub owner_id_column: String,
}

fn default_id() -> String {
    "id".to_string()
}

impl IntegrityRule {
    pub fn new(
        table: &str,
        flag_column: &str,
        flag_value: impl Into<Value>,
        owner_column: &str,
        owner_table: &str,
    ) -> Self {
        Self {
            table: table.to_string(),
            flag_column: flag_column.to_string(),
            flag_value: flag_value.into(),
            owner_column: owner_column.to_string(),
            owner_table: owner_table.to_string(),
            owner_id_column: default_id(),
        }
    }
}

/// The bed-management invariant: an occupied bed belongs to a patient.
pub fn default_rules() -> Vec<IntegrityRule> {
    vec![IntegrityRule::new(
        "beds",
        "status",
        "occupied",
        "patient_id",
        "patients",
    )]
}

/// Warnings found plus any lookups that could not be performed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub warnings: Vec<DataIntegrityWarning>,
    pub errors: Vec<ReportedError>,
}

/// Evaluates `rules` against the store.
///
/// `pending_removal` maps a table to the ids about to be deleted from it; a
/// flagged row whose owner is among them is reported as well.
pub async fn check_integrity(
    store: &dyn DataStore,
    rules: &[IntegrityRule],
    pending_removal: &HashMap<String, HashSet<String>>,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    for rule in rules {
        if let Err(e) = check_rule(store, rule, pending_removal, &mut report.warnings).await {
            tracing::warn!("Integrity check on {} could not run: {}", rule.table, e);
            report.errors.push(ReportedError::from(&e));
        }
    }
    report
}

async fn check_rule(
    store: &dyn DataStore,
    rule: &IntegrityRule,
    pending_removal: &HashMap<String, HashSet<String>>,
    warnings: &mut Vec<DataIntegrityWarning>,
) -> Result<(), ReconcileError> {
    let flag = Filter::Eq {
        column: rule.flag_column.clone(),
        value: rule.flag_value.clone(),
    };
    let flagged = store.select(&rule.table, Some(&flag), None).await?;
    let flag_text = value_text(&rule.flag_value);

    let mut owned = Vec::new();
    for row in &flagged {
        let row_id = row.get("id").cloned().unwrap_or(Value::Null);
        match row.get(&rule.owner_column).filter(|v| !v.is_null()) {
            Some(owner) => owned.push((row_id, owner.clone())),
            None => warnings.push(DataIntegrityWarning {
                table: rule.table.clone(),
                row_id,
                message: format!(
                    "{} is '{}' but {} is empty",
                    rule.flag_column, flag_text, rule.owner_column
                ),
            }),
        }
    }
    if owned.is_empty() {
        return Ok(());
    }

    let owner_ids: Vec<Value> = owned.iter().map(|(_, owner)| owner.clone()).collect();
    let existing: HashSet<String> = store
        .select(
            &rule.owner_table,
            Some(&Filter::is_in(rule.owner_id_column.clone(), owner_ids)),
            None,
        )
        .await?
        .iter()
        .filter_map(|r| r.get(&rule.owner_id_column).map(value_text))
        .collect();
    let removing = pending_removal.get(&rule.owner_table);

    for (row_id, owner) in owned {
        let owner_text = value_text(&owner);
        let message = if !existing.contains(&owner_text) {
            format!(
                "{} is '{}' but {} {} does not exist",
                rule.flag_column, flag_text, rule.owner_table, owner_text
            )
        } else if removing.map(|ids| ids.contains(&owner_text)).unwrap_or(false) {
            format!(
                "{} is '{}' for {} {} which is selected for removal",
                rule.flag_column, flag_text, rule.owner_table, owner_text
            )
        } else {
            continue;
        };
        warnings.push(DataIntegrityWarning {
            table: rule.table.clone(),
            row_id,
            message,
        });
    }
    Ok(())
}
