//! Data hygiene sweeps: remove test/garbage records across related tables.
//!
//! A sweep is always two phases. [`preview`] enumerates every row that would
//! be removed and is the only way to obtain a [`SweepPlan`]; [`apply`]
//! consumes a plan and deletes exactly the previewed ids, children before
//! parents. A dry run stops after the preview.

use crate::cancel::CancelFlag;
use crate::errors::{ReconcileError, ReportedError};
use crate::integrity::{check_integrity, IntegrityRule};
use crate::models::{
    DataIntegrityWarning, MatchedRow, Row, SweepReport, SweepTarget, TableSweep, TargetSelector,
};
use crate::run_log::RunLog;
use crate::store::{value_text, DataStore, Filter};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Case-insensitive substring match over naming fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPredicate {
    needle: String,
}

impl SweepPredicate {
    /// An empty needle would match every row, so it is refused.
    pub fn new(needle: &str) -> Result<Self, ReconcileError> {
        let needle = needle.trim();
        if needle.is_empty() {
            return Err(ReconcileError::Configuration(
                "sweep pattern cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            needle: needle.to_string(),
        })
    }

    pub fn needle(&self) -> &str {
        &self.needle
    }

    /// Filter selecting rows where any of `fields` contains the needle.
    pub fn filter(&self, fields: &[String]) -> Filter {
        Filter::Any(
            fields
                .iter()
                .map(|f| Filter::contains(f.clone(), self.needle.clone()))
                .collect(),
        )
    }
}

/// Everything a sweep needs from the caller.
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub predicate: SweepPredicate,
    pub targets: Vec<SweepTarget>,
    pub dry_run: bool,
    pub integrity_rules: Vec<IntegrityRule>,
}

/// The audited result of a preview. Only obtainable from [`preview`].
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Targets in deletion order (descending dependency rank).
    targets: Vec<SweepTarget>,
    /// Preview outcome per target, same order as `targets`.
    tables: Vec<TableSweep>,
    warnings: Vec<DataIntegrityWarning>,
}

impl SweepPlan {
    pub fn tables(&self) -> &[TableSweep] {
        &self.tables
    }

    pub fn warnings(&self) -> &[DataIntegrityWarning] {
        &self.warnings
    }

    /// The preview as a report, without deleting anything.
    pub fn into_report(self) -> SweepReport {
        SweepReport {
            dry_run: true,
            tables: self.tables,
            warnings: self.warnings,
        }
    }
}

/// The hospital chain: patients matched by name, and everything that points
/// at a matched patient.
pub fn default_targets() -> Vec<SweepTarget> {
    vec![
        SweepTarget::by_fields("patients", 0, &["name"]),
        SweepTarget::referencing("admissions", 1, "patient_id", "patients"),
        SweepTarget::referencing("appointments", 1, "patient_id", "patients"),
        SweepTarget::referencing("transactions", 1, "patient_id", "patients"),
    ]
}

/// Sorts targets into deletion order: highest rank first, ties keep the
/// caller's order.
pub fn deletion_order(targets: &[SweepTarget]) -> Vec<SweepTarget> {
    let mut ordered = targets.to_vec();
    ordered.sort_by(|a, b| b.dependency_rank.cmp(&a.dependency_rank));
    ordered
}

fn identity(row: &Row, target: &SweepTarget) -> Row {
    let mut keep: Vec<&str> = vec![target.id_column.as_str()];
    match &target.selector {
        TargetSelector::Fields { fields } => keep.extend(fields.iter().map(String::as_str)),
        TargetSelector::References { column, .. } => keep.push(column.as_str()),
    }
    keep.into_iter()
        .filter_map(|k| row.get(k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// Enumerates the rows each target would lose. Read-only.
///
/// Parents are enumerated before children so that reference selectors can
/// use their parent's matched ids.
pub async fn preview(
    store: &dyn DataStore,
    predicate: &SweepPredicate,
    targets: &[SweepTarget],
    integrity_rules: &[IntegrityRule],
) -> SweepPlan {
    let ordered = deletion_order(targets);
    let mut outcomes: HashMap<String, Result<Vec<MatchedRow>, ReportedError>> = HashMap::new();

    for target in ordered.iter().rev() {
        let outcome = enumerate(store, predicate, target, &outcomes)
            .await
            .map_err(|e| {
                tracing::warn!("Could not enumerate {}: {}", target.table_name, e);
                ReportedError::from(&e)
            });
        if let Ok(rows) = &outcome {
            tracing::info!(
                "{}: {} row(s) match '{}'",
                target.table_name,
                rows.len(),
                predicate.needle()
            );
        }
        outcomes.insert(target.table_name.clone(), outcome);
    }

    let tables: Vec<TableSweep> = ordered
        .iter()
        .map(|target| match outcomes.remove(&target.table_name) {
            Some(Ok(matched)) => TableSweep {
                table_name: target.table_name.clone(),
                matched,
                deleted: 0,
                error: None,
            },
            Some(Err(error)) => TableSweep {
                table_name: target.table_name.clone(),
                matched: Vec::new(),
                deleted: 0,
                error: Some(error),
            },
            None => TableSweep {
                table_name: target.table_name.clone(),
                matched: Vec::new(),
                deleted: 0,
                error: Some(ReportedError::from(&ReconcileError::Configuration(format!(
                    "{} appears more than once in the sweep",
                    target.table_name
                )))),
            },
        })
        .collect();

    let mut warnings = Vec::new();
    if !integrity_rules.is_empty() {
        let pending: HashMap<String, HashSet<String>> = tables
            .iter()
            .map(|t| {
                (
                    t.table_name.clone(),
                    t.matched.iter().map(|m| value_text(&m.id)).collect(),
                )
            })
            .collect();
        let integrity = check_integrity(store, integrity_rules, &pending).await;
        warnings = integrity.warnings;
        for error in integrity.errors {
            tracing::warn!("Integrity check incomplete: {}", error);
        }
    }

    SweepPlan {
        targets: ordered,
        tables,
        warnings,
    }
}

async fn enumerate(
    store: &dyn DataStore,
    predicate: &SweepPredicate,
    target: &SweepTarget,
    resolved: &HashMap<String, Result<Vec<MatchedRow>, ReportedError>>,
) -> Result<Vec<MatchedRow>, ReconcileError> {
    let filter = match &target.selector {
        TargetSelector::Fields { fields } => {
            if fields.is_empty() {
                return Err(ReconcileError::Configuration(format!(
                    "{} has no naming fields to match",
                    target.table_name
                )));
            }
            predicate.filter(fields)
        }
        TargetSelector::References { column, parent } => {
            let parent_rows = match resolved.get(parent) {
                Some(Ok(rows)) => rows,
                Some(Err(e)) => {
                    return Err(ReconcileError::Rejected(format!(
                        "parent {} could not be enumerated: {}",
                        parent, e
                    )))
                }
                None => {
                    return Err(ReconcileError::Configuration(format!(
                        "{} references {}, which must be in the sweep with a lower rank",
                        target.table_name, parent
                    )))
                }
            };
            if parent_rows.is_empty() {
                return Ok(Vec::new());
            }
            Filter::is_in(
                column.clone(),
                parent_rows.iter().map(|m| m.id.clone()).collect(),
            )
        }
    };

    let rows = store.select(&target.table_name, Some(&filter), None).await?;
    let mut matched = Vec::new();
    for row in rows.into_iter().filter(|r| filter.matches(r)) {
        match row.get(&target.id_column).filter(|v| !v.is_null()) {
            Some(id) => matched.push(MatchedRow {
                id: id.clone(),
                identity: identity(&row, target),
            }),
            None => {
                return Err(ReconcileError::Rejected(format!(
                    "{} row matched without a {} value; refusing to delete by content",
                    target.table_name, target.id_column
                )))
            }
        }
    }
    Ok(matched)
}

/// Deletes the previewed rows, table by table in deletion order.
///
/// A failing table is recorded and the sweep continues, except that a
/// parent is left alone when any table referencing it failed, so referencing
/// rows never outlive what they point at.
pub async fn apply(
    store: &dyn DataStore,
    plan: SweepPlan,
    cancel: &CancelFlag,
    run_log: &RunLog,
    tenant: &str,
) -> SweepReport {
    let SweepPlan {
        targets,
        mut tables,
        warnings,
    } = plan;
    let mut failed: HashSet<String> = tables
        .iter()
        .filter(|t| t.error.is_some())
        .map(|t| t.table_name.clone())
        .collect();

    for (target, table) in targets.iter().zip(tables.iter_mut()) {
        if table.error.is_some() {
            continue;
        }

        if cancel.is_cancelled() {
            table.error = Some(ReportedError::from(&ReconcileError::Cancelled));
            failed.insert(target.table_name.clone());
            continue;
        }

        let blocked_by = targets.iter().find(|other| {
            let references_target = matches!(
                &other.selector,
                TargetSelector::References { parent, .. } if *parent == target.table_name
            );
            references_target && failed.contains(&other.table_name)
        });
        if let Some(child) = blocked_by {
            tracing::warn!(
                "Skipping {}: dependent table {} did not sweep cleanly",
                target.table_name,
                child.table_name
            );
            table.error = Some(ReportedError::from(&ReconcileError::Rejected(format!(
                "skipped because dependent table {} failed",
                child.table_name
            ))));
            failed.insert(target.table_name.clone());
            continue;
        }

        if table.matched.is_empty() {
            continue;
        }

        let ids: Vec<Value> = table.matched.iter().map(|m| m.id.clone()).collect();
        match store
            .delete(&target.table_name, &Filter::is_in(target.id_column.clone(), ids))
            .await
        {
            Ok(deleted) => {
                tracing::info!("Deleted {} row(s) from {}", deleted, target.table_name);
                table.deleted = deleted as usize;
                // Row-level security can filter a delete down silently
                if table.deleted != table.matched.len() {
                    tracing::warn!(
                        "Delete from {} removed {} of {} previewed row(s)",
                        target.table_name,
                        table.deleted,
                        table.matched.len()
                    );
                    table.error = Some(ReportedError::from(&ReconcileError::Rejected(format!(
                        "deleted {} of {} previewed rows",
                        table.deleted,
                        table.matched.len()
                    ))));
                    failed.insert(target.table_name.clone());
                }
            }
            Err(e) => {
                tracing::warn!("Delete from {} failed: {}", target.table_name, e);
                table.error = Some(ReportedError::from(&e));
                failed.insert(target.table_name.clone());
            }
        }
    }

    let report = SweepReport {
        dry_run: false,
        tables,
        warnings,
    };
    run_log.append("sweep", tenant, &report).await;
    report
}

/// Previews and, unless `dry_run`, applies a sweep.
pub async fn sweep(
    store: &dyn DataStore,
    request: &SweepRequest,
    cancel: &CancelFlag,
    run_log: &RunLog,
    tenant: &str,
) -> SweepReport {
    let plan = preview(
        store,
        &request.predicate,
        &request.targets,
        &request.integrity_rules,
    )
    .await;

    for table in plan.tables() {
        let verb = if request.dry_run { "would delete" } else { "deleting" };
        for row in &table.matched {
            let identity = serde_json::Value::Object(row.identity.clone());
            tracing::info!("{} {}: {}", verb, table.table_name, identity);
        }
    }

    if request.dry_run {
        let matched: usize = plan.tables().iter().map(|t| t.matched.len()).sum();
        tracing::info!("Dry run: {} row(s) matched, nothing deleted", matched);
        return plan.into_report();
    }

    apply(store, plan, cancel, run_log, tenant).await
}
