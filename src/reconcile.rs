//! End-to-end reconciliation: verify both bindings, introspect, diff, plan,
//! execute.

use crate::binding::{verify_binding, BindingVerification, TenantBinding};
use crate::cancel::CancelFlag;
use crate::diff::diff_with_renames;
use crate::errors::{ReconcileError, ReportedError};
use crate::introspect::{introspect, IntrospectOptions};
use crate::migration::{execute, plan};
use crate::models::{
    ColumnRename, ExecutionReport, MigrationStep, SchemaDiff, ShapeOrigin, TableShape,
};
use crate::run_log::RunLog;
use crate::store::DataStore;
use crate::type_hints::TypeHints;
use serde::Serialize;
use std::collections::BTreeMap;

/// A tenant as the orchestrator sees it: who it should be, and how to reach it.
#[derive(Clone, Copy)]
pub struct Tenant<'a> {
    pub binding: &'a TenantBinding,
    pub store: &'a dyn DataStore,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub schema: String,
    pub tables: Vec<String>,
    pub probe_table: String,
    pub dry_run: bool,
    pub allow_probe: bool,
    pub hints: TypeHints,
    pub renames: Vec<ColumnRename>,
    pub known_tenants: BTreeMap<String, String>,
}

/// Per-table outcome of the introspect/diff phase.
#[derive(Debug, Clone, Serialize)]
pub struct TableReconciliation {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<TableShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TableShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<SchemaDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub reference: BindingVerification,
    pub target: BindingVerification,
    /// Why the run stopped before touching any table, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub tables: Vec<TableReconciliation>,
    pub plan: Vec<MigrationStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
    pub dry_run: bool,
}

impl ReconcileReport {
    /// Zero failures anywhere: no aborted run, no failed table, no failed step.
    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
            && self.tables.iter().all(|t| t.error.is_none())
            && self
                .execution
                .as_ref()
                .map(ExecutionReport::is_success)
                .unwrap_or(true)
    }
}

/// Brings `target` up to column parity with `reference`.
pub async fn reconcile(
    reference: Tenant<'_>,
    target: Tenant<'_>,
    options: &ReconcileOptions,
    cancel: &CancelFlag,
    run_log: &RunLog,
) -> ReconcileReport {
    let reference_check = verify_binding(
        reference.binding,
        reference.store,
        &options.probe_table,
        &options.known_tenants,
    )
    .await;
    let target_check = verify_binding(
        target.binding,
        target.store,
        &options.probe_table,
        &options.known_tenants,
    )
    .await;

    let mut report = ReconcileReport {
        reference: reference_check,
        target: target_check,
        aborted: None,
        tables: Vec::new(),
        plan: Vec::new(),
        execution: None,
        dry_run: options.dry_run,
    };

    if let Some(reason) = binding_problem(&report.reference, &report.target, reference, target) {
        tracing::error!("Reconciliation aborted: {}", reason);
        report.aborted = Some(reason);
        return report;
    }

    let mut diffs = Vec::new();
    for table in &options.tables {
        if cancel.is_cancelled() {
            report.aborted = Some("cancelled during introspection".to_string());
            return report;
        }
        let outcome = reconcile_table(reference, target, table, options).await;
        if let Some(diff) = &outcome.diff {
            if !diff.type_drift.is_empty() {
                tracing::warn!(
                    "{}: {} column(s) differ in inferred type; left unchanged",
                    table,
                    diff.type_drift.len()
                );
            }
            if !diff.is_empty() {
                diffs.push(diff.clone());
            }
        }
        report.tables.push(outcome);
    }

    report.plan = plan(&diffs, &options.schema);
    tracing::info!(
        "Planned {} step(s) across {} table(s)",
        report.plan.len(),
        diffs.len()
    );

    if !options.dry_run && !report.plan.is_empty() {
        report.execution = Some(
            execute(
                target.store,
                report.plan.clone(),
                cancel,
                run_log,
                &target.binding.tenant_id,
            )
            .await,
        );
    }

    report
}

fn binding_problem(
    reference_check: &BindingVerification,
    target_check: &BindingVerification,
    reference: Tenant<'_>,
    target: Tenant<'_>,
) -> Option<String> {
    if !reference_check.connected {
        return Some(format!(
            "reference {} is unreachable",
            reference.binding.display_name()
        ));
    }
    if !target_check.connected {
        return Some(format!(
            "target {} is unreachable",
            target.binding.display_name()
        ));
    }
    for (role, check, binding) in [
        ("reference", reference_check, reference.binding),
        ("target", target_check, target.binding),
    ] {
        if check.is_misconfigured() {
            return Some(format!(
                "{} is configured as {} but the connection reached {}",
                role,
                binding.display_name(),
                check.observed_tenant_id.as_deref().unwrap_or("an unknown tenant")
            ));
        }
    }
    if reference.binding.tenant_id == target.binding.tenant_id {
        return Some(format!(
            "reference and target are the same tenant ({})",
            target.binding.tenant_id
        ));
    }
    None
}

async fn reconcile_table(
    reference: Tenant<'_>,
    target: Tenant<'_>,
    table: &str,
    options: &ReconcileOptions,
) -> TableReconciliation {
    let mut outcome = TableReconciliation {
        table: table.to_string(),
        reference: None,
        target: None,
        diff: None,
        error: None,
    };

    let reference_shape = match introspect(
        reference.store,
        table,
        &options.hints,
        IntrospectOptions {
            allow_probe: options.allow_probe,
            reference: None,
        },
    )
    .await
    {
        Ok(shape) => shape,
        Err(e) => {
            tracing::warn!("Skipping {}: reference introspection failed: {}", table, e);
            outcome.error = Some(ReportedError::from(&e));
            return outcome;
        }
    };

    // Nothing to diff against: an empty diff here would claim parity
    if reference_shape.origin == ShapeOrigin::Empty {
        let reason = format!("reference table {} has no rows to derive a shape from", table);
        tracing::warn!("Skipping {}: {}", table, reason);
        outcome.error = Some(ReportedError::from(&ReconcileError::Rejected(reason)));
        outcome.reference = Some(reference_shape);
        return outcome;
    }

    let target_shape = match introspect(
        target.store,
        table,
        &options.hints,
        IntrospectOptions {
            allow_probe: options.allow_probe,
            reference: Some(&reference_shape),
        },
    )
    .await
    {
        Ok(shape) => shape,
        Err(e) => {
            tracing::warn!("Skipping {}: target introspection failed: {}", table, e);
            outcome.reference = Some(reference_shape);
            outcome.error = Some(ReportedError::from(&e));
            return outcome;
        }
    };

    let renames: Vec<ColumnRename> = options
        .renames
        .iter()
        .filter(|r| r.table == table)
        .cloned()
        .collect();
    let diff = diff_with_renames(&reference_shape, &target_shape, &renames);
    tracing::info!(
        "{}: {} missing column(s), {} pending rename(s)",
        table,
        diff.missing_columns.len(),
        diff.renames.len()
    );

    outcome.reference = Some(reference_shape);
    outcome.target = Some(target_shape);
    outcome.diff = Some(diff);
    outcome
}
