use crate::cancel::CancelFlag;
use crate::errors::{ErrorKind, ReconcileError, ReportedError};
use crate::models::{ColumnShape, ExecutionReport, FailedStep, MigrationStep, SchemaDiff, StepKind};
use crate::pg_store::quote_ident;
use crate::run_log::RunLog;
use crate::store::DataStore;
use chrono::Utc;

/// Statement adding `column` to `schema.table` unless it already exists.
///
/// Columns are always added nullable: a NOT NULL column without a default
/// cannot be added to a populated table.
pub fn add_column_statement(schema: &str, table: &str, column: &ColumnShape) -> String {
    format!(
        "ALTER TABLE {}.{} ADD COLUMN IF NOT EXISTS {} {};",
        quote_ident(schema),
        quote_ident(table),
        quote_ident(&column.name),
        column.inferred_type.sql_type()
    )
}

/// Statement renaming a column, guarded so it only fires while the old name
/// exists and the new one does not.
pub fn rename_column_statement(schema: &str, table: &str, from: &str, to: &str) -> String {
    let exists = |column: &str| {
        format!(
            "SELECT 1 FROM information_schema.columns WHERE table_schema = {} AND table_name = {} AND column_name = {}",
            quote_literal(schema),
            quote_literal(table),
            quote_literal(column)
        )
    };
    format!(
        "DO $$ BEGIN IF EXISTS ({}) AND NOT EXISTS ({}) THEN ALTER TABLE {}.{} RENAME COLUMN {} TO {}; END IF; END $$;",
        exists(from),
        exists(to),
        quote_ident(schema),
        quote_ident(table),
        quote_ident(from),
        quote_ident(to)
    )
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Turns diffs into idempotent steps: pending renames first, then one
/// `ADD COLUMN IF NOT EXISTS` per missing column, tables in input order.
pub fn plan(diffs: &[SchemaDiff], schema: &str) -> Vec<MigrationStep> {
    let mut steps = Vec::new();
    for diff in diffs {
        for rename in &diff.renames {
            steps.push(MigrationStep {
                table: diff.table_name.clone(),
                kind: StepKind::RenameColumn {
                    from: rename.from.clone(),
                    to: rename.to.clone(),
                },
                statement: rename_column_statement(schema, &diff.table_name, &rename.from, &rename.to),
                idempotent: true,
                applied_at: None,
                error: None,
            });
        }
        for column in &diff.missing_columns {
            steps.push(MigrationStep {
                table: diff.table_name.clone(),
                kind: StepKind::AddColumn {
                    column: column.clone(),
                },
                statement: add_column_statement(schema, &diff.table_name, column),
                idempotent: true,
                applied_at: None,
                error: None,
            });
        }
    }
    steps
}

/// Renders a plan as a reviewable SQL script.
pub fn to_sql(steps: &[MigrationStep]) -> String {
    let mut sql = String::new();
    let mut current: Option<&str> = None;
    for step in steps {
        if current != Some(step.table.as_str()) {
            if current.is_some() {
                sql.push('\n');
            }
            sql.push_str(&format!("-- Table: {}\n", step.table));
            current = Some(step.table.as_str());
        }
        sql.push_str(&step.statement);
        sql.push('\n');
    }
    sql
}

/// Applies steps one at a time.
///
/// A failing step is recorded and the run moves on: steps are independent,
/// so one rejected column must not block the others. When `cancel` is set
/// the remaining steps are reported as skipped.
pub async fn execute(
    store: &dyn DataStore,
    steps: Vec<MigrationStep>,
    cancel: &CancelFlag,
    run_log: &RunLog,
    tenant: &str,
) -> ExecutionReport {
    let total = steps.len();
    let mut report = ExecutionReport::default();

    for (index, mut step) in steps.into_iter().enumerate() {
        if cancel.is_cancelled() {
            step.error = Some(ReportedError::from(&ReconcileError::Cancelled));
            report.skipped.push(step.clone());
            report.steps.push(step);
            continue;
        }

        tracing::info!("[{}/{}] {}", index + 1, total, step.statement);
        match store.exec(&step.statement).await {
            Ok(()) => {
                step.applied_at = Some(Utc::now());
                report.applied += 1;
            }
            Err(e) => {
                let err = classify(&step.statement, e);
                tracing::warn!("Step failed on {}: {}", step.table, err);
                let reported = ReportedError::from(&err);
                step.error = Some(reported.clone());
                report.failed.push(FailedStep {
                    step: step.clone(),
                    error: reported,
                });
            }
        }
        run_log.append("migration_step", tenant, &step).await;
        report.steps.push(step);
    }

    tracing::info!(
        "Migration finished: {} applied, {} failed, {} skipped",
        report.applied,
        report.failed.len(),
        report.skipped.len()
    );
    report
}

/// A rejected statement is a schema conflict; transport failures stay
/// connectivity errors.
fn classify(statement: &str, err: ReconcileError) -> ReconcileError {
    match err.kind() {
        ErrorKind::Rejected => ReconcileError::SchemaConflict {
            statement: statement.to_string(),
            message: err.root().to_string(),
        },
        _ => err,
    }
}
