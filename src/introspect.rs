//! Schema introspection from sampled rows.
//!
//! No metadata access is assumed: a table's shape is whatever one of its rows
//! looks like. Empty tables are probed with a throwaway insert that is read
//! back and deleted again.

use crate::errors::{ReconcileError, ResultExt};
use crate::models::{ColumnShape, ColumnType, Row, ShapeOrigin, TableShape};
use crate::store::{DataStore, Filter};
use crate::type_hints::TypeHints;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Upper bound on insert attempts while a probe learns required columns.
const MAX_PROBE_ATTEMPTS: usize = 8;

/// Knobs for a single introspection.
#[derive(Debug, Clone, Copy)]
pub struct IntrospectOptions<'a> {
    /// Whether an empty table may be probed with an insert.
    pub allow_probe: bool,
    /// Shape of the same table elsewhere, used to seed the probe record.
    pub reference: Option<&'a TableShape>,
}

impl Default for IntrospectOptions<'_> {
    fn default() -> Self {
        Self {
            allow_probe: true,
            reference: None,
        }
    }
}

/// Derives the shape of `table` from one sampled row, probing when empty.
///
/// Only a failing sample read is returned as an error. Probe and cleanup
/// failures are recorded in [`TableShape::notes`].
pub async fn introspect(
    store: &dyn DataStore,
    table: &str,
    hints: &TypeHints,
    options: IntrospectOptions<'_>,
) -> Result<TableShape, ReconcileError> {
    let sample = store
        .select(table, None, Some(1))
        .await
        .with_context(|| format!("sampling {}", table))?;

    if let Some(row) = sample.into_iter().next() {
        tracing::debug!("Sampled {} ({} columns)", table, row.len());
        return Ok(shape_from_row(table, &row, hints, &HashSet::new(), ShapeOrigin::Sampled));
    }

    if !options.allow_probe {
        tracing::info!("{} has no rows and probing is disabled", table);
        let mut shape = TableShape::new(table, Vec::new());
        shape.origin = ShapeOrigin::Empty;
        shape.notes.push("table has no rows; probing disabled".to_string());
        return Ok(shape);
    }

    tracing::info!("{} has no rows, probing its shape", table);
    Ok(probe_insert(store, table, hints, options.reference).await)
}

/// Builds a shape from one row, in the row's column order.
pub fn shape_from_row(
    table: &str,
    row: &Row,
    hints: &TypeHints,
    not_null: &HashSet<String>,
    origin: ShapeOrigin,
) -> TableShape {
    let columns = row
        .iter()
        .map(|(name, value)| ColumnShape {
            name: name.clone(),
            inferred_type: hints.infer(name, value),
            nullable: !not_null.contains(name),
        })
        .collect();
    let mut shape = TableShape::new(table, columns);
    shape.origin = origin;
    shape
}

/// Columns a probe fills in up front because tables rarely accept them null.
fn looks_required(column: &ColumnShape) -> bool {
    let name = column.name.as_str();
    !column.nullable
        || name == "name"
        || name.ends_with("_name")
        || name == "title"
        || name == "status"
}

fn not_null_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"null value in column "([^"]+)""#).expect("static regex")
    })
}

fn unknown_column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"column "([^"]+)" of relation "[^"]+" does not exist|Could not find the '([^']+)' column"#)
            .expect("static regex")
    })
}

/// Column named by a not-null violation, if that is what the error is.
pub fn not_null_violation(err: &ReconcileError) -> Option<String> {
    not_null_re()
        .captures(&err.to_string())
        .map(|caps| caps[1].to_string())
}

/// Column named by an unknown-column rejection.
pub fn unknown_column(err: &ReconcileError) -> Option<String> {
    unknown_column_re().captures(&err.to_string()).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
    })
}

/// Best-effort probe: insert a minimal record, read its shape back, delete it.
///
/// Never fails. The delete is attempted whenever the probe row can be
/// identified, including after a failed insert.
async fn probe_insert(
    store: &dyn DataStore,
    table: &str,
    hints: &TypeHints,
    reference: Option<&TableShape>,
) -> TableShape {
    let marker = format!("__reconciler_probe_{}", uuid::Uuid::new_v4().simple());
    let mut notes = Vec::new();
    let mut not_null = HashSet::new();

    let mut record = Row::new();
    if let Some(reference) = reference {
        for column in reference.columns.iter().filter(|c| looks_required(c)) {
            record.insert(column.name.clone(), probe_value(column.inferred_type, &marker));
        }
    }

    let mut inserted = None;
    for attempt in 1..=MAX_PROBE_ATTEMPTS {
        match store.insert(table, &record).await {
            Ok(row) => {
                inserted = Some(row);
                break;
            }
            Err(e) => {
                if let Some(column) = not_null_violation(&e).filter(|c| !record.contains_key(c)) {
                    tracing::debug!("Probe of {} needs {} (attempt {})", table, column, attempt);
                    let ty = reference
                        .and_then(|r| r.column(&column))
                        .map(|c| c.inferred_type)
                        .unwrap_or_else(|| hints.infer(&column, &Value::Null));
                    record.insert(column.clone(), probe_value(ty, &marker));
                    not_null.insert(column);
                    continue;
                }
                if let Some(column) = unknown_column(&e).filter(|c| record.contains_key(c)) {
                    tracing::debug!("Probe of {} dropping unknown column {}", table, column);
                    record.remove(&column);
                    continue;
                }
                tracing::warn!("Probe insert into {} failed: {}", table, e);
                notes.push(format!("probe insert failed: {}", e));
                break;
            }
        }
    }
    if inserted.is_none() && notes.is_empty() {
        notes.push(format!(
            "probe insert gave up after {} attempts",
            MAX_PROBE_ATTEMPTS
        ));
    }

    // Cleanup runs whether or not the insert reported success.
    match probe_filter(inserted.as_ref(), &record, &marker) {
        Some(filter) => match store.delete(table, &filter).await {
            Ok(0) if inserted.is_some() => {
                tracing::warn!("Probe row in {} was not found during cleanup", table);
                notes.push("probe row not found during cleanup".to_string());
            }
            Ok(deleted) => tracing::debug!("Probe cleanup removed {} row(s) from {}", deleted, table),
            Err(e) => {
                tracing::warn!("Probe cleanup in {} failed: {}", table, e);
                notes.push(format!("probe cleanup failed: {}", e));
            }
        },
        None if inserted.is_some() => {
            tracing::warn!("Probe row in {} has no identifying field", table);
            notes.push("probe cleanup skipped: row has no identifying field".to_string());
        }
        None => {}
    }

    let mut shape = match inserted {
        Some(row) => shape_from_row(table, &row, hints, &not_null, ShapeOrigin::Probed),
        None => {
            let mut empty = TableShape::new(table, Vec::new());
            empty.origin = ShapeOrigin::Empty;
            empty
        }
    };
    shape.notes = notes;
    shape
}

fn probe_value(ty: ColumnType, marker: &str) -> Value {
    match ty {
        ColumnType::Text => Value::String(marker.to_string()),
        other => other.placeholder(),
    }
}

/// How to find the probe row again: by id when the store returned one,
/// otherwise by every marker-valued column of the probe record.
fn probe_filter(inserted: Option<&Row>, record: &Row, marker: &str) -> Option<Filter> {
    if let Some(id) = inserted
        .and_then(|row| row.get("id"))
        .filter(|id| !id.is_null())
    {
        return Some(Filter::eq("id", id.clone()));
    }

    let marked: Vec<Filter> = record
        .iter()
        .filter(|(_, v)| v.as_str() == Some(marker))
        .map(|(k, _)| Filter::eq(k.clone(), marker))
        .collect();
    (!marked.is_empty()).then(|| Filter::All(marked))
}
