//! Additive schema diffing.
//!
//! The differ only ever reports what the target lacks. Columns that exist
//! only on the target are ignored, and a column present on both sides is
//! never changed even when the inferred types disagree; such disagreements
//! are listed as [`TypeDrift`] for an operator to look at.

use crate::models::{ColumnRename, SchemaDiff, TableShape, TypeDrift};
use std::collections::HashSet;

/// Columns in `reference` missing from `target`, in reference order.
pub fn diff(reference: &TableShape, target: &TableShape) -> SchemaDiff {
    diff_with_renames(reference, target, &[])
}

/// Like [`diff`], but honours configured renames.
///
/// A reference column that is the new name of a rename whose old name still
/// exists on the target is not reported missing; the rename is reported
/// instead so it can be applied in place.
pub fn diff_with_renames(
    reference: &TableShape,
    target: &TableShape,
    renames: &[ColumnRename],
) -> SchemaDiff {
    let target_names: HashSet<&str> = target.column_names().collect();

    let pending: Vec<ColumnRename> = renames
        .iter()
        .filter(|r| r.table == reference.table_name)
        .filter(|r| {
            reference.has_column(&r.to)
                && target_names.contains(r.from.as_str())
                && !target_names.contains(r.to.as_str())
        })
        .cloned()
        .collect();
    let renamed_to: HashSet<&str> = pending.iter().map(|r| r.to.as_str()).collect();

    let missing_columns = reference
        .columns
        .iter()
        .filter(|c| !target_names.contains(c.name.as_str()))
        .filter(|c| !renamed_to.contains(c.name.as_str()))
        .cloned()
        .collect();

    let type_drift = reference
        .columns
        .iter()
        .filter_map(|c| {
            target
                .column(&c.name)
                .filter(|t| t.inferred_type != c.inferred_type)
                .map(|t| TypeDrift {
                    column: c.name.clone(),
                    reference: c.inferred_type,
                    target: t.inferred_type,
                })
        })
        .collect();

    SchemaDiff {
        table_name: reference.table_name.clone(),
        missing_columns,
        renames: pending,
        type_drift,
    }
}
