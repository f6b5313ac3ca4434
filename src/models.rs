use crate::errors::ReportedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// One record as returned by the data store: column name -> JSON value.
pub type Row = serde_json::Map<String, Value>;

// ============================================================================
// Table shapes
// ============================================================================

/// Column types the introspector can infer from sampled values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    Text,
    Uuid,
    Timestamp,
    Numeric,
    Integer,
    Boolean,
    ArrayOfText,
}

impl ColumnType {
    /// Postgres type used when adding a column of this type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Uuid => "uuid",
            ColumnType::Timestamp => "timestamptz",
            ColumnType::Numeric => "numeric",
            ColumnType::Integer => "integer",
            ColumnType::Boolean => "boolean",
            ColumnType::ArrayOfText => "text[]",
        }
    }

    /// Placeholder value accepted by a column of this type, used by probe inserts.
    pub fn placeholder(&self) -> Value {
        match self {
            ColumnType::Text => Value::String("__reconciler_probe__".to_string()),
            ColumnType::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
            ColumnType::Timestamp => Value::String(Utc::now().to_rfc3339()),
            ColumnType::Numeric | ColumnType::Integer => Value::from(0),
            ColumnType::Boolean => Value::Bool(false),
            ColumnType::ArrayOfText => Value::Array(Vec::new()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Uuid => "uuid",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Numeric => "numeric",
            ColumnType::Integer => "integer",
            ColumnType::Boolean => "boolean",
            ColumnType::ArrayOfText => "array-of-text",
        };
        f.write_str(name)
    }
}

impl FromStr for ColumnType {
    type Err = String;

    /// Accepts both the report names and the Postgres spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "varchar" | "character varying" => Ok(ColumnType::Text),
            "uuid" => Ok(ColumnType::Uuid),
            "timestamp" | "timestamptz" | "timestamp with time zone" | "date" => {
                Ok(ColumnType::Timestamp)
            }
            "numeric" | "decimal" | "double precision" | "real" => Ok(ColumnType::Numeric),
            "integer" | "int" | "int4" | "int8" | "bigint" | "smallint" => Ok(ColumnType::Integer),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "array-of-text" | "text[]" | "_text" => Ok(ColumnType::ArrayOfText),
            other => Err(format!("unknown column type '{}'", other)),
        }
    }
}

/// Observed shape of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub name: String,
    pub inferred_type: ColumnType,
    pub nullable: bool,
}

impl ColumnShape {
    pub fn new(name: impl Into<String>, inferred_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            inferred_type,
            nullable: true,
        }
    }
}

/// How a [`TableShape`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeOrigin {
    /// Derived from an existing row.
    Sampled,
    /// Derived from a probe insert that was read back and removed.
    Probed,
    /// The table had no rows and probing did not yield a shape.
    Empty,
}

/// Observed structure of one table. Derived, never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    pub table_name: String,
    pub columns: Vec<ColumnShape>,
    pub origin: ShapeOrigin,
    /// Probe and cleanup problems encountered while deriving the shape.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl TableShape {
    /// Builds a sampled shape from an ordered column list.
    pub fn new(table_name: impl Into<String>, columns: Vec<ColumnShape>) -> Self {
        Self {
            table_name: table_name.into(),
            columns,
            origin: ShapeOrigin::Sampled,
            notes: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnShape> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

// ============================================================================
// Diffs
// ============================================================================

/// A configured rename from an old column name to its new name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub table: String,
    pub from: String,
    pub to: String,
}

/// Same column name, different inferred type. Reported only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeDrift {
    pub column: String,
    pub reference: ColumnType,
    pub target: ColumnType,
}

/// Additive gap between a reference table and a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub table_name: String,
    /// Columns present in the reference but absent in the target, in reference order.
    pub missing_columns: Vec<ColumnShape>,
    /// Configured renames whose old name is still present on the target.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub renames: Vec<ColumnRename>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub type_drift: Vec<TypeDrift>,
}

impl SchemaDiff {
    /// True when the diff requires no statements.
    pub fn is_empty(&self) -> bool {
        self.missing_columns.is_empty() && self.renames.is_empty()
    }
}

// ============================================================================
// Migration steps
// ============================================================================

/// What a migration step changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    AddColumn { column: ColumnShape },
    RenameColumn { from: String, to: String },
}

/// One idempotent change statement and, once executed, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStep {
    pub table: String,
    #[serde(flatten)]
    pub kind: StepKind,
    pub statement: String,
    pub idempotent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
}

/// A step that failed, with the error captured at execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedStep {
    pub step: MigrationStep,
    pub error: ReportedError,
}

/// Outcome of executing a list of migration steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub applied: usize,
    pub failed: Vec<FailedStep>,
    /// Steps not attempted because the run was cancelled.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<MigrationStep>,
    /// Every step in execution order, with `applied_at` / `error` filled in.
    pub steps: Vec<MigrationStep>,
}

impl ExecutionReport {
    /// Success means zero entries in the failure list.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// Sweeps
// ============================================================================

/// How a sweep target chooses its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Rows whose naming fields match the sweep predicate.
    Fields { fields: Vec<String> },
    /// Rows whose `column` points at a matched row of `parent`.
    References { column: String, parent: String },
}

/// A table taking part in a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepTarget {
    pub table_name: String,
    /// Higher ranks are deleted first (children before parents).
    pub dependency_rank: u32,
    pub selector: TargetSelector,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl SweepTarget {
    pub fn by_fields(table: impl Into<String>, rank: u32, fields: &[&str]) -> Self {
        Self {
            table_name: table.into(),
            dependency_rank: rank,
            selector: TargetSelector::Fields {
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
            id_column: default_id_column(),
        }
    }

    pub fn referencing(
        table: impl Into<String>,
        rank: u32,
        column: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table.into(),
            dependency_rank: rank,
            selector: TargetSelector::References {
                column: column.into(),
                parent: parent.into(),
            },
            id_column: default_id_column(),
        }
    }
}

/// Parses `table:rank:field,field` or `table:rank:column->parent`.
impl FromStr for SweepTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (table, rank, selector) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(r), Some(sel)) if !t.trim().is_empty() => {
                (t.trim(), r.trim(), sel.trim())
            }
            _ => return Err(format!("expected table:rank:selector, got '{}'", s)),
        };
        let rank: u32 = rank
            .parse()
            .map_err(|_| format!("invalid dependency rank '{}' in '{}'", rank, s))?;

        if let Some((column, parent)) = selector.split_once("->") {
            let (column, parent) = (column.trim(), parent.trim());
            if column.is_empty() || parent.is_empty() {
                return Err(format!("expected column->parent, got '{}'", selector));
            }
            return Ok(Self::referencing(table, rank, column, parent));
        }

        let fields: Vec<&str> = selector
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            return Err(format!("{} has no naming fields", table));
        }
        Ok(Self::by_fields(table, rank, &fields))
    }
}

/// A row selected by a sweep: its id plus the fields that identified it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedRow {
    pub id: Value,
    pub identity: Row,
}

/// Per-table result of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSweep {
    pub table_name: String,
    pub matched: Vec<MatchedRow>,
    pub deleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
}

/// A row whose referential state looks inconsistent. Reported, never corrected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataIntegrityWarning {
    pub table: String,
    pub row_id: Value,
    pub message: String,
}

/// Outcome of a sweep, in deletion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub tables: Vec<TableSweep>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DataIntegrityWarning>,
}

impl SweepReport {
    pub fn total_matched(&self) -> usize {
        self.tables.iter().map(|t| t.matched.len()).sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.tables.iter().map(|t| t.deleted).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TableSweep> {
        self.tables.iter().filter(|t| t.error.is_some())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_parses_report_and_sql_names() {
        for ty in [
            ColumnType::Text,
            ColumnType::Uuid,
            ColumnType::Timestamp,
            ColumnType::Numeric,
            ColumnType::Integer,
            ColumnType::Boolean,
            ColumnType::ArrayOfText,
        ] {
            assert_eq!(ty.to_string().parse::<ColumnType>(), Ok(ty));
            assert_eq!(ty.sql_type().parse::<ColumnType>(), Ok(ty));
        }
        assert!("jsonb".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_step_serializes_flat() {
        let step = MigrationStep {
            table: "patients".into(),
            kind: StepKind::AddColumn {
                column: ColumnShape::new("fee", ColumnType::Numeric),
            },
            statement: "ALTER TABLE ...".into(),
            idempotent: true,
            applied_at: None,
            error: None,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "add_column");
        assert_eq!(json["column"]["inferred_type"], "numeric");
        assert!(json.get("applied_at").is_none());
    }

    #[test]
    fn test_sweep_target_from_str() {
        let target: SweepTarget = "patients:0:first_name, last_name".parse().unwrap();
        assert_eq!(target, SweepTarget::by_fields("patients", 0, &["first_name", "last_name"]));

        let target: SweepTarget = "admissions:1:patient_id->patients".parse().unwrap();
        assert_eq!(
            target,
            SweepTarget::referencing("admissions", 1, "patient_id", "patients")
        );

        assert!("patients:zero:name".parse::<SweepTarget>().is_err());
        assert!("patients:0:".parse::<SweepTarget>().is_err());
        assert!("patients:0:->patients".parse::<SweepTarget>().is_err());
        assert!("patients".parse::<SweepTarget>().is_err());
    }
}
