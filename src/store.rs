//! The tabular data-access boundary every component is handed explicitly.
//!
//! Nothing in the reconciler holds a global client: introspection, migration
//! and sweeps all take a `&dyn DataStore`, so the same code runs against the
//! hosted REST API, a direct Postgres connection, or the in-memory double.

use crate::errors::ReconcileError;
use crate::models::Row;
use async_trait::async_trait;
use serde_json::Value;

/// Row filter understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq { column: String, value: Value },
    /// `column IS NULL`
    IsNull { column: String },
    /// Case-insensitive substring match on the text form of `column`.
    Contains { column: String, needle: String },
    /// `column IN (values)`
    In { column: String, values: Vec<Value> },
    /// All filters must hold.
    All(Vec<Filter>),
    /// At least one filter must hold.
    Any(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn contains(column: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains {
            column: column.into(),
            needle: needle.into(),
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            column: column.into(),
            values,
        }
    }

    /// Evaluates the filter against an in-memory row.
    ///
    /// Used by the in-memory store and to double-check rows returned by
    /// backends whose filtering is coarser than ours.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq { column, value } => row
                .get(column)
                .map(|v| value_text(v) == value_text(value) && !v.is_null())
                .unwrap_or(false),
            Filter::IsNull { column } => row.get(column).map(Value::is_null).unwrap_or(true),
            Filter::Contains { column, needle } => row
                .get(column)
                .filter(|v| !v.is_null())
                .map(|v| {
                    value_text(v)
                        .to_lowercase()
                        .contains(&needle.to_lowercase())
                })
                .unwrap_or(false),
            Filter::In { column, values } => row
                .get(column)
                .filter(|v| !v.is_null())
                .map(|v| {
                    let text = value_text(v);
                    values.iter().any(|candidate| value_text(candidate) == text)
                })
                .unwrap_or(false),
            Filter::All(filters) => filters.iter().all(|f| f.matches(row)),
            Filter::Any(filters) => filters.iter().any(|f| f.matches(row)),
        }
    }
}

/// Text form of a JSON value as Postgres would print it for comparison.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Generic tabular data-access capability.
///
/// Calls are issued one at a time by the reconciler; implementations need
/// not coordinate concurrent mutations against the same table.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Selects rows from `table`, optionally filtered and limited.
    async fn select(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ReconcileError>;

    /// Inserts one record and returns the record as stored.
    async fn insert(&self, table: &str, record: &Row) -> Result<Row, ReconcileError>;

    /// Deletes every row matching `filter`, returning how many were removed.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ReconcileError>;

    /// Executes a raw change statement. Only the migration executor calls this.
    async fn exec(&self, statement: &str) -> Result<(), ReconcileError>;

    /// Performs a minimal read against `probe_table` and reports the tenant
    /// identifier the connection actually reached.
    async fn identify(&self, probe_table: &str) -> Result<String, ReconcileError>;
}
