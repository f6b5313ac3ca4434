//! In-memory data store used as a test double and for rehearsing runs.
//!
//! It understands exactly the change statements the migration planner
//! renders, rejects everything else, and keeps a journal of every call so
//! ordering guarantees can be asserted.

use crate::errors::ReconcileError;
use crate::models::{ColumnType, Row};
use crate::store::{DataStore, Filter};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// A call the store received, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Select { table: String },
    Insert { table: String },
    Delete { table: String, deleted: u64 },
    Exec { statement: String },
    Identify { table: String },
}

#[derive(Debug, Clone)]
struct MemoryColumn {
    name: String,
    column_type: ColumnType,
    not_null: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<MemoryColumn>,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn column(&self, name: &str) -> Option<&MemoryColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// A row padded with nulls for every declared column, in column order.
    fn project(&self, row: &Row) -> Row {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    journal: Vec<StoreOp>,
    next_id: i64,
    offline: bool,
    failing_tables: HashSet<String>,
    failing_inserts: HashSet<String>,
    failing_deletes: HashSet<String>,
    restricted_deletes: HashSet<String>,
    failing_statements: Vec<String>,
}

/// In-memory tenant database.
#[derive(Debug)]
pub struct MemoryDataStore {
    tenant_id: String,
    state: Mutex<MemoryState>,
}

impl MemoryDataStore {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declares a table with ordered columns and seeds it with rows.
    pub fn with_table(self, table: &str, columns: &[(&str, ColumnType)], rows: Vec<Value>) -> Self {
        {
            let mut state = self.state();
            let entry = MemoryTable {
                columns: columns
                    .iter()
                    .map(|(name, column_type)| MemoryColumn {
                        name: name.to_string(),
                        column_type: *column_type,
                        not_null: false,
                    })
                    .collect(),
                rows: rows
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect(),
            };
            let seeded_max = entry
                .rows
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_i64))
                .max();
            if let Some(max) = seeded_max {
                state.next_id = state.next_id.max(max + 1);
            }
            state.tables.insert(table.to_string(), entry);
        }
        self
    }

    /// Marks a column NOT NULL.
    pub fn with_not_null(self, table: &str, column: &str) -> Self {
        {
            let mut state = self.state();
            if let Some(col) = state
                .tables
                .get_mut(table)
                .and_then(|t| t.columns.iter_mut().find(|c| c.name == column))
            {
                col.not_null = true;
            }
        }
        self
    }

    /// Makes every call on `table` fail with a rejection.
    pub fn fail_table(&self, table: &str) {
        self.state().failing_tables.insert(table.to_string());
    }

    /// Makes inserts into `table` fail with a policy rejection.
    pub fn fail_inserts(&self, table: &str) {
        self.state().failing_inserts.insert(table.to_string());
    }

    /// Makes deletes from `table` fail with a rejection.
    pub fn fail_deletes(&self, table: &str) {
        self.state().failing_deletes.insert(table.to_string());
    }

    /// Makes deletes from `table` succeed without removing anything, the way
    /// a row-level security policy filters them.
    pub fn restrict_deletes(&self, table: &str) {
        self.state().restricted_deletes.insert(table.to_string());
    }

    /// Makes `exec` reject statements containing `fragment`.
    pub fn fail_statements_containing(&self, fragment: &str) {
        self.state().failing_statements.push(fragment.to_string());
    }

    /// Makes every call fail as a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Column names of a table in declaration order.
    pub fn columns(&self, table: &str) -> Vec<String> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Declared type of a column.
    pub fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.state()
            .tables
            .get(table)
            .and_then(|t| t.column(column))
            .map(|c| c.column_type)
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| t.project(r)).collect())
            .unwrap_or_default()
    }

    /// Every call received so far.
    pub fn journal(&self) -> Vec<StoreOp> {
        self.state().journal.clone()
    }

    /// Only the mutating calls (inserts, deletes, execs).
    pub fn mutations(&self) -> Vec<StoreOp> {
        self.journal()
            .into_iter()
            .filter(|op| !matches!(op, StoreOp::Select { .. } | StoreOp::Identify { .. }))
            .collect()
    }

    fn guard(state: &MemoryState, table: &str) -> Result<(), ReconcileError> {
        if state.offline {
            return Err(ReconcileError::Connectivity(
                "connection refused (store offline)".to_string(),
            ));
        }
        if state.failing_tables.contains(table) {
            return Err(ReconcileError::Rejected(format!(
                "permission denied for table {}",
                table
            )));
        }
        Ok(())
    }
}

fn missing_relation(table: &str) -> ReconcileError {
    ReconcileError::Rejected(format!("relation \"{}\" does not exist", table))
}

const IDENT: &str = r#""((?:[^"]|"")+)""#;

fn add_column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^\s*ALTER TABLE (?:{i}\.)?{i} ADD COLUMN( IF NOT EXISTS)? {i} ([a-z\[\] ]+?)\s*;?\s*$",
            i = IDENT
        ))
        .expect("static regex")
    })
}

fn rename_column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)^\s*DO \$\$.*ALTER TABLE (?:{i}\.)?{i} RENAME COLUMN {i} TO {i};.*END \$\$;?\s*$",
            i = IDENT
        ))
        .expect("static regex")
    })
}

fn unquote(ident: &str) -> String {
    ident.replace("\"\"", "\"")
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn select(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ReconcileError> {
        let mut state = self.state();
        state.journal.push(StoreOp::Select {
            table: table.to_string(),
        });
        Self::guard(&state, table)?;
        let entry = state.tables.get(table).ok_or_else(|| missing_relation(table))?;

        let rows = entry
            .rows
            .iter()
            .map(|r| entry.project(r))
            .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: &Row) -> Result<Row, ReconcileError> {
        let mut state = self.state();
        state.journal.push(StoreOp::Insert {
            table: table.to_string(),
        });
        Self::guard(&state, table)?;
        if state.failing_inserts.contains(table) {
            return Err(ReconcileError::Rejected(format!(
                "new row violates row-level security policy for table \"{}\"",
                table
            )));
        }
        let next_id = state.next_id;
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_relation(table))?;

        if let Some(unknown) = record.keys().find(|k| entry.column(k).is_none()) {
            return Err(ReconcileError::Rejected(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                unknown, table
            )));
        }

        let mut row = record.clone();
        let mut used_id = false;
        for column in &entry.columns {
            if row.get(&column.name).map(|v| !v.is_null()).unwrap_or(false) {
                continue;
            }
            let default = match (column.name.as_str(), column.column_type) {
                ("id", ColumnType::Uuid) => Some(Value::String(uuid::Uuid::new_v4().to_string())),
                ("id", ColumnType::Integer) => {
                    used_id = true;
                    Some(Value::from(next_id))
                }
                ("created_at", ColumnType::Timestamp) => {
                    Some(Value::String(chrono::Utc::now().to_rfc3339()))
                }
                _ => None,
            };
            match default {
                Some(value) => {
                    row.insert(column.name.clone(), value);
                }
                None if column.not_null => {
                    return Err(ReconcileError::Rejected(format!(
                        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                        column.name, table
                    )));
                }
                None => {}
            }
        }

        let stored = entry.project(&row);
        entry.rows.push(row);
        if used_id {
            state.next_id += 1;
        }
        Ok(stored)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ReconcileError> {
        let mut state = self.state();
        let guarded = Self::guard(&state, table).and_then(|()| {
            if state.failing_deletes.contains(table) {
                return Err(ReconcileError::Rejected(format!(
                    "permission denied for table {}",
                    table
                )));
            }
            Ok(())
        });
        if let Err(e) = guarded {
            state.journal.push(StoreOp::Delete {
                table: table.to_string(),
                deleted: 0,
            });
            return Err(e);
        }
        let restricted = state.restricted_deletes.contains(table);
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_relation(table))?;

        if restricted {
            state.journal.push(StoreOp::Delete {
                table: table.to_string(),
                deleted: 0,
            });
            return Ok(0);
        }
        let before = entry.rows.len();
        let projected: Vec<bool> = entry
            .rows
            .iter()
            .map(|r| filter.matches(&entry.project(r)))
            .collect();
        let mut flags = projected.into_iter();
        entry.rows.retain(|_| !flags.next().unwrap_or(false));
        let deleted = (before - entry.rows.len()) as u64;

        state.journal.push(StoreOp::Delete {
            table: table.to_string(),
            deleted,
        });
        Ok(deleted)
    }

    async fn exec(&self, statement: &str) -> Result<(), ReconcileError> {
        let mut state = self.state();
        state.journal.push(StoreOp::Exec {
            statement: statement.to_string(),
        });
        if state.offline {
            return Err(ReconcileError::Connectivity(
                "connection refused (store offline)".to_string(),
            ));
        }
        if let Some(fragment) = state
            .failing_statements
            .iter()
            .find(|f| statement.contains(f.as_str()))
        {
            return Err(ReconcileError::Rejected(format!(
                "statement rejected (matched '{}')",
                fragment
            )));
        }

        if let Some(caps) = add_column_re().captures(statement) {
            let table = unquote(&caps[2]);
            let guarded = caps.get(3).is_some();
            let column = unquote(&caps[4]);
            let column_type: ColumnType = caps[5]
                .parse()
                .map_err(|e: String| ReconcileError::Rejected(e))?;

            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| missing_relation(&table))?;
            if entry.column(&column).is_some() {
                if guarded {
                    return Ok(());
                }
                return Err(ReconcileError::Rejected(format!(
                    "column \"{}\" of relation \"{}\" already exists",
                    column, table
                )));
            }
            entry.columns.push(MemoryColumn {
                name: column,
                column_type,
                not_null: false,
            });
            return Ok(());
        }

        if let Some(caps) = rename_column_re().captures(statement) {
            let table = unquote(&caps[2]);
            let from = unquote(&caps[3]);
            let to = unquote(&caps[4]);
            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| missing_relation(&table))?;
            // Guard: only when the old name exists and the new one does not.
            if entry.column(&from).is_none() || entry.column(&to).is_some() {
                return Ok(());
            }
            for column in entry.columns.iter_mut().filter(|c| c.name == from) {
                column.name = to.clone();
            }
            for row in entry.rows.iter_mut() {
                if let Some(value) = row.remove(&from) {
                    row.insert(to.clone(), value);
                }
            }
            return Ok(());
        }

        Err(ReconcileError::Rejected(format!(
            "syntax error or unsupported statement: {}",
            statement
        )))
    }

    async fn identify(&self, probe_table: &str) -> Result<String, ReconcileError> {
        let mut state = self.state();
        state.journal.push(StoreOp::Identify {
            table: probe_table.to_string(),
        });
        Self::guard(&state, probe_table)?;
        if !state.tables.contains_key(probe_table) {
            return Err(missing_relation(probe_table));
        }
        Ok(self.tenant_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryDataStore {
        MemoryDataStore::new("tenant-a").with_table(
            "patients",
            &[("id", ColumnType::Integer), ("name", ColumnType::Text)],
            vec![json!({"id": 100, "name": "Ada"})],
        )
    }

    #[tokio::test]
    async fn test_insert_fills_defaults_and_pads() {
        let store = store();
        let mut record = Row::new();
        record.insert("name".into(), json!("Grace"));
        let row = store.insert("patients", &record).await.unwrap();
        assert_eq!(row["id"], json!(101));
        assert_eq!(row["name"], json!("Grace"));
        assert_eq!(store.rows("patients").len(), 2);
    }

    #[tokio::test]
    async fn test_generated_ids_follow_seeded_rows() {
        let store = MemoryDataStore::new("tenant-a")
            .with_table("beds", &[("id", ColumnType::Integer)], vec![json!({"id": 1})])
            .with_table("wards", &[("id", ColumnType::Integer)], vec![]);
        let bed = store.insert("beds", &Row::new()).await.unwrap();
        let ward = store.insert("wards", &Row::new()).await.unwrap();
        assert_eq!(bed["id"], json!(2));
        assert_eq!(ward["id"], json!(3));
    }

    #[tokio::test]
    async fn test_restricted_delete_removes_nothing() {
        let store = store();
        store.restrict_deletes("patients");
        let deleted = store
            .delete("patients", &Filter::eq("id", 100))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.rows("patients").len(), 1);
    }

    #[tokio::test]
    async fn test_not_null_violation_message() {
        let store = store().with_not_null("patients", "name");
        let err = store.insert("patients", &Row::new()).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("null value in column \"name\" of relation \"patients\""));
    }

    #[tokio::test]
    async fn test_exec_add_column_guarded_and_unguarded() {
        let store = store();
        let guarded = r#"ALTER TABLE "public"."patients" ADD COLUMN IF NOT EXISTS "fee" numeric;"#;
        store.exec(guarded).await.unwrap();
        store.exec(guarded).await.unwrap();
        assert_eq!(store.columns("patients"), vec!["id", "name", "fee"]);
        assert_eq!(
            store.column_type("patients", "fee"),
            Some(ColumnType::Numeric)
        );

        let unguarded = r#"ALTER TABLE "patients" ADD COLUMN "fee" numeric"#;
        assert!(store.exec(unguarded).await.is_err());
        assert!(store.exec("DROP TABLE patients").await.is_err());
    }

    #[tokio::test]
    async fn test_exec_array_type() {
        let store = store();
        store
            .exec(r#"ALTER TABLE "public"."patients" ADD COLUMN IF NOT EXISTS "tags" text[];"#)
            .await
            .unwrap();
        assert_eq!(
            store.column_type("patients", "tags"),
            Some(ColumnType::ArrayOfText)
        );
    }

    #[tokio::test]
    async fn test_offline_is_connectivity() {
        let store = store();
        store.set_offline(true);
        let err = store.select("patients", None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Connectivity);
    }
}
