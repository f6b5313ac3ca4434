use crate::binding::tenant_id_from_url;
use crate::errors::{ReconcileError, ResultExt};
use crate::models::Row;
use crate::store::{value_text, DataStore, Filter};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::QueryScalar;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

/// Database setting an operator can pin to name the tenant explicitly:
/// `ALTER DATABASE postgres SET app.tenant_id = '<project ref>'`.
const TENANT_SETTING: &str = "app.tenant_id";

/// Data store talking to a tenant's Postgres directly through a sqlx pool.
pub struct PgDataStore {
    pool: PgPool,
    schema: String,
    /// Tenant named by the connection URL, used when the database does not
    /// carry an explicit tenant setting.
    url_tenant: Option<String>,
}

impl PgDataStore {
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self, ReconcileError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| ReconcileError::Connectivity(format!("Failed to connect: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("Connection check failed")?;

        let url_tenant = url::Url::parse(database_url)
            .ok()
            .and_then(|url| tenant_id_from_url(&url));

        Ok(Self::new(pool, schema, url_tenant))
    }

    /// Builds the pool without connecting; connection failures surface on
    /// first use as connectivity errors instead of aborting startup.
    pub fn connect_lazy(database_url: &str, schema: &str) -> Result<Self, ReconcileError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(database_url)
            .map_err(|e| ReconcileError::Configuration(format!("Invalid DATABASE_URL: {}", e)))?;

        let url_tenant = url::Url::parse(database_url)
            .ok()
            .and_then(|url| tenant_id_from_url(&url));

        Ok(Self::new(pool, schema, url_tenant))
    }

    pub fn new(pool: PgPool, schema: &str, url_tenant: Option<String>) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            url_tenant,
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A bind parameter produced while rendering a filter.
#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Text(String),
    TextArray(Vec<String>),
}

/// Renders a filter as a SQL predicate over alias `t`, collecting binds.
fn render_filter(filter: &Filter, binds: &mut Vec<Bind>) -> String {
    match filter {
        Filter::Eq { column, value } => {
            binds.push(Bind::Text(value_text(value)));
            format!("t.{}::text = ${}", quote_ident(column), binds.len())
        }
        Filter::IsNull { column } => format!("t.{} IS NULL", quote_ident(column)),
        Filter::Contains { column, needle } => {
            binds.push(Bind::Text(format!("%{}%", escape_like(needle))));
            format!("t.{}::text ILIKE ${}", quote_ident(column), binds.len())
        }
        Filter::In { column, values } => {
            binds.push(Bind::TextArray(values.iter().map(value_text).collect()));
            format!("t.{}::text = ANY(${})", quote_ident(column), binds.len())
        }
        Filter::All(filters) if filters.is_empty() => "TRUE".to_string(),
        Filter::Any(filters) if filters.is_empty() => "FALSE".to_string(),
        Filter::All(filters) => join_filters(filters, " AND ", binds),
        Filter::Any(filters) => join_filters(filters, " OR ", binds),
    }
}

fn join_filters(filters: &[Filter], op: &str, binds: &mut Vec<Bind>) -> String {
    let parts: Vec<String> = filters.iter().map(|f| render_filter(f, binds)).collect();
    format!("({})", parts.join(op))
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn bind_all<'q>(
    mut query: QueryScalar<'q, Postgres, Value, PgArguments>,
    binds: &[Bind],
) -> QueryScalar<'q, Postgres, Value, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Text(text) => query.bind(text.clone()),
            Bind::TextArray(items) => query.bind(items.clone()),
        };
    }
    query
}

#[async_trait]
impl DataStore for PgDataStore {
    async fn select(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ReconcileError> {
        let mut binds = Vec::new();
        let mut sql = format!(
            "SELECT row_to_json(t)::jsonb FROM {} AS t",
            self.qualified(table)
        );
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&render_filter(filter, &mut binds));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        tracing::debug!("{}", sql);
        let rows: Vec<Value> = bind_all(sqlx::query_scalar(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("select from {}", table))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn insert(&self, table: &str, record: &Row) -> Result<Row, ReconcileError> {
        let target = self.qualified(table);
        let sql = if record.is_empty() {
            format!(
                "INSERT INTO {} AS t DEFAULT VALUES RETURNING row_to_json(t)::jsonb",
                target
            )
        } else {
            // Only the supplied columns are written so defaults still apply
            // to everything else.
            let columns = record
                .keys()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {target} AS t ({columns}) \
                 SELECT {columns} FROM jsonb_populate_record(NULL::{target}, $1) \
                 RETURNING row_to_json(t)::jsonb"
            )
        };

        let mut query = sqlx::query_scalar::<_, Value>(&sql);
        if !record.is_empty() {
            query = query.bind(Value::Object(record.clone()));
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("insert into {}", table))?;

        match row {
            Value::Object(map) => Ok(map),
            other => Err(ReconcileError::Rejected(format!(
                "insert into {} returned {}",
                table, other
            ))),
        }
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ReconcileError> {
        let mut binds = Vec::new();
        let sql = format!(
            "DELETE FROM {} AS t WHERE {}",
            self.qualified(table),
            render_filter(filter, &mut binds)
        );

        tracing::debug!("{}", sql);
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Text(text) => query.bind(text.clone()),
                Bind::TextArray(items) => query.bind(items.clone()),
            };
        }
        let result = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete from {}", table))?;

        Ok(result.rows_affected())
    }

    async fn exec(&self, statement: &str) -> Result<(), ReconcileError> {
        tracing::debug!("{}", statement);
        sqlx::raw_sql(statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn identify(&self, probe_table: &str) -> Result<String, ReconcileError> {
        sqlx::query(&format!(
            "SELECT 1 FROM {} LIMIT 1",
            self.qualified(probe_table)
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("probe {}", probe_table))?;

        let pinned: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
            .bind(TENANT_SETTING)
            .fetch_one(&self.pool)
            .await
            .context("reading tenant setting")?;

        pinned
            .filter(|id| !id.trim().is_empty())
            .map(|id| id.trim().to_lowercase())
            .or_else(|| self.url_tenant.clone())
            .ok_or_else(|| {
                ReconcileError::Rejected(format!(
                    "database does not identify its tenant; set {}",
                    TENANT_SETTING
                ))
            })
    }
}
