use crate::binding::{tenant_id_from_url, TenantBinding};
use crate::errors::ReconcileError;
use crate::models::Row;
use crate::store::{value_text, DataStore, Filter};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Response header the hosted gateway uses to name the project it served.
const PROJECT_REF_HEADER: &str = "sb-project-ref";

/// Rows requested per page; the gateway's default `max-rows` cap.
const PAGE_SIZE: usize = 1000;

/// Data store backed by a tenant's hosted PostgREST endpoint.
///
/// Change statements go through a SQL-executing remote procedure
/// (`exec_sql` by default) that must be installed on the tenant.
#[derive(Clone)]
pub struct RestDataStore {
    client: Client,
    base_url: Url,
    api_key: String,
    schema: String,
    exec_rpc: String,
}

impl RestDataStore {
    /// Creates a new `RestDataStore` for a resolved binding.
    pub fn new(
        binding: &TenantBinding,
        schema: &str,
        exec_rpc: &str,
        timeout: Duration,
    ) -> Result<Self, ReconcileError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ReconcileError::Connectivity(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url: binding.endpoint_url.clone(),
            api_key: binding.credential_ref.secret().to_string(),
            schema: schema.to_string(),
            exec_rpc: exec_rpc.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ReconcileError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/rest/v1/{}", base, path))
            .map_err(|e| ReconcileError::Configuration(format!("Failed to build URL: {}", e)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept-Profile", &self.schema)
            .header("Content-Profile", &self.schema)
    }

    /// Fetches one page of `table` starting at `offset`.
    async fn select_page(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>, ReconcileError> {
        let mut url = self.endpoint(table)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            if let Some(filter) = filter {
                for (key, value) in filter_params(filter) {
                    query.append_pair(&key, &value);
                }
            }
            query.append_pair("limit", &limit.to_string());
            query.append_pair("offset", &offset.to_string());
        }

        tracing::debug!("GET {}", url);
        let response = self.authorized(self.client.get(url)).send().await?;
        let response = Self::check(response, &format!("select from {}", table)).await?;
        Self::rows(response, table).await
    }

    /// Maps non-success responses onto the error taxonomy.
    async fn check(response: Response, what: &str) -> Result<Response, ReconcileError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);

        tracing::debug!("{} returned {}: {}", what, status, message);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ReconcileError::Connectivity(
                format!("{}: authentication failed ({}): {}", what, status, message),
            ),
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => ReconcileError::Connectivity(format!(
                "{}: endpoint unavailable ({}): {}",
                what, status, message
            )),
            _ => ReconcileError::Rejected(format!("{} returned {}: {}", what, status, message)),
        })
    }

    async fn rows(response: Response, what: &str) -> Result<Vec<Row>, ReconcileError> {
        let body: Value = response.json().await.map_err(|e| {
            ReconcileError::Rejected(format!("Failed to parse {} response: {}", what, e))
        })?;
        match body {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect()),
            Value::Object(row) => Ok(vec![row]),
            other => Err(ReconcileError::Rejected(format!(
                "Unexpected {} response: {}",
                what, other
            ))),
        }
    }
}

/// Translates a filter into PostgREST query parameters.
pub fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    match filter {
        Filter::Eq { column, value } => {
            vec![(column.clone(), format!("eq.{}", value_text(value)))]
        }
        Filter::IsNull { column } => vec![(column.clone(), "is.null".to_string())],
        Filter::Contains { column, needle } => {
            vec![(column.clone(), format!("ilike.*{}*", needle))]
        }
        Filter::In { column, values } => {
            vec![(column.clone(), format!("in.({})", in_list(values)))]
        }
        Filter::All(filters) => filters.iter().flat_map(filter_params).collect(),
        Filter::Any(filters) => vec![(
            "or".to_string(),
            format!(
                "({})",
                filters.iter().map(logic_term).collect::<Vec<_>>().join(",")
            ),
        )],
    }
}

/// Renders a filter inside an `or=(...)` / `and(...)` logic tree.
fn logic_term(filter: &Filter) -> String {
    match filter {
        Filter::Eq { column, value } => format!("{}.eq.{}", column, quote(&value_text(value))),
        Filter::IsNull { column } => format!("{}.is.null", column),
        Filter::Contains { column, needle } => {
            format!("{}.ilike.{}", column, quote(&format!("*{}*", needle)))
        }
        Filter::In { column, values } => format!("{}.in.({})", column, in_list(values)),
        Filter::All(filters) => format!(
            "and({})",
            filters.iter().map(logic_term).collect::<Vec<_>>().join(",")
        ),
        Filter::Any(filters) => format!(
            "or({})",
            filters.iter().map(logic_term).collect::<Vec<_>>().join(",")
        ),
    }
}

fn in_list(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| format!("\"{}\"", escape_quoted(&value_text(v))))
        .collect::<Vec<_>>()
        .join(",")
}

/// Quotes a value when it contains characters reserved by the filter grammar.
fn quote(value: &str) -> String {
    if value.contains(&[',', '.', ':', '(', ')', '"', '\\', ' '][..]) {
        format!("\"{}\"", escape_quoted(value))
    } else {
        value.to_string()
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[async_trait]
impl DataStore for RestDataStore {
    async fn select(
        &self,
        table: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ReconcileError> {
        // The gateway truncates large responses, so read page by page until
        // a short page comes back.
        let mut rows = Vec::new();
        loop {
            let wanted = match limit {
                Some(limit) => limit.saturating_sub(rows.len()).min(PAGE_SIZE),
                None => PAGE_SIZE,
            };
            if wanted == 0 {
                break;
            }
            let page = self.select_page(table, filter, wanted, rows.len()).await?;
            let short = page.len() < wanted;
            rows.extend(page);
            if short {
                break;
            }
            tracing::debug!("{}: read {} row(s) so far, fetching next page", table, rows.len());
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: &Row) -> Result<Row, ReconcileError> {
        let url = self.endpoint(table)?;
        let response = self
            .authorized(self.client.post(url))
            .header("Prefer", "return=representation")
            .json(record)
            .send()
            .await?;
        let response = Self::check(response, &format!("insert into {}", table)).await?;
        Self::rows(response, table)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ReconcileError::Rejected(format!("insert into {} returned no record", table))
            })
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ReconcileError> {
        let mut url = self.endpoint(table)?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in filter_params(filter) {
                query.append_pair(&key, &value);
            }
        }

        tracing::debug!("DELETE {}", url);
        let response = self
            .authorized(self.client.delete(url))
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let response = Self::check(response, &format!("delete from {}", table)).await?;
        Ok(Self::rows(response, table).await?.len() as u64)
    }

    async fn exec(&self, statement: &str) -> Result<(), ReconcileError> {
        let url = self.endpoint(&format!("rpc/{}", self.exec_rpc))?;
        tracing::debug!("RPC {}: {}", self.exec_rpc, statement);
        let response = self
            .authorized(self.client.post(url))
            .json(&json!({ "sql": statement }))
            .send()
            .await?;
        Self::check(response, &format!("rpc {}", self.exec_rpc)).await?;
        Ok(())
    }

    async fn identify(&self, probe_table: &str) -> Result<String, ReconcileError> {
        let mut url = self.endpoint(probe_table)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("limit", "1");

        let response = self.authorized(self.client.get(url)).send().await?;
        let response = Self::check(response, &format!("probe {}", probe_table)).await?;

        if let Some(project) = response
            .headers()
            .get(PROJECT_REF_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Ok(project.to_lowercase());
        }

        // No gateway header: fall back to the host that finally answered,
        // which differs from the configured one when the URL redirects.
        tenant_id_from_url(response.url()).ok_or_else(|| {
            ReconcileError::Rejected("probe response did not identify a tenant".to_string())
        })
    }
}
