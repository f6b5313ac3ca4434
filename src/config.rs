use crate::errors::ReconcileError;
use crate::models::ColumnRename;
use crate::type_hints::{TypeHintRule, TypeHints};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Tables reconciled when `RECONCILER_TABLES` is not set.
pub const DEFAULT_TABLES: &[&str] = &[
    "patients",
    "admissions",
    "appointments",
    "beds",
    "wards",
    "transactions",
];

/// Raw connection settings for one tenant, as found in the environment.
///
/// Values are kept optional here: whether their absence is fatal depends on
/// whether the command needs that tenant, and is decided by
/// [`crate::binding::resolve_binding`].
#[derive(Clone)]
pub struct TenantSettings {
    /// Environment prefix the settings were read from, e.g. `SUPABASE`.
    pub prefix: String,
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    /// Name of the variable that supplied `access_key`.
    pub key_var: Option<String>,
}

impl std::fmt::Debug for TenantSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSettings")
            .field("prefix", &self.prefix)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .field("key_var", &self.key_var)
            .finish()
    }
}

impl TenantSettings {
    /// Reads `<PREFIX>_URL` and the first of `<PREFIX>_SERVICE_ROLE_KEY`,
    /// `<PREFIX>_KEY`, `<PREFIX>_ANON_KEY` for each prefix in order; the first
    /// prefix that yields a URL wins.
    pub fn from_lookup<F>(prefixes: &[&str], lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        for prefix in prefixes {
            let Some(url) = non_empty(&format!("{}_URL", prefix)) else {
                continue;
            };
            let (key_var, access_key) = ["SERVICE_ROLE_KEY", "KEY", "ANON_KEY"]
                .iter()
                .map(|suffix| format!("{}_{}", prefix, suffix))
                .find_map(|var| non_empty(&var).map(|key| (Some(var), Some(key))))
                .unwrap_or((None, None));
            return Self {
                prefix: prefix.to_string(),
                endpoint_url: Some(url.trim().to_string()),
                access_key,
                key_var,
            };
        }

        Self {
            prefix: prefixes.first().copied().unwrap_or_default().to_string(),
            endpoint_url: None,
            access_key: None,
            key_var: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The tenant being brought up to parity (and swept).
    pub target: TenantSettings,
    /// The tenant whose schema is treated as the reference.
    pub reference: TenantSettings,
    /// Direct Postgres URL for the target; when set, the sqlx backend is used.
    pub database_url: Option<String>,
    pub schema: String,
    pub tables: Vec<String>,
    /// Table read by `verify` to confirm the binding.
    pub probe_table: String,
    /// Tenant id -> human label, e.g. the hospital the project belongs to.
    pub known_tenants: BTreeMap<String, String>,
    pub type_hints: Vec<TypeHintRule>,
    pub renames: Vec<ColumnRename>,
    /// Remote procedure the REST backend calls to execute change statements.
    pub exec_rpc: String,
    pub run_log: Option<PathBuf>,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ReconcileError> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|name| std::env::var(name).ok())?;

        tracing::info!("Configuration loaded successfully");
        if let Some(ref url) = config.target.endpoint_url {
            tracing::debug!("Target endpoint: {}", url);
        }
        if let Some(ref url) = config.reference.endpoint_url {
            tracing::debug!("Reference endpoint: {}", url);
        }
        if let Some(ref url) = config.database_url {
            // Never log credentials embedded in the URL
            tracing::debug!("Database URL: {}...", url.chars().take(20).collect::<String>());
        }
        tracing::debug!("Tables: {}", config.tables.join(", "));

        Ok(config)
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ReconcileError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = match var("DATABASE_URL").or_else(|| var("DB_URL")) {
            Some(url) => {
                if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                    return Err(ReconcileError::Configuration(
                        "DATABASE_URL must start with postgresql:// or postgres://".to_string(),
                    ));
                }
                Some(url)
            }
            None => None,
        };

        let tables = match var("RECONCILER_TABLES") {
            Some(list) => split_list(&list),
            None => DEFAULT_TABLES.iter().map(|t| t.to_string()).collect(),
        };
        if tables.is_empty() {
            return Err(ReconcileError::Configuration(
                "RECONCILER_TABLES cannot be empty".to_string(),
            ));
        }

        let known_tenants = match var("RECONCILER_KNOWN_TENANTS") {
            Some(raw) => parse_pairs(&raw, "RECONCILER_KNOWN_TENANTS")?
                .into_iter()
                .collect(),
            None => BTreeMap::new(),
        };

        let type_hints = match var("RECONCILER_TYPE_HINTS") {
            Some(raw) => TypeHints::parse_overrides(&raw).map_err(|e| {
                ReconcileError::Configuration(format!("RECONCILER_TYPE_HINTS: {}", e))
            })?,
            None => Vec::new(),
        };

        let renames = match var("RECONCILER_RENAMES") {
            Some(raw) => parse_renames(&raw)?,
            None => Vec::new(),
        };

        let http_timeout = match var("RECONCILER_HTTP_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(secs.trim().parse().map_err(|_| {
                ReconcileError::Configuration(
                    "RECONCILER_HTTP_TIMEOUT_SECS must be a whole number of seconds".to_string(),
                )
            })?),
            None => Duration::from_secs(30),
        };

        Ok(Self {
            target: TenantSettings::from_lookup(&["SUPABASE", "VITE_SUPABASE"], &lookup),
            reference: TenantSettings::from_lookup(&["REFERENCE_SUPABASE"], &lookup),
            database_url,
            schema: var("RECONCILER_SCHEMA").unwrap_or_else(|| "public".to_string()),
            tables,
            probe_table: var("RECONCILER_PROBE_TABLE").unwrap_or_else(|| "patients".to_string()),
            known_tenants,
            type_hints,
            renames,
            exec_rpc: var("RECONCILER_EXEC_RPC").unwrap_or_else(|| "exec_sql".to_string()),
            run_log: var("RECONCILER_RUN_LOG").map(PathBuf::from),
            http_timeout,
        })
    }

    pub fn hints(&self) -> TypeHints {
        TypeHints::new(self.type_hints.clone())
    }

    /// Renames configured for one table.
    pub fn renames_for(&self, table: &str) -> Vec<ColumnRename> {
        self.renames
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_pairs(raw: &str, var: &str) -> Result<Vec<(String, String)>, ReconcileError> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| {
                    ReconcileError::Configuration(format!(
                        "{}: '{}' must look like key=value",
                        var, entry
                    ))
                })
        })
        .collect()
}

/// Parses `table.old=new` entries.
fn parse_renames(raw: &str) -> Result<Vec<ColumnRename>, ReconcileError> {
    parse_pairs(raw, "RECONCILER_RENAMES")?
        .into_iter()
        .map(|(qualified, to)| {
            let (table, from) = qualified.split_once('.').ok_or_else(|| {
                ReconcileError::Configuration(format!(
                    "RECONCILER_RENAMES: '{}' must look like table.old=new",
                    qualified
                ))
            })?;
            Ok(ColumnRename {
                table: table.to_string(),
                from: from.to_string(),
                to,
            })
        })
        .collect()
}
