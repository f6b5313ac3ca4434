//! Environment resolution: which tenant is this process talking to?

use crate::config::TenantSettings;
use crate::errors::{ReconcileError, ReportedError};
use crate::store::DataStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Where a tenant's access key came from, plus the key itself.
#[derive(Clone)]
pub struct CredentialRef {
    /// Name of the configuration variable that supplied the key.
    pub source: String,
    secret: String,
}

impl CredentialRef {
    pub fn new(source: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialRef({}: [REDACTED])", self.source)
    }
}

/// The logical database a process is bound to. Resolved once at start.
#[derive(Debug, Clone)]
pub struct TenantBinding {
    pub tenant_id: String,
    pub endpoint_url: Url,
    pub credential_ref: CredentialRef,
    /// Human label from the known-tenant registry, if any.
    pub label: Option<String>,
}

impl TenantBinding {
    /// `label (tenant_id)` when a label is known, otherwise the id.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", label, self.tenant_id),
            None => self.tenant_id.clone(),
        }
    }
}

/// Resolves a binding for the hosted REST endpoint of a tenant.
///
/// Fails with [`ReconcileError::Configuration`] when the URL or key is absent
/// or the URL is malformed. Makes no remote call.
pub fn resolve_binding(
    settings: &TenantSettings,
    known_tenants: &BTreeMap<String, String>,
) -> Result<TenantBinding, ReconcileError> {
    let raw_url = settings.endpoint_url.as_deref().ok_or_else(|| {
        ReconcileError::Configuration(format!("{}_URL environment variable required", settings.prefix))
    })?;
    let (key_var, key) = match (&settings.key_var, &settings.access_key) {
        (Some(var), Some(key)) => (var.clone(), key.clone()),
        _ => {
            return Err(ReconcileError::Configuration(format!(
                "{}_KEY (or _ANON_KEY / _SERVICE_ROLE_KEY) environment variable required",
                settings.prefix
            )))
        }
    };

    let endpoint_url = Url::parse(raw_url).map_err(|e| {
        ReconcileError::Configuration(format!("{}_URL is not a valid URL: {}", settings.prefix, e))
    })?;
    if endpoint_url.scheme() != "http" && endpoint_url.scheme() != "https" {
        return Err(ReconcileError::Configuration(format!(
            "{}_URL must start with http:// or https://",
            settings.prefix
        )));
    }

    let tenant_id = tenant_id_from_url(&endpoint_url).ok_or_else(|| {
        ReconcileError::Configuration(format!(
            "{}_URL does not name a tenant: {}",
            settings.prefix, endpoint_url
        ))
    })?;

    Ok(TenantBinding {
        label: known_tenants.get(&tenant_id).cloned(),
        tenant_id,
        endpoint_url,
        credential_ref: CredentialRef::new(key_var, key),
    })
}

/// Resolves a binding for a direct Postgres connection URL.
pub fn resolve_database_binding(
    database_url: &str,
    known_tenants: &BTreeMap<String, String>,
) -> Result<TenantBinding, ReconcileError> {
    let endpoint_url = Url::parse(database_url).map_err(|e| {
        ReconcileError::Configuration(format!("DATABASE_URL is not a valid URL: {}", e))
    })?;
    let tenant_id = tenant_id_from_url(&endpoint_url).ok_or_else(|| {
        ReconcileError::Configuration("DATABASE_URL does not name a tenant".to_string())
    })?;

    Ok(TenantBinding {
        label: known_tenants.get(&tenant_id).cloned(),
        tenant_id,
        endpoint_url,
        credential_ref: CredentialRef::new("DATABASE_URL", database_url),
    })
}

/// Extracts the tenant identifier embedded in an endpoint URL.
///
/// - `https://<ref>.supabase.co` → `<ref>`
/// - `postgresql://postgres.<ref>:pw@pooler-host/postgres` → `<ref>`
/// - `postgresql://postgres:pw@db.<ref>.supabase.co/postgres` → `<ref>`
/// - anything else → first label of the host
pub fn tenant_id_from_url(url: &Url) -> Option<String> {
    if url.scheme().starts_with("postgres") {
        if let Some((_, project)) = url.username().split_once('.') {
            if !project.is_empty() {
                return Some(project.to_lowercase());
            }
        }
    }

    let host = url.host_str()?.to_lowercase();
    match url.host()? {
        url::Host::Domain(_) => {
            let mut labels = host.split('.');
            let first = labels.next()?;
            let id = if first == "db" {
                labels.next().unwrap_or(first)
            } else {
                first
            };
            (!id.is_empty()).then(|| id.to_string())
        }
        _ => Some(host),
    }
}

/// Result of probing a binding against the live store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingVerification {
    pub connected: bool,
    pub configured_tenant_id: String,
    pub observed_tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
}

impl BindingVerification {
    /// Connected, but to a different tenant than configured.
    ///
    /// This is a misconfiguration, not a connectivity failure.
    pub fn is_misconfigured(&self) -> bool {
        self.connected
            && self
                .observed_tenant_id
                .as_deref()
                .map(|observed| observed != self.configured_tenant_id)
                .unwrap_or(false)
    }

    /// Connected to the configured tenant.
    pub fn is_verified(&self) -> bool {
        self.connected && !self.is_misconfigured()
    }
}

/// Performs a read-only probe through `store` and compares the tenant it
/// reaches with the configured one. Never returns an error: failures come
/// back as `connected: false` so callers can show them to an operator.
pub async fn verify_binding(
    binding: &TenantBinding,
    store: &dyn DataStore,
    probe_table: &str,
    known_tenants: &BTreeMap<String, String>,
) -> BindingVerification {
    match store.identify(probe_table).await {
        Ok(observed) => {
            if observed != binding.tenant_id {
                tracing::warn!(
                    "Binding mismatch: configured {} but connection reached {}",
                    binding.display_name(),
                    observed
                );
            } else {
                tracing::info!("✓ Binding verified: {}", binding.display_name());
            }
            BindingVerification {
                connected: true,
                configured_tenant_id: binding.tenant_id.clone(),
                observed_label: known_tenants.get(&observed).cloned(),
                observed_tenant_id: Some(observed),
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!("Could not verify binding {}: {}", binding.display_name(), e);
            BindingVerification {
                connected: false,
                configured_tenant_id: binding.tenant_id.clone(),
                observed_tenant_id: None,
                observed_label: None,
                error: Some(ReportedError::from(&e)),
            }
        }
    }
}
