use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_reconciler::binding::{
    resolve_binding, resolve_database_binding, verify_binding, BindingVerification, TenantBinding,
};
use tenant_reconciler::cancel::CancelFlag;
use tenant_reconciler::config::{Config, TenantSettings};
use tenant_reconciler::errors::{ReconcileError, ReportedError};
use tenant_reconciler::integrity::{check_integrity, default_rules};
use tenant_reconciler::introspect::{introspect, IntrospectOptions};
use tenant_reconciler::migration::to_sql;
use tenant_reconciler::models::{SweepReport, SweepTarget, TableShape};
use tenant_reconciler::pg_store::PgDataStore;
use tenant_reconciler::reconcile::{reconcile, ReconcileOptions, ReconcileReport, Tenant};
use tenant_reconciler::rest_store::RestDataStore;
use tenant_reconciler::run_log::RunLog;
use tenant_reconciler::store::DataStore;
use tenant_reconciler::sweep::{default_targets, sweep, SweepPredicate, SweepRequest};

#[derive(Parser)]
#[command(name = "reconciler")]
#[command(about = "Keeps hospital tenants in schema parity and free of test data", long_about = None)]
struct Cli {
    /// Print reports as JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that each configured tenant is the one the connection reaches
    Verify,
    /// Print the inferred shape of tables
    Introspect {
        /// Tables to inspect (defaults to RECONCILER_TABLES)
        tables: Vec<String>,
        /// Inspect the reference tenant instead of the target
        #[arg(long)]
        reference: bool,
        /// Never insert probe rows into empty tables
        #[arg(long)]
        no_probe: bool,
    },
    /// Show the additive migration the target needs without applying it
    Diff(ScopeArgs),
    /// Add missing columns and apply configured renames on the target
    Migrate {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Plan only
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove test records, children before parents
    Sweep {
        /// Case-insensitive substring identifying records to remove
        #[arg(long)]
        pattern: String,
        /// table:rank:field,field or table:rank:column->parent (repeatable)
        #[arg(long = "target")]
        targets: Vec<SweepTarget>,
        /// Delete the previewed rows; without this only the preview runs
        #[arg(long)]
        execute: bool,
        /// Report occupied beds whose patient is missing or being removed
        #[arg(long)]
        check_integrity: bool,
    },
    /// Report occupied beds without an existing patient
    Integrity,
}

#[derive(Args)]
struct ScopeArgs {
    /// Comma-separated tables (defaults to RECONCILER_TABLES)
    #[arg(long, value_delimiter = ',')]
    tables: Vec<String>,
    /// Never insert probe rows into empty tables
    #[arg(long)]
    no_probe: bool,
}

/// A resolved binding together with the store that reaches it.
struct Connection {
    binding: TenantBinding,
    store: Box<dyn DataStore>,
}

impl Connection {
    fn rest(settings: &TenantSettings, config: &Config) -> Result<Self, ReconcileError> {
        let binding = resolve_binding(settings, &config.known_tenants)?;
        let store = RestDataStore::new(
            &binding,
            &config.schema,
            &config.exec_rpc,
            config.http_timeout,
        )?;
        tracing::info!("{} via REST: {}", binding.display_name(), binding.endpoint_url);
        Ok(Self {
            binding,
            store: Box::new(store),
        })
    }

    /// The target goes through Postgres directly when DATABASE_URL is set.
    fn target(config: &Config) -> Result<Self, ReconcileError> {
        match &config.database_url {
            Some(url) => {
                let binding = resolve_database_binding(url, &config.known_tenants)?;
                let store = PgDataStore::connect_lazy(url, &config.schema)?;
                tracing::info!("{} via direct Postgres", binding.display_name());
                Ok(Self {
                    binding,
                    store: Box::new(store),
                })
            }
            None => Self::rest(&config.target, config),
        }
    }

    fn reference(config: &Config) -> Result<Self, ReconcileError> {
        Self::rest(&config.reference, config)
    }

    fn tenant(&self) -> Tenant<'_> {
        Tenant {
            binding: &self.binding,
            store: self.store.as_ref(),
        }
    }

    async fn verify(&self, config: &Config) -> BindingVerification {
        verify_binding(
            &self.binding,
            self.store.as_ref(),
            &config.probe_table,
            &config.known_tenants,
        )
        .await
    }
}

#[derive(Serialize)]
struct VerifyOutput {
    target: BindingVerification,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<BindingVerification>,
}

#[derive(Serialize)]
struct IntrospectOutput {
    table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<TableShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ReportedError>,
}

/// Reports about a tenant that was not safe to touch.
#[derive(Serialize)]
struct Refused {
    verification: BindingVerification,
    reason: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout stays a clean report
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_reconciler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Configuration errors are fatal and halt before any remote call
    let config = Config::from_env()?;

    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();
    let run_log = RunLog::new(config.run_log.clone());
    if let Some(path) = run_log.path() {
        tracing::info!("Run {} logging to {}", run_log.run_id(), path.display());
    }

    let ok = match cli.command {
        Commands::Verify => run_verify(&config, cli.json).await?,
        Commands::Introspect {
            tables,
            reference,
            no_probe,
        } => run_introspect(&config, tables, reference, !no_probe, cli.json).await?,
        Commands::Diff(scope) => {
            run_reconcile(&config, scope, true, &cancel, &run_log, cli.json).await?
        }
        Commands::Migrate { scope, dry_run } => {
            run_reconcile(&config, scope, dry_run, &cancel, &run_log, cli.json).await?
        }
        Commands::Sweep {
            pattern,
            targets,
            execute,
            check_integrity,
        } => {
            let request = SweepRequest {
                predicate: SweepPredicate::new(&pattern)?,
                targets: if targets.is_empty() {
                    default_targets()
                } else {
                    targets
                },
                dry_run: !execute,
                integrity_rules: if check_integrity {
                    default_rules()
                } else {
                    Vec::new()
                },
            };
            run_sweep(&config, &request, &cancel, &run_log, cli.json).await?
        }
        Commands::Integrity => run_integrity(&config, cli.json).await?,
    };

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(check: &BindingVerification) -> String {
    let observed = match (&check.observed_tenant_id, &check.observed_label) {
        (Some(id), Some(label)) => format!("{} ({})", id, label),
        (Some(id), None) => id.clone(),
        (None, _) => "nothing".to_string(),
    };
    if !check.connected {
        let reason = check
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("unknown error");
        format!("{}: unreachable: {}", check.configured_tenant_id, reason)
    } else if check.is_misconfigured() {
        format!(
            "{}: MISCONFIGURED, connection reached {}",
            check.configured_tenant_id, observed
        )
    } else {
        format!("{}: verified, reached {}", check.configured_tenant_id, observed)
    }
}

/// Verifies the target before anything touches it. Returns the refusal when
/// the connection does not reach the configured tenant.
async fn guard(conn: &Connection, config: &Config) -> Result<(), Refused> {
    let verification = conn.verify(config).await;
    if verification.is_verified() {
        return Ok(());
    }
    let reason = if verification.connected {
        format!(
            "configured as {} but the connection reached {}",
            conn.binding.display_name(),
            verification
                .observed_tenant_id
                .as_deref()
                .unwrap_or("an unknown tenant")
        )
    } else {
        format!("{} is unreachable", conn.binding.display_name())
    };
    tracing::error!("Refusing to continue: {}", reason);
    Err(Refused {
        verification,
        reason,
    })
}

fn print_refused(refused: &Refused, json: bool) -> anyhow::Result<bool> {
    if json {
        print_json(refused)?;
    } else {
        println!("refused: {}", refused.reason);
        println!("  {}", describe(&refused.verification));
    }
    Ok(false)
}

async fn run_verify(config: &Config, json: bool) -> anyhow::Result<bool> {
    let target = Connection::target(config)?;
    let reference = if config.reference.endpoint_url.is_some() {
        Some(Connection::reference(config)?)
    } else {
        None
    };

    let output = VerifyOutput {
        target: target.verify(config).await,
        reference: match &reference {
            Some(conn) => Some(conn.verify(config).await),
            None => None,
        },
    };
    let ok = output.target.is_verified()
        && output
            .reference
            .as_ref()
            .map(BindingVerification::is_verified)
            .unwrap_or(true);

    if json {
        print_json(&output)?;
    } else {
        println!("target     {}", describe(&output.target));
        if let Some(check) = &output.reference {
            println!("reference  {}", describe(check));
        }
    }
    Ok(ok)
}

async fn run_introspect(
    config: &Config,
    tables: Vec<String>,
    reference: bool,
    allow_probe: bool,
    json: bool,
) -> anyhow::Result<bool> {
    let conn = if reference {
        Connection::reference(config)?
    } else {
        Connection::target(config)?
    };
    if let Err(refused) = guard(&conn, config).await {
        return print_refused(&refused, json);
    }

    let tables = if tables.is_empty() {
        config.tables.clone()
    } else {
        tables
    };
    let hints = config.hints();

    let mut outputs = Vec::new();
    for table in tables {
        let options = IntrospectOptions {
            allow_probe,
            reference: None,
        };
        let output = match introspect(conn.store.as_ref(), &table, &hints, options).await {
            Ok(shape) => IntrospectOutput {
                table,
                shape: Some(shape),
                error: None,
            },
            Err(e) => IntrospectOutput {
                table,
                shape: None,
                error: Some(ReportedError::from(&e)),
            },
        };
        outputs.push(output);
    }
    let ok = outputs.iter().all(|o| o.error.is_none());

    if json {
        print_json(&outputs)?;
        return Ok(ok);
    }
    for output in &outputs {
        match (&output.shape, &output.error) {
            (Some(shape), _) => {
                println!("{} ({:?})", shape.table_name, shape.origin);
                for column in &shape.columns {
                    println!(
                        "  {:<32} {}{}",
                        column.name,
                        column.inferred_type,
                        if column.nullable { "" } else { " not null" }
                    );
                }
                for note in &shape.notes {
                    println!("  note: {}", note);
                }
            }
            (None, Some(error)) => println!("{}: {}", output.table, error.message),
            (None, None) => {}
        }
    }
    Ok(ok)
}

async fn run_reconcile(
    config: &Config,
    scope: ScopeArgs,
    dry_run: bool,
    cancel: &CancelFlag,
    run_log: &RunLog,
    json: bool,
) -> anyhow::Result<bool> {
    let reference = Connection::reference(config)?;
    let target = Connection::target(config)?;

    let options = ReconcileOptions {
        schema: config.schema.clone(),
        tables: if scope.tables.is_empty() {
            config.tables.clone()
        } else {
            scope.tables
        },
        probe_table: config.probe_table.clone(),
        dry_run,
        allow_probe: !scope.no_probe,
        hints: config.hints(),
        renames: config.renames.clone(),
        known_tenants: config.known_tenants.clone(),
    };

    let report = reconcile(
        reference.tenant(),
        target.tenant(),
        &options,
        cancel,
        run_log,
    )
    .await;

    if json {
        print_json(&report)?;
    } else {
        print_reconcile(&report);
    }
    Ok(report.is_success())
}

fn print_reconcile(report: &ReconcileReport) {
    println!("reference  {}", describe(&report.reference));
    println!("target     {}", describe(&report.target));
    if let Some(reason) = &report.aborted {
        println!("aborted: {}", reason);
        return;
    }

    for table in &report.tables {
        let shapes = table.reference.iter().chain(table.target.iter());
        for shape in shapes {
            for note in &shape.notes {
                println!("{}: note: {}", shape.table_name, note);
            }
        }
        if let Some(error) = &table.error {
            println!("{}: skipped: {}", table.table, error.message);
            continue;
        }
        if let Some(diff) = &table.diff {
            for drift in &diff.type_drift {
                println!(
                    "{}.{}: reference looks {} but target looks {} (left unchanged)",
                    table.table, drift.column, drift.reference, drift.target
                );
            }
        }
    }

    if report.plan.is_empty() {
        if report.tables.iter().all(|t| t.error.is_none()) {
            println!("target is up to date");
        } else {
            println!("no changes planned for the tables that could be compared");
        }
        return;
    }
    println!();
    print!("{}", to_sql(&report.plan));

    match &report.execution {
        Some(execution) => {
            println!();
            println!(
                "applied {}, failed {}, skipped {}",
                execution.applied,
                execution.failed.len(),
                execution.skipped.len()
            );
            for failed in &execution.failed {
                println!("  failed: {}: {}", failed.step.statement, failed.error.message);
            }
        }
        None if report.dry_run => println!("\n(dry run, nothing applied)"),
        None => {}
    }
}

async fn run_sweep(
    config: &Config,
    request: &SweepRequest,
    cancel: &CancelFlag,
    run_log: &RunLog,
    json: bool,
) -> anyhow::Result<bool> {
    let conn = Connection::target(config)?;
    if let Err(refused) = guard(&conn, config).await {
        return print_refused(&refused, json);
    }

    let report = sweep(
        conn.store.as_ref(),
        request,
        cancel,
        run_log,
        &conn.binding.tenant_id,
    )
    .await;

    if json {
        print_json(&report)?;
    } else {
        print_sweep(&report);
    }
    Ok(report.is_success())
}

fn print_sweep(report: &SweepReport) {
    for table in &report.tables {
        match &table.error {
            Some(error) => println!("{}: failed: {}", table.table_name, error.message),
            None if report.dry_run => {
                println!("{}: {} row(s) would be deleted", table.table_name, table.matched.len())
            }
            None => println!(
                "{}: {} matched, {} deleted",
                table.table_name,
                table.matched.len(),
                table.deleted
            ),
        }
        for row in &table.matched {
            println!("  {}", serde_json::Value::Object(row.identity.clone()));
        }
    }
    for warning in &report.warnings {
        println!("warning: {} {}: {}", warning.table, warning.row_id, warning.message);
    }
    if report.dry_run {
        println!(
            "\n{} row(s) matched; re-run with --execute to delete them",
            report.total_matched()
        );
    } else {
        println!(
            "\n{} of {} matched row(s) deleted",
            report.total_deleted(),
            report.total_matched()
        );
    }
}

async fn run_integrity(config: &Config, json: bool) -> anyhow::Result<bool> {
    let conn = Connection::target(config)?;
    if let Err(refused) = guard(&conn, config).await {
        return print_refused(&refused, json);
    }

    let report = check_integrity(conn.store.as_ref(), &default_rules(), &HashMap::new()).await;

    if json {
        print_json(&report)?;
    } else {
        for warning in &report.warnings {
            println!("{} {}: {}", warning.table, warning.row_id, warning.message);
        }
        for error in &report.errors {
            println!("could not check: {}", error.message);
        }
        println!("{} warning(s)", report.warnings.len());
    }
    Ok(report.errors.is_empty())
}
