/// End-to-end reconciliation against in-memory tenants
/// Covers binding checks, introspection, diffing, planning and execution
use serde_json::json;
use std::collections::BTreeMap;
use url::Url;

use tenant_reconciler::binding::{verify_binding, CredentialRef, TenantBinding};
use tenant_reconciler::cancel::CancelFlag;
use tenant_reconciler::core::diff::diff;
use tenant_reconciler::core::errors::ErrorKind;
use tenant_reconciler::core::migration::{execute, plan};
use tenant_reconciler::core::models::{ColumnShape, ColumnType, ShapeOrigin, StepKind, TableShape};
use tenant_reconciler::data::memory_store::{MemoryDataStore, StoreOp};
use tenant_reconciler::introspect::{introspect, IntrospectOptions};
use tenant_reconciler::models::ColumnRename;
use tenant_reconciler::reconcile::{reconcile, ReconcileOptions, Tenant};
use tenant_reconciler::run_log::RunLog;
use tenant_reconciler::type_hints::TypeHints;

const REFERENCE_ID: &str = "oghqwddhojnryovmfvzc";
const TARGET_ID: &str = "btoeupnfqkioxigrheyp";

fn binding(tenant_id: &str) -> TenantBinding {
    TenantBinding {
        tenant_id: tenant_id.to_string(),
        endpoint_url: Url::parse(&format!("https://{}.supabase.co", tenant_id)).unwrap(),
        credential_ref: CredentialRef::new("SUPABASE_KEY", "test-key"),
        label: None,
    }
}

fn known_tenants() -> BTreeMap<String, String> {
    BTreeMap::from([
        (REFERENCE_ID.to_string(), "Central Hospital".to_string()),
        (TARGET_ID.to_string(), "Riverside Clinic".to_string()),
    ])
}

fn options(tables: &[&str], dry_run: bool) -> ReconcileOptions {
    ReconcileOptions {
        schema: "public".to_string(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        probe_table: "patients".to_string(),
        dry_run,
        allow_probe: true,
        hints: TypeHints::default(),
        renames: Vec::new(),
        known_tenants: known_tenants(),
    }
}

fn reference_store() -> MemoryDataStore {
    MemoryDataStore::new(REFERENCE_ID).with_table(
        "patients",
        &[
            ("name", ColumnType::Text),
            ("age", ColumnType::Integer),
            ("fee", ColumnType::Numeric),
        ],
        vec![json!({"name": "Ada Lovelace", "age": 36, "fee": 120.5})],
    )
}

fn target_store() -> MemoryDataStore {
    MemoryDataStore::new(TARGET_ID).with_table(
        "patients",
        &[("name", ColumnType::Text)],
        vec![json!({"name": "Grace Hopper"})],
    )
}

#[tokio::test]
async fn test_missing_columns_are_added_once() {
    let reference = reference_store();
    let target = target_store();
    let hints = TypeHints::default();

    let reference_shape = introspect(&reference, "patients", &hints, IntrospectOptions::default())
        .await
        .unwrap();
    let target_shape = introspect(&target, "patients", &hints, IntrospectOptions::default())
        .await
        .unwrap();

    let schema_diff = diff(&reference_shape, &target_shape);
    let missing: Vec<_> = schema_diff
        .missing_columns
        .iter()
        .map(|c| (c.name.as_str(), c.inferred_type))
        .collect();
    assert_eq!(
        missing,
        vec![("age", ColumnType::Integer), ("fee", ColumnType::Numeric)]
    );

    let steps = plan(&[schema_diff], "public");
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.idempotent));
    assert!(steps
        .iter()
        .all(|s| matches!(s.kind, StepKind::AddColumn { .. })));

    let cancel = CancelFlag::new();
    let log = RunLog::disabled();
    let first = execute(&target, steps.clone(), &cancel, &log, TARGET_ID).await;
    let second = execute(&target, steps, &cancel, &log, TARGET_ID).await;

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(second.applied, 2);
    assert_eq!(target.columns("patients"), vec!["name", "age", "fee"]);
    assert_eq!(target.column_type("patients", "fee"), Some(ColumnType::Numeric));
}

#[tokio::test]
async fn test_sampling_never_mutates() {
    let reference = reference_store();
    introspect(
        &reference,
        "patients",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();
    assert!(reference.mutations().is_empty());
}

#[tokio::test]
async fn test_verify_reports_mismatch_as_misconfiguration() {
    // Configured for the reference hospital, but the key reaches another tenant
    let store = MemoryDataStore::new(TARGET_ID).with_table("patients", &[], vec![]);
    let check = verify_binding(&binding(REFERENCE_ID), &store, "patients", &known_tenants()).await;

    assert!(check.connected);
    assert!(check.is_misconfigured());
    assert!(!check.is_verified());
    assert_eq!(check.configured_tenant_id, REFERENCE_ID);
    assert_eq!(check.observed_tenant_id.as_deref(), Some(TARGET_ID));
    assert_eq!(check.observed_label.as_deref(), Some("Riverside Clinic"));
    assert!(check.error.is_none());
}

#[tokio::test]
async fn test_verify_unreachable_is_connectivity() {
    let store = target_store();
    store.set_offline(true);
    let check = verify_binding(&binding(TARGET_ID), &store, "patients", &known_tenants()).await;

    assert!(!check.connected);
    assert!(!check.is_misconfigured());
    assert_eq!(check.error.map(|e| e.kind), Some(ErrorKind::Connectivity));
}

#[tokio::test]
async fn test_reconcile_end_to_end() {
    let reference = reference_store();
    let target = target_store();
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &target,
        },
        &options(&["patients"], false),
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert!(report.is_success(), "{:?}", report);
    assert!(report.target.is_verified());
    assert_eq!(report.plan.len(), 2);
    assert_eq!(report.execution.as_ref().map(|e| e.applied), Some(2));
    assert_eq!(target.columns("patients"), vec!["name", "age", "fee"]);
    assert!(reference.mutations().is_empty());
}

#[tokio::test]
async fn test_reconcile_dry_run_only_plans() {
    let reference = reference_store();
    let target = target_store();
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &target,
        },
        &options(&["patients"], true),
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert!(report.dry_run);
    assert_eq!(report.plan.len(), 2);
    assert!(report.execution.is_none());
    assert!(target.mutations().is_empty());
}

#[tokio::test]
async fn test_reconcile_aborts_on_misconfigured_target() {
    let reference = reference_store();
    // Binding says target, connection reaches the reference tenant
    let wrong = MemoryDataStore::new(REFERENCE_ID).with_table(
        "patients",
        &[("name", ColumnType::Text)],
        vec![json!({"name": "Grace Hopper"})],
    );
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &wrong,
        },
        &options(&["patients"], false),
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert!(!report.is_success());
    assert!(report.target.is_misconfigured());
    assert!(report.aborted.is_some());
    assert!(report.tables.is_empty());
    assert!(wrong.mutations().is_empty());
}

#[tokio::test]
async fn test_reconcile_refuses_same_tenant() {
    let reference = reference_store();
    let target = MemoryDataStore::new(REFERENCE_ID).with_table("patients", &[], vec![]);
    let same = binding(REFERENCE_ID);

    let report = reconcile(
        Tenant {
            binding: &same,
            store: &reference,
        },
        Tenant {
            binding: &same,
            store: &target,
        },
        &options(&["patients"], false),
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert!(report
        .aborted
        .as_deref()
        .unwrap_or_default()
        .contains("same tenant"));
    assert!(target.mutations().is_empty());
}

#[tokio::test]
async fn test_failed_step_does_not_block_others() {
    let reference = reference_store();
    let target = target_store();
    target.fail_statements_containing("\"age\"");
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &target,
        },
        &options(&["patients"], false),
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    let execution = report.execution.as_ref().unwrap();
    assert_eq!(execution.applied, 1);
    assert_eq!(execution.failed.len(), 1);
    assert_eq!(execution.failed[0].error.kind, ErrorKind::SchemaConflict);
    assert!(!report.is_success());
    assert_eq!(target.columns("patients"), vec!["name", "fee"]);
}

#[tokio::test]
async fn test_missing_table_is_isolated() {
    let reference = reference_store().with_table(
        "wards",
        &[("id", ColumnType::Integer), ("ward_name", ColumnType::Text)],
        vec![json!({"id": 1, "ward_name": "North"})],
    );
    let target = target_store();
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &target,
        },
        &options(&["wards", "patients"], false),
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert_eq!(report.tables.len(), 2);
    assert!(report.tables[0].error.is_some());
    assert!(report.tables[1].error.is_none());
    assert_eq!(report.execution.as_ref().map(|e| e.applied), Some(2));
}

#[tokio::test]
async fn test_cancelled_run_skips_remaining_steps() {
    let target = target_store();
    let reference_shape = introspect(
        &reference_store(),
        "patients",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();
    let target_shape = introspect(
        &target,
        "patients",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();
    let steps = plan(&[diff(&reference_shape, &target_shape)], "public");

    let cancel = CancelFlag::new();
    cancel.cancel();
    let report = execute(&target, steps, &cancel, &RunLog::disabled(), TARGET_ID).await;

    assert_eq!(report.applied, 0);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.failed.is_empty());
    assert!(target.mutations().is_empty());
}

#[tokio::test]
async fn test_configured_rename_runs_before_adds() {
    let reference = MemoryDataStore::new(REFERENCE_ID).with_table(
        "patients",
        &[("full_name", ColumnType::Text), ("ward", ColumnType::Text)],
        vec![json!({"full_name": "Ada Lovelace", "ward": "North"})],
    );
    let target = MemoryDataStore::new(TARGET_ID).with_table(
        "patients",
        &[("name", ColumnType::Text)],
        vec![json!({"name": "Grace Hopper"})],
    );
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);
    let mut options = options(&["patients"], false);
    options.renames = vec![ColumnRename {
        table: "patients".to_string(),
        from: "name".to_string(),
        to: "full_name".to_string(),
    }];

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &target,
        },
        &options,
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert!(report.is_success(), "{:?}", report);
    assert!(matches!(report.plan[0].kind, StepKind::RenameColumn { .. }));
    assert_eq!(report.plan.len(), 2);
    assert_eq!(target.columns("patients"), vec!["full_name", "ward"]);
    assert_eq!(target.rows("patients")[0]["full_name"], json!("Grace Hopper"));
}

#[tokio::test]
async fn test_probe_on_empty_table_leaves_no_residue() {
    let target = MemoryDataStore::new(TARGET_ID)
        .with_table(
            "admissions",
            &[
                ("id", ColumnType::Integer),
                ("patient_name", ColumnType::Text),
                ("admitted_at", ColumnType::Timestamp),
            ],
            vec![],
        )
        .with_not_null("admissions", "patient_name");

    let shape = introspect(
        &target,
        "admissions",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(shape.origin, ShapeOrigin::Probed);
    assert_eq!(
        shape.column_names().collect::<Vec<_>>(),
        vec!["id", "patient_name", "admitted_at"]
    );
    assert!(!shape.column("patient_name").unwrap().nullable);
    assert_eq!(
        shape.column("admitted_at").unwrap().inferred_type,
        ColumnType::Timestamp
    );
    assert!(shape.notes.is_empty(), "{:?}", shape.notes);
    assert!(target.rows("admissions").is_empty());

    let deletes: Vec<_> = target
        .journal()
        .into_iter()
        .filter(|op| matches!(op, StoreOp::Delete { .. }))
        .collect();
    assert_eq!(
        deletes,
        vec![StoreOp::Delete {
            table: "admissions".to_string(),
            deleted: 1
        }]
    );
}

#[tokio::test]
async fn test_rejected_sample_read_is_returned() {
    let target = MemoryDataStore::new(TARGET_ID).with_table(
        "beds",
        &[("id", ColumnType::Integer), ("status", ColumnType::Text)],
        vec![],
    );
    target.fail_table("beds");

    // Sampling itself fails on a rejected table; the error is returned
    let err = introspect(
        &target,
        "beds",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
}

#[tokio::test]
async fn test_probe_disabled_reports_empty_shape() {
    let target = MemoryDataStore::new(TARGET_ID).with_table(
        "beds",
        &[("id", ColumnType::Integer)],
        vec![],
    );
    let shape = introspect(
        &target,
        "beds",
        &TypeHints::default(),
        IntrospectOptions {
            allow_probe: false,
            reference: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(shape.origin, ShapeOrigin::Empty);
    assert!(shape.columns.is_empty());
    assert!(target.mutations().is_empty());
}

#[tokio::test]
async fn test_run_log_records_each_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");
    let log = RunLog::new(Some(path.clone()));

    let reference_shape = introspect(
        &reference_store(),
        "patients",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();
    let target = target_store();
    let target_shape = introspect(
        &target,
        "patients",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();
    let steps = plan(&[diff(&reference_shape, &target_shape)], "public");
    execute(&target, steps, &CancelFlag::new(), &log, TARGET_ID).await;

    let contents = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|e| e["event"] == "migration_step" && e["tenant"] == TARGET_ID));
    assert_eq!(entries[0]["payload"]["column"]["name"], "age");
}

#[tokio::test]
async fn test_rejected_probe_insert_still_attempts_cleanup() {
    let target = MemoryDataStore::new(TARGET_ID).with_table(
        "patients",
        &[("id", ColumnType::Integer), ("full_name", ColumnType::Text)],
        vec![],
    );
    target.fail_inserts("patients");
    let reference = TableShape::new(
        "patients",
        vec![ColumnShape::new("full_name", ColumnType::Text)],
    );

    let shape = introspect(
        &target,
        "patients",
        &TypeHints::default(),
        IntrospectOptions {
            allow_probe: true,
            reference: Some(&reference),
        },
    )
    .await
    .unwrap();

    assert_eq!(shape.origin, ShapeOrigin::Empty);
    assert!(
        shape.notes.iter().any(|n| n.starts_with("probe insert failed")),
        "{:?}",
        shape.notes
    );
    // The marker-seeded record is looked for even though the insert failed
    assert_eq!(
        target.mutations(),
        vec![
            StoreOp::Insert {
                table: "patients".to_string()
            },
            StoreOp::Delete {
                table: "patients".to_string(),
                deleted: 0
            },
        ]
    );
}

#[tokio::test]
async fn test_failed_probe_cleanup_is_a_note() {
    let target = MemoryDataStore::new(TARGET_ID).with_table(
        "beds",
        &[("id", ColumnType::Integer), ("status", ColumnType::Text)],
        vec![],
    );
    target.fail_deletes("beds");

    let shape = introspect(
        &target,
        "beds",
        &TypeHints::default(),
        IntrospectOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(shape.origin, ShapeOrigin::Probed);
    assert_eq!(shape.column_names().collect::<Vec<_>>(), vec!["id", "status"]);
    assert!(
        shape.notes.iter().any(|n| n.starts_with("probe cleanup failed")),
        "{:?}",
        shape.notes
    );
    assert!(target
        .journal()
        .contains(&StoreOp::Delete {
            table: "beds".to_string(),
            deleted: 0
        }));
    // The leftover row is reported, not hidden
    assert_eq!(target.rows("beds").len(), 1);
}

#[tokio::test]
async fn test_empty_reference_table_is_not_parity() {
    let reference = reference_store().with_table("beds", &[("id", ColumnType::Integer)], vec![]);
    let target = target_store().with_table(
        "beds",
        &[("id", ColumnType::Integer)],
        vec![json!({"id": 7})],
    );
    let reference_binding = binding(REFERENCE_ID);
    let target_binding = binding(TARGET_ID);
    let mut no_probe = options(&["beds"], false);
    no_probe.allow_probe = false;

    let report = reconcile(
        Tenant {
            binding: &reference_binding,
            store: &reference,
        },
        Tenant {
            binding: &target_binding,
            store: &target,
        },
        &no_probe,
        &CancelFlag::new(),
        &RunLog::disabled(),
    )
    .await;

    assert!(!report.is_success());
    assert!(report.plan.is_empty());
    let beds = &report.tables[0];
    assert_eq!(beds.error.as_ref().map(|e| e.kind), Some(ErrorKind::Rejected));
    assert_eq!(
        beds.reference.as_ref().map(|s| s.origin),
        Some(ShapeOrigin::Empty)
    );
    assert!(beds.target.is_none());
    assert!(target.mutations().is_empty());
}
