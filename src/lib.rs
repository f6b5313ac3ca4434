//! Tenant Schema Reconciler Library
//!
//! This library keeps the hospital tenants of the administration app in
//! structural parity and their data free of test records. It resolves which
//! tenant a deployment is bound to, introspects table shapes from sample
//! rows, diffs a reference tenant against a target, applies only additive and
//! idempotent column changes, and sweeps test data children-first.
//!
//! # Modules
//!
//! - `core`: Reconciliation logic (diffing, planning, sweeping).
//! - `data`: Data store backends.
//! - `binding`: Tenant binding resolution and live verification.
//! - `cancel`: Cooperative cancellation between steps.
//! - `config`: Configuration management.
//! - `diff`: Additive schema diffing.
//! - `errors`: Error handling types.
//! - `integrity`: Referential sanity checks.
//! - `introspect`: Table shape inference from sampled rows.
//! - `memory_store`: In-memory data store.
//! - `migration`: Migration planning and execution.
//! - `models`: Shapes, diffs, steps and reports.
//! - `pg_store`: Direct Postgres data store.
//! - `reconcile`: End-to-end orchestration.
//! - `rest_store`: Hosted REST data store.
//! - `run_log`: JSON-lines audit log.
//! - `store`: The data-access boundary.
//! - `sweep`: Data hygiene sweeps.
//! - `type_hints`: Name-pattern type inference.

pub mod core;
pub mod data;

pub mod binding;
pub mod cancel;
pub mod config;
pub mod diff;
pub mod errors;
pub mod integrity;
pub mod introspect;
pub mod memory_store;
pub mod migration;
pub mod models;
pub mod pg_store;
pub mod reconcile;
pub mod rest_store;
pub mod run_log;
pub mod store;
pub mod sweep;
pub mod type_hints;
