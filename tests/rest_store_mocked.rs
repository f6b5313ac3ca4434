/// REST backend tests against a mocked PostgREST gateway
/// Exercises the wire format without reaching a hosted tenant
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tenant_reconciler::binding::{verify_binding, CredentialRef, TenantBinding};
use tenant_reconciler::core::errors::ErrorKind;
use tenant_reconciler::data::rest_store::RestDataStore;
use tenant_reconciler::store::{DataStore, Filter};

/// Helper function to create a binding pointing at the mock server
fn mock_binding(server: &MockServer, tenant_id: &str) -> TenantBinding {
    TenantBinding {
        tenant_id: tenant_id.to_string(),
        endpoint_url: Url::parse(&server.uri()).unwrap(),
        credential_ref: CredentialRef::new("SUPABASE_KEY", "test-service-key"),
        label: None,
    }
}

fn store(server: &MockServer) -> RestDataStore {
    RestDataStore::new(
        &mock_binding(server, "oghqwddhojnryovmfvzc"),
        "public",
        "exec_sql",
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_select_sends_filter_and_credentials() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .and(query_param("select", "*"))
        .and(query_param("or", "(name.ilike.*test*)"))
        .and(query_param("limit", "5"))
        .and(header("apikey", "test-service-key"))
        .and(header("Authorization", "Bearer test-service-key"))
        .and(header("Accept-Profile", "public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "Test User", "fee": 10.5}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let filter = Filter::Any(vec![Filter::contains("name", "test")]);
    let rows = store(&mock_server)
        .select("patients", Some(&filter), Some(5))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Test User"));
    // Column order follows the response
    assert_eq!(
        rows[0].keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["id", "name", "fee"]
    );
}

#[tokio::test]
async fn test_unauthorized_is_connectivity() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "Invalid API key"})),
        )
        .mount(&mock_server)
        .await;

    let err = store(&mock_server)
        .select("patients", None, Some(1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.to_string().contains("Invalid API key"));
}

#[tokio::test]
async fn test_bad_request_is_rejection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/admissions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "23502",
            "message": "null value in column \"patient_id\" of relation \"admissions\" violates not-null constraint"
        })))
        .mount(&mock_server)
        .await;

    let err = store(&mock_server)
        .insert("admissions", &serde_json::Map::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert_eq!(
        tenant_reconciler::introspect::not_null_violation(&err).as_deref(),
        Some("patient_id")
    );
}

#[tokio::test]
async fn test_insert_and_delete_return_representation() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/beds"))
        .and(header("Prefer", "return=representation"))
        .and(body_json(json!({"status": "available"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            {"id": 42, "status": "available", "ward_id": null}
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/beds"))
        .and(query_param("id", "in.(\"42\")"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 42, "status": "available", "ward_id": null}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store(&mock_server);
    let mut record = serde_json::Map::new();
    record.insert("status".to_string(), json!("available"));

    let row = store.insert("beds", &record).await.unwrap();
    assert_eq!(row["id"], json!(42));
    assert!(row.contains_key("ward_id"));

    let deleted = store
        .delete("beds", &Filter::is_in("id", vec![json!(42)]))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn test_exec_posts_statement_to_rpc() {
    let mock_server = MockServer::start().await;
    let statement =
        "ALTER TABLE \"public\".\"patients\" ADD COLUMN IF NOT EXISTS \"fee\" numeric;";

    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/exec_sql"))
        .and(header("Content-Profile", "public"))
        .and(body_json(json!({"sql": statement})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    store(&mock_server).exec(statement).await.unwrap();
}

#[tokio::test]
async fn test_exec_failure_is_rejection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/exec_sql"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Could not find the function public.exec_sql(sql) in the schema cache"
        })))
        .mount(&mock_server)
        .await;

    let err = store(&mock_server).exec("SELECT 1;").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert!(err.to_string().contains("exec_sql"));
}

#[tokio::test]
async fn test_identify_reads_project_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .and(query_param("limit", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("sb-project-ref", "btoeupnfqkioxigrheyp")
                .set_body_json(json!([])),
        )
        .mount(&mock_server)
        .await;

    let store = store(&mock_server);
    assert_eq!(
        store.identify("patients").await.unwrap(),
        "btoeupnfqkioxigrheyp"
    );

    // The binding was for the reference tenant: a live mismatch
    let known = BTreeMap::from([(
        "btoeupnfqkioxigrheyp".to_string(),
        "Riverside Clinic".to_string(),
    )]);
    let check = verify_binding(
        &mock_binding(&mock_server, "oghqwddhojnryovmfvzc"),
        &store,
        "patients",
        &known,
    )
    .await;
    assert!(check.connected);
    assert!(check.is_misconfigured());
    assert_eq!(check.observed_label.as_deref(), Some("Riverside Clinic"));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connectivity() {
    // Nothing listens on port 1
    let binding = TenantBinding {
        tenant_id: "oghqwddhojnryovmfvzc".to_string(),
        endpoint_url: Url::parse("http://127.0.0.1:1").unwrap(),
        credential_ref: CredentialRef::new("SUPABASE_KEY", "test-service-key"),
        label: None,
    };

    let store = RestDataStore::new(&binding, "public", "exec_sql", Duration::from_secs(2)).unwrap();
    let check = verify_binding(&binding, &store, "patients", &BTreeMap::new()).await;

    assert!(!check.connected);
    assert_eq!(check.error.map(|e| e.kind), Some(ErrorKind::Connectivity));
}

#[tokio::test]
async fn test_select_reads_every_page() {
    let mock_server = MockServer::start().await;
    let first_page: Vec<_> = (0..1000)
        .map(|i| json!({"id": i, "name": format!("Test {}", i)}))
        .collect();

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .and(query_param("or", "(name.ilike.*test*)"))
        .and(query_param("limit", "1000"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(first_page)))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .and(query_param("or", "(name.ilike.*test*)"))
        .and(query_param("limit", "1000"))
        .and(query_param("offset", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1000, "name": "Test 1000"},
            {"id": 1001, "name": "Test 1001"}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let filter = Filter::Any(vec![Filter::contains("name", "test")]);
    let rows = store(&mock_server)
        .select("patients", Some(&filter), None)
        .await
        .unwrap();

    assert_eq!(rows.len(), 1002);
    assert_eq!(rows[1001]["id"], json!(1001));
}
