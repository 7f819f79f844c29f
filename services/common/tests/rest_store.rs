//! REST store tests against a mock PostgREST endpoint

use common::config::{KeyKind, StoreConfig};
use common::store::{fetch_all, Filter, RestStore, Select, Store};
use common::StoreError;
use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{body_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn store_for(server: &MockServer) -> RestStore {
    let config = StoreConfig {
        url: server.uri(),
        key: "test-key".to_string(),
        key_kind: KeyKind::ServiceRole,
        timeout: Duration::from_secs(5),
    };
    RestStore::new(&config).unwrap()
}

#[tokio::test]
async fn test_upsert_sends_conflict_key_and_auth_headers() {
    let server = MockServer::start().await;
    let rows = vec![
        json!({"id_componente": 1, "id_resultado": 5000001}),
        json!({"id_componente": 2, "id_resultado": 5000002}),
    ];

    Mock::given(method("POST"))
        .and(path("/rest/v1/componente_resultado"))
        .and(query_param("on_conflict", "id_componente,id_resultado"))
        .and(header("apikey", "test-key"))
        .and(header("Authorization", "Bearer test-key"))
        .and(header("Prefer", "resolution=merge-duplicates,return=minimal"))
        .and(body_json(json!(rows)))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let written = store_for(&server)
        .upsert("componente_resultado", &rows, &["id_componente", "id_resultado"])
        .await
        .unwrap();
    assert_eq!(written, 2);
}

#[tokio::test]
async fn test_upsert_sends_one_request_per_column_set() {
    let server = MockServer::start().await;
    let flagged = vec![json!({"id": 1, "procesado": true})];
    let plain = vec![json!({"id": 2}), json!({"id": 3})];

    Mock::given(method("POST"))
        .and(path("/rest/v1/datos_brutos"))
        .and(body_json(json!(flagged)))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/datos_brutos"))
        .and(body_json(json!(plain)))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let rows: Vec<_> = flagged.iter().chain(plain.iter()).cloned().collect();
    let written = store_for(&server)
        .upsert("datos_brutos", &rows, &["id"])
        .await
        .unwrap();
    assert_eq!(written, 3);
}

#[tokio::test]
async fn test_upsert_error_carries_status_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/datos_brutos"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"message":"value too long"}"#),
        )
        .mount(&server)
        .await;

    let err = store_for(&server)
        .upsert("datos_brutos", &[json!({"id": 1})], &["id"])
        .await
        .unwrap_err();

    match err {
        StoreError::Status { status, body, table, .. } => {
            assert_eq!(status, 400);
            assert_eq!(table, "datos_brutos");
            assert!(body.contains("value too long"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_select_builds_postgrest_query() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/resultado_indicadores"))
        .and(query_param("select", "id,nombre_indicador"))
        .and(query_param("nombre_indicador", "is.null"))
        .and(query_param("order", "id.asc"))
        .and(query_param("limit", "2"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "nombre_indicador": null},
            {"id": 2, "nombre_indicador": null}
        ])))
        .mount(&server)
        .await;

    let rows = store_for(&server)
        .select(
            "resultado_indicadores",
            &Select::columns("id,nombre_indicador")
                .filter(Filter::new().is_null("nombre_indicador"))
                .order("id")
                .page(2, 0),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_fetch_all_follows_offsets() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/definicion_indicadores"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/definicion_indicadores"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 3}])))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let rows = fetch_all(&store, "definicion_indicadores", Select::default(), "id", 2, 100)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_patch_counts_returned_rows() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/resultado_indicadores"))
        .and(query_param("id", "eq.42"))
        .and(body_json(json!({"nombre_indicador": "Conectividad"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": 42, "nombre_indicador": "Conectividad"}])),
        )
        .mount(&server)
        .await;

    let updated = store_for(&server)
        .patch(
            "resultado_indicadores",
            &Filter::new().eq("id", 42),
            &json!({"nombre_indicador": "Conectividad"}),
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);
}

#[tokio::test]
async fn test_count_reads_content_range() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/rest/v1/datos_brutos"))
        .and(header("Prefer", "count=exact"))
        .respond_with(ResponseTemplate::new(206).insert_header("Content-Range", "0-0/3573"))
        .mount(&server)
        .await;

    let total = store_for(&server).count("datos_brutos").await.unwrap();
    assert_eq!(total, 3573);
}

#[tokio::test]
async fn test_delete_requires_filter() {
    let server = MockServer::start().await;
    let result = store_for(&server)
        .delete("componente_resultado", &Filter::new())
        .await;
    assert!(matches!(result, Err(StoreError::Rejected(_))));
}
