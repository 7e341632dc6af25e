//! Table id lookups against a stub status endpoint.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sql2kv_core::{CatalogError, HttpTableIdResolver, TableIdResolver};

async fn table_info(Path((schema, table)): Path<(String, String)>) -> impl IntoResponse {
    match (schema.as_str(), table.as_str()) {
        ("shop", "orders") => (
            StatusCode::OK,
            Json(json!({ "id": 45, "name": { "O": "orders", "L": "orders" } })),
        )
            .into_response(),
        ("shop", "odd/name?#") => (StatusCode::OK, Json(json!({ "id": 46 }))).into_response(),
        ("shop", "broken") => (StatusCode::OK, "not json").into_response(),
        _ => (StatusCode::NOT_FOUND, "[schema:1146]Table which ID = 0 does not exist.").into_response(),
    }
}

async fn start_status_server() -> String {
    let app = Router::new().route("/schema/{schema}/{table}", get(table_info));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr.to_string()
}

#[tokio::test]
async fn test_resolves_table_id() {
    let resolver = HttpTableIdResolver::new(&start_status_server().await);
    assert_eq!(resolver.resolve_table_id("shop", "orders").await.unwrap(), 45);
}

#[tokio::test]
async fn test_names_are_sent_as_single_path_segments() {
    let resolver = HttpTableIdResolver::new(&start_status_server().await);
    assert_eq!(resolver.resolve_table_id("shop", "odd/name?#").await.unwrap(), 46);
}

#[tokio::test]
async fn test_malformed_endpoint_is_rejected() {
    let resolver = HttpTableIdResolver::new("bad host:10080");
    assert!(matches!(
        resolver.resolve_table_id("shop", "orders").await,
        Err(CatalogError::InvalidAddress(_))
    ));
}

#[tokio::test]
async fn test_error_status_carries_body() {
    let resolver = HttpTableIdResolver::new(&start_status_server().await);
    match resolver.resolve_table_id("shop", "missing").await {
        Err(CatalogError::Status { status, body }) => {
            assert_eq!(status, 404);
            assert!(body.contains("does not exist"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_undecodable_body() {
    let resolver = HttpTableIdResolver::new(&start_status_server().await);
    assert!(matches!(
        resolver.resolve_table_id("shop", "broken").await,
        Err(CatalogError::Decode(_))
    ));
}

#[tokio::test]
async fn test_unreachable_endpoint() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let resolver = HttpTableIdResolver::new(&addr);
    assert!(matches!(
        resolver.resolve_table_id("shop", "orders").await,
        Err(CatalogError::Http(_))
    ));
}
