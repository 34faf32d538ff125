use std::sync::Arc;

use axum::{Router, body::Body};
use http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use kiln::App;
use kiln::configuration::{PoolSettings, VmmSettings};
use kiln::pool::WarmPool;
use kiln::registry::FunctionRegistry;
use kiln::store::{FileStore, Store};
use kiln::vmm::VmManager;

/// Builds the full router against the file backend. The VM manager is
/// wired with nonexistent paths; function CRUD never reaches it.
async fn test_app() -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::file_tree(FileStore::new(dir.path()).await.unwrap());
    let registry = Arc::new(FunctionRegistry::new(store, 1024 * 1024));

    let manager = Arc::new(VmManager::new(VmmSettings {
        data_dir: dir.path().join("vmm"),
        hypervisor_binary: "/nonexistent/firecracker".into(),
        kernel_image: "/nonexistent/vmlinux".into(),
        base_rootfs: "/nonexistent/rootfs.ext4".into(),
        boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
        max_invoke_secs: 900,
        guest_boot_timeout_secs: 10,
    }));
    let pool = Arc::new(WarmPool::new(
        manager.clone(),
        &PoolSettings {
            size: 2,
            refill_interval_secs: 10,
            runtimes: None,
        },
    ));

    let app = App::new(registry, manager, pool);
    (dir, kiln::handlers::app(app))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_request(name: &str) -> Request<Body> {
    post_json(
        "/api/v1/functions",
        json!({
            "name": name,
            "runtime": "nodejs20",
            "handler": "index.handler",
            "code": "exports.handler = async e => ({ ok: true, e });"
        }),
    )
}

#[tokio::test]
async fn health_reports_the_service() {
    let (_dir, app) = test_app().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "kiln");
}

#[tokio::test]
async fn create_applies_defaults_and_returns_201() {
    let (_dir, app) = test_app().await;
    let response = app.clone().oneshot(create_request("hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["name"], "hello");
    assert_eq!(body["memory_mb"], 128);
    assert_eq!(body["timeout_sec"], 30);
    assert_eq!(body["code_path"], "file://functions/hello/code.bin");

    let response = app
        .oneshot(get("/api/v1/functions/hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["runtime"], "nodejs20");
}

#[tokio::test]
async fn duplicate_create_conflicts() {
    let (_dir, app) = test_app().await;
    app.clone().oneshot(create_request("hello")).await.unwrap();

    let response = app.oneshot(create_request("hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = body_json(response).await;
    assert_eq!(body["kind"], "AlreadyExists");
}

#[tokio::test]
async fn invalid_requests_are_400_with_kind() {
    let (_dir, app) = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/functions",
            json!({"name": "Not A Name", "runtime": "nodejs20", "handler": "h", "code": "c"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "Invalid");

    let response = app
        .oneshot(post_json(
            "/api/v1/functions",
            json!({"name": "hello", "runtime": "cobol85", "handler": "h", "code": "c"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "Invalid");
}

#[tokio::test]
async fn unparsable_body_is_400() {
    let (_dir, app) = test_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/functions")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "Invalid");

    // Missing required fields parse-fail the same way
    let response = app
        .oneshot(post_json("/api/v1/functions", json!({"name": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_function_is_404() {
    let (_dir, app) = test_app().await;
    let response = app.oneshot(get("/api/v1/functions/ghost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["kind"], "NotFound");
}

#[tokio::test]
async fn list_returns_items_and_count() {
    let (_dir, app) = test_app().await;
    app.clone().oneshot(create_request("one")).await.unwrap();
    app.clone().oneshot(create_request("two")).await.unwrap();

    let response = app.oneshot(get("/api/v1/functions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn update_patches_only_present_fields() {
    let (_dir, app) = test_app().await;
    app.clone().oneshot(create_request("hello")).await.unwrap();

    let request = Request::builder()
        .method("PUT")
        .uri("/api/v1/functions/hello")
        .header("content-type", "application/json")
        .body(Body::from(json!({"memory_mb": 512}).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["memory_mb"], 512);
    assert_eq!(body["timeout_sec"], 30);
    assert_eq!(body["handler"], "index.handler");
}

#[tokio::test]
async fn delete_then_get_is_404() {
    let (_dir, app) = test_app().await;
    app.clone().oneshot(create_request("hello")).await.unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/v1/functions/hello")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["deleted"], "hello");

    let response = app.oneshot(get("/api/v1/functions/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn vm_list_is_empty_without_activity() {
    let (_dir, app) = test_app().await;
    let response = app.oneshot(get("/api/v1/vms")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}
