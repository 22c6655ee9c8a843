mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{provider_callback, rc, Harness, ScriptedAdapter, SIGNATURE_HEADER};
use ppob_gateway::api::{self, ApiState, CLIENT_ID_HEADER};
use ppob_gateway::health::HealthChecker;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    api::router(ApiState {
        engine: h.engine.clone(),
        catalog: h.stores.catalog.clone(),
        provider_callbacks: h.provider_callbacks.clone(),
        health: HealthChecker::new(h.router.clone()),
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, client_id: Option<i64>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-request-id", "req-test-1");
    if let Some(id) = client_id {
        builder = builder.header(CLIENT_ID_HEADER, id.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn create_then_replay_returns_created_then_ok() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("00")]);
    let h = Harness::new(vec![alpha]).await;
    let product = h.prepaid_product("XL10").await;
    h.provider_sku(&product, "alpha", 10_000, false).await;

    let body = json!({
        "reference_id": "API-1",
        "product_code": "XL10",
        "customer_no": "081234567890"
    });

    let (status, first) = send(
        app(&h),
        post_json("/api/v1/transactions", Some(h.client.id), body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "success");
    assert_eq!(first["price"], 10_500);
    assert_eq!(first["type"], "prepaid");

    let (status, second) = send(
        app(&h),
        post_json("/api/v1/transactions", Some(h.client.id), body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["transaction_id"], first["transaction_id"]);

    let uri = format!(
        "/api/v1/transactions/{}",
        first["transaction_id"].as_str().unwrap()
    );
    let request = Request::builder()
        .uri(&uri)
        .header(CLIENT_ID_HEADER, h.client.id.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, fetched) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["reference_id"], "API-1");
    h.settle().await;
}

#[tokio::test]
async fn requests_without_a_known_client_are_unauthorized() {
    let h = Harness::new(vec![]).await;
    let body = json!({
        "reference_id": "API-2",
        "product_code": "XL10",
        "customer_no": "081234567890"
    });

    let (status, error) = send(app(&h), post_json("/api/v1/transactions", None, body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["request_id"], "req-test-1");

    let (status, _) = send(app(&h), post_json("/api/v1/transactions", Some(9_999), body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_product_and_bad_input_are_reported() {
    let h = Harness::new(vec![]).await;

    let (status, error) = send(
        app(&h),
        post_json(
            "/api/v1/transactions",
            Some(h.client.id),
            json!({
                "reference_id": "API-3",
                "product_code": "NOPE",
                "customer_no": "081234567890"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"], "PRODUCT_NOT_FOUND");

    let (status, error) = send(
        app(&h),
        post_json(
            "/api/v1/transactions",
            Some(h.client.id),
            json!({
                "reference_id": "API-4",
                "product_code": "NOPE",
                "customer_no": "08-1234"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn failed_inquiry_is_unprocessable() {
    let alpha = ScriptedAdapter::new("alpha", vec![rc("42")]);
    let h = Harness::new(vec![alpha]).await;
    let product = h.postpaid_product("BPJS").await;
    h.provider_sku(&product, "alpha", 0, false).await;

    let (status, body) = send(
        app(&h),
        post_json(
            "/api/v1/inquiries",
            Some(h.client.id),
            json!({
                "reference_id": "INQ-API-1",
                "product_code": "BPJS",
                "customer_no": "8888800000001"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["rc"], "42");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn provider_webhooks_are_verified() {
    let alpha = ScriptedAdapter::new("alpha", vec![]);
    let h = Harness::new(vec![alpha]).await;
    let (body, signature) = provider_callback("TRX-20260101-000001", "00", Some("SN1"));

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/unknown")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/alpha")
        .header(SIGNATURE_HEADER, "not-the-signature")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, error) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"], "INVALID_SIGNATURE");

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/ALPHA")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap();
    let (status, ack) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "ok");
    assert_eq!(h.store.provider_callbacks().await.len(), 1);
}

#[tokio::test]
async fn price_list_is_served_from_the_provider() {
    let alpha = ScriptedAdapter::new("alpha", vec![]);
    let h = Harness::new(vec![alpha]).await;

    let request = Request::builder()
        .uri("/api/v1/providers/alpha/price-list?category=pulsa")
        .header(CLIENT_ID_HEADER, h.client.id.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, items) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(items[0]["sku_code"], "alpha-XL10");
    assert_eq!(items[0]["category"], "pulsa");

    let request = Request::builder()
        .uri("/api/v1/providers/ghost/price-list")
        .header(CLIENT_ID_HEADER, h.client.id.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_providers_and_in_memory_stores() {
    let alpha = ScriptedAdapter::new("alpha", vec![]);
    let h = Harness::new(vec![alpha]).await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, health) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["providers"][0]["provider"], "alpha");
    assert_eq!(health["providers"][0]["status"], "healthy");

    let request = Request::builder()
        .uri("/health/live")
        .body(Body::empty())
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_is_unavailable_without_providers() {
    let h = Harness::new(vec![]).await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, health) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "Unhealthy");
}
