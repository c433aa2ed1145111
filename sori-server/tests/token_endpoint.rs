//! End-to-end tests for the token endpoint against a mocked provider.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header as mock_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sori_server::{ApiSecret, AppState, ServerConfig, create_app};

fn config(provider_base: &str, rpm: u32) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        provider_base: provider_base.to_string(),
        provider_api_key: SecretString::from("sk-long-lived"),
        default_model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
        default_voice: "shimmer".to_string(),
        api_secrets: vec![ApiSecret {
            id: "mobile".to_string(),
            secret: SecretString::from("app-secret"),
        }],
        token_requests_per_minute: rpm,
    }
}

async fn provider_mock() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/realtime/sessions"))
        .and(mock_header("authorization", "Bearer sk-long-lived"))
        .and(body_partial_json(json!({ "model": "gpt-4o-realtime-preview-2024-12-17" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "client_secret": { "value": "ek_minted" }
        })))
        .mount(&server)
        .await;
    server
}

fn token_request(auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/openai/realtime/token")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            json!({
                "scenarioId": "cafe-ordering",
                "isScenarioBased": true,
                "isLessonBased": false,
                "level": "beginner",
                "user": { "id": "u1" }
            })
            .to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn mints_credential_for_authenticated_request() {
    let provider = provider_mock().await;
    let app = create_app(Arc::new(AppState::new(config(&provider.uri(), 30))));

    let response = app.oneshot(token_request(Some("app-secret"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["ephemeralKey"], "ek_minted");
}

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let provider = provider_mock().await;
    let app = create_app(Arc::new(AppState::new(config(&provider.uri(), 30))));

    let response = app.oneshot(token_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_bearer_is_unauthorized() {
    let provider = provider_mock().await;
    let app = create_app(Arc::new(AppState::new(config(&provider.uri(), 30))));

    let response = app.oneshot(token_request(Some("not-the-secret"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn per_user_rate_limit_returns_retry_after() {
    let provider = provider_mock().await;
    let state = Arc::new(AppState::new(config(&provider.uri(), 2)));

    for _ in 0..2 {
        let response = create_app(Arc::clone(&state))
            .oneshot(token_request(Some("app-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = create_app(Arc::clone(&state))
        .oneshot(token_request(Some("app-secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["retryAfter"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn unknown_level_is_a_bad_request() {
    let provider = provider_mock().await;
    let app = create_app(Arc::new(AppState::new(config(&provider.uri(), 30))));

    let request = Request::builder()
        .method("POST")
        .uri("/openai/realtime/token")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer app-secret")
        .body(Body::from(json!({ "level": "fluent" }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn provider_failure_maps_to_bad_gateway_without_leaking() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/realtime/sessions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("provider detail"))
        .mount(&provider)
        .await;
    let app = create_app(Arc::new(AppState::new(config(&provider.uri(), 30))));

    let response = app.oneshot(token_request(Some("app-secret"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_json(response).await;
    let error = body["error"].as_str().unwrap();
    assert!(!error.contains("provider detail"), "provider internals must not leak");
    assert!(!error.contains("sk-long-lived"), "the long-lived key must never appear");
}

#[tokio::test]
async fn health_endpoint_is_open() {
    let provider = provider_mock().await;
    let app = create_app(Arc::new(AppState::new(config(&provider.uri(), 30))));

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
