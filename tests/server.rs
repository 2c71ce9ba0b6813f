mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{tone, PreserveVocalsFixture, Stack, StubDownloader};
use vocal_remover_core::{
    server::{make_app, ServerConfig, ServiceHandle},
    ModePolicy,
};

const URL: &str = "https://example.com/watch?v=abc";

fn ready_app(temp_root: &std::path::Path) -> (Router, Stack) {
    let stack = Stack::new(PreserveVocalsFixture::new().adapter(), ModePolicy::default());
    let downloader = Arc::new(StubDownloader::new(tone(128, 44_100, 0.05)));
    let service = Arc::new(stack.service(downloader, temp_root));
    let app = make_app(ServerConfig::default(), ServiceHandle::ready(service));
    (app, stack)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_starting_before_service_is_ready() {
    let app = make_app(ServerConfig::default(), ServiceHandle::default());

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "starting");
    assert_eq!(body["models_loaded"], 0);
    assert!(body.get("accelerator_available").is_none());
}

#[tokio::test]
async fn processing_routes_answer_503_until_ready() {
    let app = make_app(ServerConfig::default(), ServiceHandle::default());

    for request in [
        post_json("/extract", json!({ "url": URL })),
        post_json("/extract/simple", json!({ "url": URL })),
        post_json("/fingerprint", json!({ "url": URL })),
        get("/models"),
        get("/stats"),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["error"], "service_unavailable");
    }
}

#[tokio::test]
async fn extract_returns_wav_attachment() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, stack) = ready_app(temp_root.path());

    let response = app
        .oneshot(post_json("/extract", json!({ "url": URL, "method": "simple" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "audio/wav");
    let task_id = headers["x-task-id"].to_str().unwrap().to_string();
    assert_eq!(
        headers[header::CONTENT_DISPOSITION].to_str().unwrap(),
        format!("attachment; filename=simple_{task_id}.wav")
    );
    assert_eq!(
        headers["x-models-used"].to_str().unwrap(),
        common::topology().simple
    );
    assert!(headers["x-processing-time"]
        .to_str()
        .unwrap()
        .parse::<f64>()
        .is_ok());

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(
        headers[header::CONTENT_LENGTH].to_str().unwrap(),
        bytes.len().to_string()
    );
    assert_eq!(&bytes[..4], b"RIFF");
    assert_eq!(stack.adapter.separations().len(), 1);
}

#[tokio::test]
async fn extract_defaults_to_preserve_vocals() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, stack) = ready_app(temp_root.path());

    let response = app
        .oneshot(post_json("/extract", json!({ "url": URL })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("preserve_vocals_"));
    assert_eq!(stack.adapter.separations().len(), 3);
}

#[tokio::test]
async fn method_path_is_validated() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, _stack) = ready_app(temp_root.path());

    let ok = app
        .clone()
        .oneshot(post_json("/extract/instrumental_only", json!({ "url": URL })))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    assert!(ok.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("instrumental_only_"));

    let bad = app
        .oneshot(post_json("/extract/karaoke", json!({ "url": URL })))
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(bad).await["error"], "invalid_request");
}

#[tokio::test]
async fn malformed_body_gets_the_json_error_shape() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, stack) = ready_app(temp_root.path());

    for request in [
        post_json("/extract", json!({ "url": URL, "method": "karaoke" })),
        post_json("/extract/simple", json!({ "link": URL })),
        post_json("/fingerprint", json!({ "url": URL, "channels": "two" })),
        Request::builder()
            .method("POST")
            .uri("/extract")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
        Request::builder()
            .method("POST")
            .uri("/extract")
            .body(Body::from(json!({ "url": URL }).to_string()))
            .unwrap(),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = json_body(response).await;
        assert_eq!(body["error"], "invalid_request");
        assert!(!body["message"].as_str().unwrap().is_empty());
    }
    assert_eq!(stack.adapter.total_calls(), 0);
}

#[tokio::test]
async fn bad_url_is_a_client_error() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, stack) = ready_app(temp_root.path());

    let response = app
        .oneshot(post_json("/extract", json!({ "url": "ftp://example.com/a" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(stack.adapter.total_calls(), 0);
}

#[tokio::test]
async fn processing_failure_maps_to_500_with_kind() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, stack) = ready_app(temp_root.path());
    stack.adapter.fail_separate(
        &common::topology().simple,
        vocal_remover_core::FailureKind::CorruptCheckpoint,
    );

    let response = app
        .oneshot(post_json("/extract/simple", json!({ "url": URL })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"], "model_load_error");
    assert!(body["message"].as_str().unwrap().contains("corrupt checkpoint"));
}

#[tokio::test]
async fn fingerprint_returns_extracted_file() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, stack) = ready_app(temp_root.path());

    let response = app
        .oneshot(post_json(
            "/fingerprint",
            json!({ "url": URL, "channels": 1 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("extracted_"));
    assert_eq!(response.headers()["x-models-used"], "");
    assert_eq!(stack.adapter.total_calls(), 0);
}

#[tokio::test]
async fn models_and_stats_are_listed() {
    let temp_root = tempfile::tempdir().unwrap();
    let (app, _stack) = ready_app(temp_root.path());

    let models = json_body(app.clone().oneshot(get("/models")).await.unwrap()).await;
    let models = models.as_array().unwrap();
    assert_eq!(models.len(), 6);
    assert!(models.iter().all(|m| m["is_loaded"] == false));
    assert!(models
        .iter()
        .any(|m| m["id"] == "UVR_MDXNET_KARA_2.onnx" && m["architecture"] == "mdx_net"));

    let stats = json_body(app.clone().oneshot(get("/stats")).await.unwrap()).await;
    assert_eq!(stats["total_requests"], 0);
    assert_eq!(stats["cache"]["mode"], "unbounded");

    let health = json_body(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["accelerator_available"], false);
}
