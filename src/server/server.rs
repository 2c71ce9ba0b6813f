use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderName, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{log_requests, ServerConfig, ServerState, ServiceHandle};
use crate::{
    config::AppConfig,
    error::StemError,
    service::{ExtractOptions, ProcessingService},
    types::{ProcessedAudio, ProcessingMethod},
};

#[derive(Deserialize, Debug)]
struct ExtractBody {
    url: String,
    #[serde(default)]
    method: Option<ProcessingMethod>,
}

#[derive(Deserialize, Debug)]
struct UrlBody {
    url: String,
}

#[derive(Deserialize, Debug)]
struct FingerprintBody {
    url: String,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    channels: Option<u16>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
    ready: bool,
    uptime_secs: u64,
    methods: Vec<&'static str>,
}

/// Accelerator fields are left out until the service has probed the device.
#[derive(Serialize)]
struct StartingHealth {
    status: &'static str,
    models_loaded: usize,
}

/// Maps crate errors onto HTTP responses carrying the error kind.
pub struct ApiError(pub StemError);

impl From<StemError> for ApiError {
    fn from(e: StemError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(StemError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StemError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StemError::InvalidRequest(_) | StemError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(kind = self.0.kind(), "request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn require_service(state: &ServerState) -> Result<Arc<ProcessingService>, ApiError> {
    state.service.get().ok_or_else(|| {
        ApiError(StemError::ServiceUnavailable(
            "processing service is still starting".into(),
        ))
    })
}

fn audio_response(processed: ProcessedAudio) -> Response {
    let headers = [
        (header::CONTENT_TYPE, "audio/wav".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", processed.filename),
        ),
        (header::CONTENT_LENGTH, processed.bytes.len().to_string()),
        (
            HeaderName::from_static("x-processing-time"),
            format!("{:.2}", processed.processing_time_secs),
        ),
        (HeaderName::from_static("x-task-id"), processed.task_id),
        (
            HeaderName::from_static("x-models-used"),
            processed.models_used.join(","),
        ),
    ];
    (StatusCode::OK, headers, Body::from(processed.bytes)).into_response()
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ServiceInfo {
        service: "vocal-remover",
        version: env!("CARGO_PKG_VERSION"),
        ready: state.service.is_ready(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        methods: ProcessingMethod::ALL.iter().map(|m| m.as_str()).collect(),
    })
}

async fn health(State(service): State<ServiceHandle>) -> Response {
    match service.get() {
        Some(service) => Json(service.health()).into_response(),
        None => Json(StartingHealth {
            status: "starting",
            models_loaded: 0,
        })
        .into_response(),
    }
}

async fn list_models(State(state): State<ServerState>) -> Result<Response, ApiError> {
    let service = require_service(&state)?;
    Ok(Json(service.models()).into_response())
}

async fn stats(State(state): State<ServerState>) -> Result<Response, ApiError> {
    let service = require_service(&state)?;
    Ok(Json(service.stats()).into_response())
}

async fn extract(
    State(state): State<ServerState>,
    body: Result<Json<ExtractBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let service = require_service(&state)?;
    let Json(body) = body?;
    let method = body.method.unwrap_or_default();
    let processed = service.process(&body.url, method).await?;
    Ok(audio_response(processed))
}

async fn extract_with_method(
    State(state): State<ServerState>,
    Path(method): Path<String>,
    body: Result<Json<UrlBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let service = require_service(&state)?;
    let Json(body) = body?;
    let method: ProcessingMethod = method
        .parse()
        .map_err(|e: String| ApiError(StemError::InvalidRequest(e)))?;
    let processed = service.process(&body.url, method).await?;
    Ok(audio_response(processed))
}

async fn fingerprint(
    State(state): State<ServerState>,
    body: Result<Json<FingerprintBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let service = require_service(&state)?;
    let Json(body) = body?;
    let options = ExtractOptions {
        sample_rate: body.sample_rate,
        channels: body.channels,
    };
    let processed = service.extract(&body.url, options).await?;
    Ok(audio_response(processed))
}

pub fn make_app(config: ServerConfig, service: ServiceHandle) -> Router {
    let state = ServerState::new(config, service);

    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/stats", get(stats))
        .route("/extract", post(extract))
        .route("/extract/{method}", post(extract_with_method))
        .route("/fingerprint", post(fingerprint))
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .with_state(state)
}

/// Builds the processing service and preloads models. Until this finishes
/// processing routes answer 503.
async fn start_service(config: AppConfig, handle: ServiceHandle) {
    let service = match ProcessingService::from_config(&config).await {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("could not initialise processing service: {e}");
            return;
        }
    };
    if let Err(e) = service.preload(&config.preload).await {
        warn!("model preload failed, models will load on demand: {e}");
    }
    handle.set(service);
    info!("processing service ready");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not listen for shutdown signal: {e}");
    }
    info!("shutting down");
}

pub async fn run_server(config: AppConfig) -> Result<()> {
    let handle = ServiceHandle::default();
    let app = make_app(
        ServerConfig {
            requests_logging_level: config.logging_level.clone(),
        },
        handle.clone(),
    );

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Listening on {address}");

    tokio::spawn(start_service(config, handle));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
