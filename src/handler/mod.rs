use crate::config::Config;
use crate::error::{error_response, Error, Result};
use crate::models::{ModelList, ServiceStatus};
use crate::protocol::adapter::MessagesAdapter;
use crate::protocol::anthropic::MessagesRequest;
use crate::protocol::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::protocol::ProtocolAdapter;
use crate::proxy::{BackendReply, ProxyForwarder};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    proxy: Arc<ProxyForwarder>,
    adapter: Arc<MessagesAdapter>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let proxy = ProxyForwarder::new(config.backend.clone(), &config.proxy)?;
        let adapter = MessagesAdapter::new(config.translation, config.proxy.max_line_bytes);

        Ok(Self {
            config: Arc::new(config),
            proxy: Arc::new(proxy),
            adapter: Arc::new(adapter),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/messages", post(handle_messages))
        .route("/messages", post(handle_messages))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 过滤掉健康检查的日志
                if request.uri().path() == "/health" {
                    tracing::trace_span!("health_check")
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> Json<ServiceStatus> {
    info!("Health check requested");
    Json(ServiceStatus {
        status: "OK".to_string(),
        service: "Anthropic <-> OpenAI protocol bridge".to_string(),
        backend: state.config.backend.api_url.clone(),
        model: state.config.backend.model.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    info!("Models list requested");
    Json(ModelList::from_ids(
        &state.config.models,
        chrono::Utc::now().timestamp_millis(),
    ))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "not_found_error", "Metrics disabled"),
    }
}

async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to parse client request: {}", e);
            return Error::RequestTranslation(e.to_string()).to_response();
        }
    };

    info!(
        "Request received - model: {}, stream: {}, messages: {}",
        request.model,
        request.stream,
        request.messages.len()
    );
    metrics::increment_counter!(
        "bridge_requests_total",
        "stream" => if request.stream { "true" } else { "false" }
    );

    let mut backend_request = state.adapter.transform_request(&request);
    // 所有请求固定到配置的后端模型
    backend_request.model = state.config.backend.model.clone();

    debug!(
        "Converted request to backend format: {}",
        serde_json::to_string(&backend_request).unwrap_or_default()
    );

    let result = if request.stream {
        handle_stream(&state, backend_request).await
    } else {
        handle_non_stream(&state, backend_request).await
    };

    result.unwrap_or_else(|e| {
        error!("Request failed: {}", e);
        metrics::increment_counter!("bridge_backend_errors_total");
        e.to_response()
    })
}

// 处理流式请求
// 状态机随响应体一起被丢弃：客户端断开时后端连接也会被释放
async fn handle_stream(state: &AppState, request: ChatCompletionRequest) -> Result<Response> {
    match state.proxy.stream(&request).await? {
        BackendReply::EventStream(byte_stream) => {
            info!("Streaming response from {}", state.proxy.endpoint());
            let translated = state
                .adapter
                .transform_stream(&state.config.backend.model, byte_stream);

            Ok((
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                    (header::CONNECTION, "keep-alive"),
                ],
                [("x-accel-buffering", "no")], // 禁用 nginx 缓冲
                Body::from_stream(translated),
            )
                .into_response())
        }
        BackendReply::Complete(body) => translate_complete(state, &body),
    }
}

// 处理非流式请求
// 等待上游完整响应 -> 做协议转换 -> 一次性返回给客户端
async fn handle_non_stream(state: &AppState, request: ChatCompletionRequest) -> Result<Response> {
    let body = state.proxy.forward_request(&request).await?;
    translate_complete(state, &body)
}

fn translate_complete(state: &AppState, body: &[u8]) -> Result<Response> {
    let backend_response: ChatCompletionResponse = serde_json::from_slice(body)
        .map_err(|e| Error::Protocol(format!("Invalid backend response: {}", e)))?;

    let translated = state
        .adapter
        .transform_response(&state.config.backend.model, backend_response)?;

    debug!(
        "Converted response to client format: {}",
        serde_json::to_string(&translated).unwrap_or_default()
    );

    Ok(Json(translated).into_response())
}
