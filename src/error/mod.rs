use axum::body::Body;
use axum::http::{Response, StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// 客户端请求无法解析为 Messages 格式（例如缺少 messages 字段）
    #[error("Invalid request: {0}")]
    RequestTranslation(String),

    /// 上游返回非 2xx，或在读取任何字节之前连接失败
    #[error("Backend returned error status {status:?}: {body}")]
    BackendTransport { status: Option<u16>, body: String },

    /// 非流式响应中工具调用的 arguments 不是合法 JSON
    #[error("Tool call {tool_call_id} has invalid JSON arguments: {source}")]
    ToolArgumentParse {
        tool_call_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 返回给客户端的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RequestTranslation(_) => StatusCode::BAD_REQUEST,
            Error::BackendTransport { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Error::ToolArgumentParse { .. } | Error::Protocol(_) | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Config(_) | Error::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 错误信封中的 `error.type`
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RequestTranslation(_) => "invalid_request_error",
            _ => "api_error",
        }
    }

    /// 错误信封中的 `error.message`
    ///
    /// 上游错误原样透传上游响应体，方便客户端看到真实原因
    pub fn client_message(&self) -> String {
        match self {
            Error::BackendTransport { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }

    /// 构建客户端可见的错误响应
    pub fn to_response(&self) -> Response<Body> {
        error_response(self.status_code(), self.kind(), &self.client_message())
    }
}

pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response<Body> {
    let body = json!({
        "type": "error",
        "error": {
            "type": kind,
            "message": message,
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}
