use crate::config::{BackendConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::protocol::openai::ChatCompletionRequest;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client, Response,
};
use std::pin::Pin;
use tracing::{error, info};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 流式请求时后端的实际返回形态
pub enum BackendReply {
    /// `text/event-stream`，逐块转发给流式转换器
    EventStream(ByteStream),
    /// 后端忽略了 stream 参数，直接返回了完整 JSON
    Complete(Bytes),
}

/// 转发到唯一的上游 chat-completion 端点
pub struct ProxyForwarder {
    client: Client,
    // Dedicated client for streaming (no global timeout)
    streaming_client: Client,
    backend: BackendConfig,
}

impl ProxyForwarder {
    pub fn new(backend: BackendConfig, config: &ProxyConfig) -> Result<Self> {
        // Standard client: obeys configured request timeout
        let client = Self::client_builder(config)
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;

        // Streaming client: no global request timeout to allow long-lived SSE
        let streaming_client = Self::client_builder(config)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            streaming_client,
            backend,
        })
    }

    fn client_builder(config: &ProxyConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .tcp_keepalive(if config.keep_alive {
                Some(std::time::Duration::from_secs(30))
            } else {
                None
            })
    }

    pub fn endpoint(&self) -> &str {
        &self.backend.api_url
    }

    fn headers(&self, accept: &'static str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.backend.api_token))
                .map_err(|_| Error::Config("Invalid backend token format".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
        Ok(headers)
    }

    async fn send_request(
        &self,
        client: &Client,
        request: &ChatCompletionRequest,
        accept: &'static str,
    ) -> Result<Response> {
        info!(
            "Forwarding to backend: {} (model: {}, stream: {})",
            self.backend.api_url, request.model, request.stream
        );

        let body = serde_json::to_vec(request)?;
        let response = client
            .post(&self.backend.api_url)
            .headers(self.headers(accept)?)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP client connection failed: {:?}", e);
                Error::BackendTransport {
                    status: None,
                    body: format!("Failed to reach backend: {}", e),
                }
            })?;

        Self::check_status(response).await
    }

    /// 非 2xx 时读出完整响应体，原样交给客户端
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            info!("Backend response status: {}", status);
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        error!("Backend error response (status {}): {}", status, body);

        Err(Error::BackendTransport {
            status: Some(status.as_u16()),
            body,
        })
    }

    /// 非流式请求：等待并返回完整响应体
    pub async fn forward_request(&self, request: &ChatCompletionRequest) -> Result<Bytes> {
        let response = self
            .send_request(&self.client, request, "application/json")
            .await?;
        let body = response.bytes().await.map_err(Error::Http)?;
        Ok(body)
    }

    /// 流式请求：后端返回 event-stream 时交出字节流，否则读出完整 JSON
    pub async fn stream(&self, request: &ChatCompletionRequest) -> Result<BackendReply> {
        let response = self
            .send_request(&self.streaming_client, request, "text/event-stream")
            .await?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        if !is_event_stream {
            info!("Backend answered a streaming request without event-stream");
            let body = response.bytes().await.map_err(Error::Http)?;
            return Ok(BackendReply::Complete(body));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::Http));
        Ok(BackendReply::EventStream(Box::pin(stream)))
    }
}
