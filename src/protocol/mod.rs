pub mod adapter;
pub mod anthropic;
pub mod openai;
pub mod stream;

use crate::error::Result;
use anthropic::{MessagesRequest, MessagesResponse, StopReason};
use bytes::Bytes;
use futures::Stream;
use openai::{ChatCompletionRequest, ChatCompletionResponse};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// 协议转换选项，对应配置文件中的 `translation` 段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationOptions {
    /// 一条用户消息中的每个 tool_result 都生成独立的 tool 消息；关闭时只转换第一个
    pub fan_out_tool_results: bool,
    /// 流式输出中额外发送 content_block_start / content_block_stop
    pub block_lifecycle_events: bool,
}

/// 后端 finish_reason 到客户端 stop_reason 的映射
pub fn map_finish_reason(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

pub trait ProtocolAdapter: Send + Sync {
    /// 客户端请求 -> 后端请求。`model` 由调用方在转换后覆盖
    fn transform_request(&self, request: &MessagesRequest) -> ChatCompletionRequest;

    /// 后端完整响应 -> 客户端完整响应，只处理第一个 choice；
    /// 后端没有返回 model 时使用 `model`
    fn transform_response(
        &self,
        model: &str,
        response: ChatCompletionResponse,
    ) -> Result<MessagesResponse>;

    /// 后端 SSE 字节流 -> 客户端 SSE 字节流，每个请求一个独立的状态机
    fn transform_stream(
        &self,
        model: &str,
        stream: impl Stream<Item = Result<Bytes>> + Send + 'static,
    ) -> Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;
}
