use crate::error::{Error, Result};
use crate::protocol::anthropic::{
    self, ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, MessagesResponse,
    ResponseBlock, Role, Tool, ToolChoice,
};
use crate::protocol::openai::{
    self, ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatMessage, ChatRole,
    ChatTool, ChatToolChoice, ContentPart, FunctionCall, FunctionDefinition, FunctionName,
    ImageUrl, ToolCall,
};
use crate::protocol::stream::{translate_stream, StreamTranslator};
use crate::protocol::{map_finish_reason, ProtocolAdapter, TranslationOptions};
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use tracing::debug;

/// Messages（客户端）<-> Chat Completions（后端）转换器
///
/// 请求和完整响应的转换都是纯函数；流式转换为每个请求新建一个 [`StreamTranslator`]
pub struct MessagesAdapter {
    options: TranslationOptions,
    max_line_bytes: usize,
}

impl MessagesAdapter {
    pub fn new(options: TranslationOptions, max_line_bytes: usize) -> Self {
        Self {
            options,
            max_line_bytes,
        }
    }

    /// 为单个流式请求创建状态机
    pub fn stream_translator(&self, model: &str) -> StreamTranslator {
        StreamTranslator::new(self.options, self.max_line_bytes).with_model(model)
    }

    // ================== 请求转换 ==================

    fn convert_request(&self, request: &MessagesRequest) -> ChatCompletionRequest {
        let mut messages = Vec::new();

        if let Some(system) = &request.system {
            let text = system.to_text();
            if !text.is_empty() {
                messages.push(ChatMessage::text(ChatRole::System, text));
            }
        }

        for message in &request.messages {
            messages.extend(self.convert_message(message));
        }

        if request.top_k.is_some() {
            debug!("Dropping top_k: no chat-completion equivalent");
        }

        ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            stream: request.stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop_sequences.clone(),
            tools: request
                .tools
                .as_ref()
                .filter(|tools| !tools.is_empty())
                .map(|tools| tools.iter().map(convert_tool).collect()),
            tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        }
    }

    /// 单条客户端消息转换为一条（或在 fan-out 模式下多条）后端消息
    ///
    /// 优先级：tool_result（仅 user）> tool_use（仅 assistant）> 图片 > 纯文本
    fn convert_message(&self, message: &Message) -> Vec<ChatMessage> {
        let role = match message.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };

        let blocks = match &message.content {
            MessageContent::Text(text) => return vec![ChatMessage::text(role, text.clone())],
            MessageContent::Blocks(blocks) => blocks,
        };

        let tool_results: Vec<(&String, &Value)> = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => Some((tool_use_id, content)),
                _ => None,
            })
            .collect();

        if message.role == Role::User && !tool_results.is_empty() {
            let take = if self.options.fan_out_tool_results {
                tool_results.len()
            } else {
                1
            };
            return tool_results
                .into_iter()
                .take(take)
                .map(|(tool_use_id, content)| ChatMessage {
                    role: ChatRole::Tool,
                    content: Some(ChatContent::Text(tool_result_text(content))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                })
                .collect();
        }

        let text = joined_text(blocks);

        let tool_calls: Vec<ToolCall> = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    call_type: openai::function_type(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                _ => None,
            })
            .collect();

        if message.role == Role::Assistant && !tool_calls.is_empty() {
            return vec![ChatMessage {
                role,
                content: (!text.is_empty()).then(|| ChatContent::Text(text)),
                tool_calls: Some(tool_calls),
                tool_call_id: None,
            }];
        }

        let has_images = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::Image { .. }));

        if has_images {
            let parts = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(ContentPart::Text { text: text.clone() }),
                    ContentBlock::Image { source } => Some(ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url(source),
                        },
                    }),
                    _ => None,
                })
                .collect();
            return vec![ChatMessage {
                role,
                content: Some(ChatContent::Parts(parts)),
                tool_calls: None,
                tool_call_id: None,
            }];
        }

        vec![ChatMessage::text(role, text)]
    }

    // ================== 响应转换 ==================

    fn convert_response(
        &self,
        fallback_model: &str,
        response: ChatCompletionResponse,
    ) -> Result<MessagesResponse> {
        let ChatCompletionResponse {
            id,
            model,
            choices,
            usage,
            ..
        } = response;

        let choice = choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("No choices in backend response".into()))?;

        let message = choice.message;
        let mut content = Vec::new();

        // 正文优先，只有正文为空时才使用 reasoning_content，二者不会同时出现
        match (message.content, message.reasoning_content) {
            (Some(text), _) if !text.is_empty() => content.push(ResponseBlock::Text { text }),
            (_, Some(reasoning)) if !reasoning.is_empty() => {
                content.push(ResponseBlock::Text { text: reasoning })
            }
            _ => {}
        }

        for call in message.tool_calls.unwrap_or_default() {
            let input = parse_tool_arguments(&call)?;
            content.push(ResponseBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }

        let usage = usage.unwrap_or_default();

        Ok(MessagesResponse {
            id: id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(anthropic::new_message_id),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: model
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| fallback_model.to_string()),
            stop_reason: Some(map_finish_reason(choice.finish_reason.as_deref())),
            stop_sequence: None,
            usage: anthropic::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }
}

impl ProtocolAdapter for MessagesAdapter {
    fn transform_request(&self, request: &MessagesRequest) -> ChatCompletionRequest {
        self.convert_request(request)
    }

    fn transform_response(
        &self,
        model: &str,
        response: ChatCompletionResponse,
    ) -> Result<MessagesResponse> {
        self.convert_response(model, response)
    }

    fn transform_stream(
        &self,
        model: &str,
        stream: impl Stream<Item = Result<Bytes>> + Send + 'static,
    ) -> Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>> {
        Box::pin(translate_stream(self.stream_translator(model), stream))
    }
}

fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// tool_result 的内容：字符串原样，文本块数组按换行拼接，其余 JSON 编码
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Array(items) => {
            let texts: Option<Vec<&str>> = items
                .iter()
                .map(|item| match item.get("type").and_then(Value::as_str) {
                    Some("text") => item.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            match texts {
                Some(texts) if !texts.is_empty() => texts.join("\n"),
                _ => content.to_string(),
            }
        }
        other => other.to_string(),
    }
}

fn image_url(source: &ImageSource) -> String {
    if source.source_type == "base64" {
        let media_type = source.media_type.as_deref().unwrap_or("image/png");
        format!(
            "data:{};base64,{}",
            media_type,
            source.data.as_deref().unwrap_or_default()
        )
    } else {
        source
            .url
            .clone()
            .or_else(|| source.data.clone())
            .unwrap_or_default()
    }
}

fn convert_tool(tool: &Tool) -> ChatTool {
    ChatTool {
        tool_type: openai::function_type(),
        function: FunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Mode(mode) => ChatToolChoice::Mode(
            match mode.as_str() {
                "any" => "required",
                "none" => "none",
                _ => "auto",
            }
            .to_string(),
        ),
        ToolChoice::Object {
            choice_type,
            name: Some(name),
        } if choice_type == "tool" => ChatToolChoice::Function {
            choice_type: openai::function_type(),
            function: FunctionName { name: name.clone() },
        },
        _ => ChatToolChoice::Mode("auto".to_string()),
    }
}

fn parse_tool_arguments(call: &ToolCall) -> Result<Value> {
    let arguments = call.function.arguments.trim();
    // 无参数工具的 arguments 可能是空字符串
    if arguments.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(arguments).map_err(|source| Error::ToolArgumentParse {
        tool_call_id: call.id.clone(),
        source,
    })
}
