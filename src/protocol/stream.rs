//! 后端 Chat Completions SSE 流 -> 客户端 Messages SSE 流
//!
//! 后端格式:
//! ```text
//! data: {"id":"chatcmpl-123","choices":[{"delta":{"role":"assistant","content":""},"finish_reason":null}]}
//! data: {"id":"chatcmpl-123","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}
//! data: {"id":"chatcmpl-123","choices":[{"delta":{},"finish_reason":"stop"}]}
//! data: [DONE]
//! ```
//!
//! 客户端格式:
//! ```text
//! event: message_start
//! data: {"type":"message_start","message":{...}}
//!
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}
//!
//! event: message_delta
//! data: {"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":1}}
//!
//! event: message_stop
//! data: {"type":"message_stop"}
//! ```

use crate::error::Result;
use crate::protocol::anthropic::{
    new_message_id, Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseBlock,
    StreamEvent,
};
use crate::protocol::openai::{ChatCompletionChunk, ToolCallDelta};
use crate::protocol::{map_finish_reason, TranslationOptions};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";
/// 后端没有上报 usage 时 message_delta 中使用的占位值，不代表真实 token 数
const PLACEHOLDER_OUTPUT_TOKENS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingFirstDelta,
    StreamingText,
    StreamingToolCall,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Text,
    Tool {
        call_index: Option<u32>,
        id: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct OpenBlock {
    index: usize,
    kind: BlockKind,
}

/// 单个请求的流式转换状态机
///
/// 由传输层按块驱动：[`push`](Self::push) 处理新到达的字节，[`finish`](Self::finish)
/// 在后端流结束（或出错）时收尾。不持有任何跨请求状态。
#[derive(Debug)]
pub struct StreamTranslator {
    state: StreamState,
    options: TranslationOptions,
    buffer: BytesMut,
    /// 缓冲区中已确认不含换行的前缀长度
    scanned: usize,
    max_line_bytes: usize,
    /// 当前行超出上限，丢弃到下一个换行为止
    discarding: bool,
    message_started: bool,
    model: String,
    output_tokens: Option<u64>,
    open_block: Option<OpenBlock>,
    next_index: usize,
    frame_errors: usize,
}

impl StreamTranslator {
    pub fn new(options: TranslationOptions, max_line_bytes: usize) -> Self {
        Self {
            state: StreamState::AwaitingFirstDelta,
            options,
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
            discarding: false,
            message_started: false,
            model: String::new(),
            output_tokens: None,
            open_block: None,
            next_index: 0,
            frame_errors: 0,
        }
    }

    /// 后端帧没有 model 字段时 message_start 使用的模型名
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    /// 被跳过的无法解析的 data 行数量
    pub fn frame_errors(&self) -> usize {
        self.frame_errors
    }

    /// 追加一段传输块，处理其中所有完整的行，最后一个不完整的行留在缓冲区
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.is_finished() {
            return out;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
        {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let line = self.buffer.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.process_line(&line[..pos], &mut out);
            if self.is_finished() {
                self.buffer.clear();
                return out;
            }
        }

        if self.buffer.len() > self.max_line_bytes {
            warn!(
                "Stream line exceeded {} bytes, dropping partial line",
                self.max_line_bytes
            );
            self.buffer.clear();
            self.discarding = true;
        }
        self.scanned = self.buffer.len();

        out
    }

    /// 后端流结束：处理残留的最后一行，若尚未收到 `[DONE]` 则补发 message_stop
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.is_finished() {
            return out;
        }

        let rest = self.buffer.split();
        self.scanned = 0;
        if !rest.is_empty() && !self.discarding {
            self.process_line(&rest, &mut out);
        }

        if !self.is_finished() {
            debug!("Backend stream ended without [DONE]");
            self.complete(&mut out);
        }

        out
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<StreamEvent>) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.strip_suffix('\r').unwrap_or(decoded.as_ref());

        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };

        if payload.trim() == DONE_MARKER {
            self.complete(out);
            return;
        }

        match serde_json::from_str::<ChatCompletionChunk>(payload) {
            Ok(chunk) => self.translate_chunk(chunk, out),
            Err(e) => {
                self.frame_errors += 1;
                metrics::increment_counter!("bridge_stream_frame_errors_total");
                let preview: String = payload.chars().take(100).collect();
                warn!("Skipping unparseable stream frame: {} ({})", preview, e);
            }
        }
    }

    fn translate_chunk(&mut self, chunk: ChatCompletionChunk, out: &mut Vec<StreamEvent>) {
        if let Some(usage) = &chunk.usage {
            self.output_tokens = Some(usage.completion_tokens);
        }

        let ChatCompletionChunk {
            id, model, choices, ..
        } = chunk;

        let Some(choice) = choices.into_iter().next() else {
            return;
        };

        let delta = choice.delta;
        let text = delta
            .content
            .filter(|text| !text.is_empty())
            .or_else(|| delta.reasoning_content.filter(|text| !text.is_empty()));
        let tool_calls = delta.tool_calls.unwrap_or_default();

        // 角色声明帧等不携带内容的帧只会触发 message_start；
        // 首帧就带内容时也先补发 message_start
        self.start_message(id, model, out);

        if let Some(text) = text {
            let index = self.text_block_index(out);
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta { text },
            });
            self.state = StreamState::StreamingText;
        }

        for call in tool_calls {
            self.tool_call_delta(call, out);
            self.state = StreamState::StreamingToolCall;
        }

        if let Some(reason) = choice.finish_reason {
            self.close_block(out);
            out.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: map_finish_reason(Some(&reason)),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: self.output_tokens.unwrap_or(PLACEHOLDER_OUTPUT_TOKENS),
                },
            });
        }
    }

    /// message_start 每个流最多发送一次
    fn start_message(
        &mut self,
        id: Option<String>,
        model: Option<String>,
        out: &mut Vec<StreamEvent>,
    ) {
        if self.message_started {
            return;
        }
        self.message_started = true;

        let id = id.filter(|id| !id.is_empty()).unwrap_or_else(new_message_id);
        let model = model
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.model.clone());
        out.push(StreamEvent::MessageStart {
            message: MessagesResponse::skeleton(id, model),
        });
    }

    fn text_block_index(&mut self, out: &mut Vec<StreamEvent>) -> usize {
        if !self.options.block_lifecycle_events {
            return 0;
        }
        if let Some(block) = &self.open_block {
            if block.kind == BlockKind::Text {
                return block.index;
            }
        }
        self.open_new_block(
            BlockKind::Text,
            ResponseBlock::Text {
                text: String::new(),
            },
            out,
        )
    }

    fn tool_call_delta(&mut self, call: ToolCallDelta, out: &mut Vec<StreamEvent>) {
        let (name, arguments) = match call.function {
            Some(function) => (function.name, function.arguments),
            None => (None, None),
        };

        if !self.options.block_lifecycle_events {
            out.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::ToolUseDelta {
                    id: call.id,
                    name,
                    input: arguments,
                },
            });
            return;
        }

        let continues_open_block = match &self.open_block {
            Some(OpenBlock {
                kind: BlockKind::Tool { call_index, id },
                ..
            }) => {
                let same_id = call.id.is_none() || call.id == *id;
                let same_index = call.index.is_none() || call.index == *call_index;
                same_id && same_index
            }
            _ => false,
        };

        let open_index = self.open_block.as_ref().map(|block| block.index);
        let index = match open_index {
            Some(index) if continues_open_block => index,
            _ => self.open_new_block(
                BlockKind::Tool {
                    call_index: call.index,
                    id: call.id.clone(),
                },
                ResponseBlock::ToolUse {
                    id: call.id.clone().unwrap_or_default(),
                    name: name.unwrap_or_default(),
                    input: Value::Object(Default::default()),
                },
                out,
            ),
        };

        if let Some(partial_json) = arguments.filter(|args| !args.is_empty()) {
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json },
            });
        }
    }

    fn open_new_block(
        &mut self,
        kind: BlockKind,
        content_block: ResponseBlock,
        out: &mut Vec<StreamEvent>,
    ) -> usize {
        self.close_block(out);
        let index = self.next_index;
        self.next_index += 1;
        self.open_block = Some(OpenBlock { index, kind });
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(block) = self.open_block.take() {
            out.push(StreamEvent::ContentBlockStop { index: block.index });
        }
    }

    fn complete(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_block(out);
        out.push(StreamEvent::MessageStop);
        self.state = StreamState::Finished;
        self.buffer.clear();
        self.scanned = 0;
    }
}

/// 生成 SSE 格式的字符串: `event: <type>\ndata: <json>\n\n`
pub fn format_sse(event: &StreamEvent) -> Result<String> {
    Ok(format!(
        "event: {}\ndata: {}\n\n",
        event.event_type(),
        serde_json::to_string(event)?
    ))
}

fn encode_events(events: &[StreamEvent]) -> Result<Bytes> {
    let mut encoded = String::new();
    for event in events {
        encoded.push_str(&format_sse(event)?);
    }
    Ok(Bytes::from(encoded))
}

/// 用状态机包装后端字节流
///
/// 只有客户端拉取时才会读取后端，客户端断开时整个流（包括后端连接）随之释放。
/// 后端中途出错时记录日志并补发结束事件后关闭。
pub fn translate_stream<S>(
    mut translator: StreamTranslator,
    upstream: S,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut upstream = Box::pin(upstream);

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let events = translator.push(&bytes);
                    if !events.is_empty() {
                        yield encode_events(&events);
                    }
                    if translator.is_finished() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Backend stream error: {}", e);
                    break;
                }
            }
        }

        let events = translator.finish();
        if !events.is_empty() {
            yield encode_events(&events);
        }

        info!(
            "Stream completed (skipped frames: {})",
            translator.frame_errors()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::anthropic::StopReason;
    use futures::stream;

    fn translator() -> StreamTranslator {
        StreamTranslator::new(TranslationOptions::default(), 1024 * 1024).with_model("glm")
    }

    fn lifecycle_translator() -> StreamTranslator {
        StreamTranslator::new(
            TranslationOptions {
                block_lifecycle_events: true,
                ..TranslationOptions::default()
            },
            1024 * 1024,
        )
    }

    fn feed(translator: &mut StreamTranslator, chunks: &[&str]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(translator.push(chunk.as_bytes()));
        }
        events.extend(translator.finish());
        events
    }

    fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_type).collect()
    }

    const HELLO_STREAM: &str = concat!(
        "data: {\"choices\":[{\"delta\":{}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: [DONE]\n\n"
    );

    fn text_delta(text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    #[test]
    fn minimal_stream_yields_start_delta_stop() {
        let events = feed(&mut translator(), &[HELLO_STREAM]);

        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
        assert_eq!(events[1], text_delta("Hi"));
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert!(message.content.is_empty());
                assert_eq!(message.usage.input_tokens, 0);
                assert_eq!(message.usage.output_tokens, 0);
                assert_eq!(message.model, "glm");
                assert!(message.id.starts_with("msg_"));
            }
            other => panic!("expected message_start, got {other:?}"),
        }
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let expected = event_types(&feed(&mut translator(), &[HELLO_STREAM]));

        for split in 1..HELLO_STREAM.len() {
            let (head, tail) = HELLO_STREAM.split_at(split);
            let events = feed(&mut translator(), &[head, tail]);
            assert_eq!(event_types(&events), expected, "split at {split}");
            assert_eq!(events[1], text_delta("Hi"), "split at {split}");
        }

        let bytes: Vec<String> = HELLO_STREAM.chars().map(String::from).collect();
        let singles: Vec<&str> = bytes.iter().map(String::as_str).collect();
        assert_eq!(event_types(&feed(&mut translator(), &singles)), expected);
    }

    #[test]
    fn multibyte_text_split_across_chunks() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo 世界\"}}]}\n";
        let bytes = frame.as_bytes();
        let split = frame.find('世').unwrap() + 1;

        let mut t = translator();
        let mut events = t.push(&bytes[..split]);
        events.extend(t.push(&bytes[split..]));

        assert_eq!(events[1], text_delta("héllo 世界"));
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut t = translator();
        let events = feed(
            &mut t,
            &[concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
                "data: not-json\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_delta",
                "content_block_delta",
                "message_stop"
            ]
        );
        assert_eq!(events[1], text_delta("a"));
        assert_eq!(events[2], text_delta("b"));
        assert_eq!(t.frame_errors(), 1);
    }

    #[test]
    fn message_start_is_emitted_once() {
        let events = feed(
            &mut translator(),
            &[concat!(
                "data: {\"id\":\"chatcmpl-1\",\"model\":\"GLM\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.id, "chatcmpl-1");
                assert_eq!(message.model, "GLM");
            }
            other => panic!("expected message_start, got {other:?}"),
        }
    }

    #[test]
    fn content_before_role_frame_still_starts_message_first() {
        let events = feed(
            &mut translator(),
            &["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n"],
        );
        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
    }

    #[test]
    fn finish_reason_emits_message_delta() {
        let mut t = translator();
        let events = feed(
            &mut t,
            &[concat!(
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"done\"},\"finish_reason\":\"length\"}]}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_delta",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(
            events[2],
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: StopReason::MaxTokens,
                    stop_sequence: None,
                },
                usage: DeltaUsage { output_tokens: 1 },
            }
        );
    }

    #[test]
    fn reported_usage_replaces_placeholder() {
        let events = feed(
            &mut translator(),
            &[concat!(
                "data: {\"choices\":[{\"delta\":{}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":42}}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        match &events[1] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, StopReason::EndTurn);
                assert_eq!(usage.output_tokens, 42);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_fragments_are_forwarded() {
        let mut t = translator();
        let events = feed(
            &mut t,
            &[concat!(
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\"}}]}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Paris\\\"}\"}}]}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(
            events[1],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::ToolUseDelta {
                    id: Some("call_1".to_string()),
                    name: Some("get_weather".to_string()),
                    input: Some(String::new()),
                },
            }
        );
        assert_eq!(
            events[2],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::ToolUseDelta {
                    id: None,
                    name: None,
                    input: Some("{\"city\":".to_string()),
                },
            }
        );
        match &events[4] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, StopReason::ToolUse)
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        assert_eq!(t.state(), StreamState::Finished);
    }

    #[test]
    fn tool_use_delta_omits_absent_fields_on_the_wire() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::ToolUseDelta {
                id: None,
                name: None,
                input: Some("{}".to_string()),
            },
        };
        let wire: Value = serde_json::from_str(
            format_sse(&event)
                .unwrap()
                .lines()
                .nth(1)
                .unwrap()
                .strip_prefix("data: ")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "tool_use_delta", "input": "{}"}
            })
        );
    }

    #[test]
    fn frames_after_done_are_ignored() {
        let mut t = translator();
        let mut events = t.push(HELLO_STREAM.as_bytes());
        events.extend(t.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n"));
        events.extend(t.finish());

        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
    }

    #[test]
    fn missing_done_still_terminates() {
        let mut t = translator();
        let events = feed(
            &mut t,
            &["data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}"],
        );

        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
        assert!(t.is_finished());
    }

    #[test]
    fn state_transitions() {
        let mut t = translator();
        assert_eq!(t.state(), StreamState::AwaitingFirstDelta);
        t.push(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n");
        assert_eq!(t.state(), StreamState::AwaitingFirstDelta);
        t.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n");
        assert_eq!(t.state(), StreamState::StreamingText);
        t.push(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\"}]}}]}\n");
        assert_eq!(t.state(), StreamState::StreamingToolCall);
        t.push(b"data: [DONE]\n");
        assert_eq!(t.state(), StreamState::Finished);
    }

    #[test]
    fn crlf_and_non_data_lines_are_tolerated() {
        let events = feed(
            &mut translator(),
            &[concat!(
                ": keep-alive\r\n",
                "event: chunk\r\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n\r\n",
                "data: [DONE]\r\n\r\n"
            )],
        );
        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
        assert_eq!(events[1], text_delta("Hi"));
    }

    #[test]
    fn oversized_line_is_dropped() {
        let mut t = StreamTranslator::new(TranslationOptions::default(), 64);
        let long = format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}", "x".repeat(200));

        let mut events = t.push(long.as_bytes());
        events.extend(t.push(b"\"}}]}\n"));
        events.extend(t.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n"));
        events.extend(t.push(b"data: [DONE]\n"));

        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
        assert_eq!(events[1], text_delta("ok"));
    }

    #[test]
    fn long_line_in_small_chunks_is_scanned_once() {
        let big = "x".repeat(1024 * 1024);
        let frame = format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
            big
        );
        let mut t = StreamTranslator::new(TranslationOptions::default(), 2 * 1024 * 1024);

        let started = std::time::Instant::now();
        let mut events = Vec::new();
        for chunk in frame.as_bytes().chunks(256) {
            events.extend(t.push(chunk));
        }
        events.extend(t.push(b"data: [DONE]\n\n"));

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(
            event_types(&events),
            vec!["message_start", "content_block_delta", "message_stop"]
        );
        assert_eq!(events[1], text_delta(&big));
    }

    #[test]
    fn reasoning_content_is_streamed_when_content_is_empty() {
        let events = feed(
            &mut translator(),
            &[concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"\",\"reasoning_content\":\"think\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"answer\",\"reasoning_content\":\"ignored\"}}]}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_delta",
                "content_block_delta",
                "message_stop"
            ]
        );
        assert_eq!(events[1], text_delta("think"));
        assert_eq!(events[2], text_delta("answer"));
    }

    #[test]
    fn lifecycle_events_wrap_text_and_tool_blocks() {
        let events = feed(
            &mut lifecycle_translator(),
            &[concat!(
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Checking\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"lookup\",\"arguments\":\"\"}}]}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{}\"}}]}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_2\",\"function\":{\"name\":\"other\",\"arguments\":\"{}\"}}]}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
                "data: [DONE]\n\n"
            )],
        );

        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(
            events[4],
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ResponseBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "lookup".to_string(),
                    input: serde_json::json!({}),
                },
            }
        );
        assert_eq!(
            events[5],
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta {
                    partial_json: "{}".to_string()
                },
            }
        );
        assert_eq!(events[9], StreamEvent::ContentBlockStop { index: 2 });
    }

    #[test]
    fn lifecycle_mode_closes_open_block_on_done() {
        let events = feed(&mut lifecycle_translator(), &[HELLO_STREAM]);
        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_stop"
            ]
        );
    }

    #[test]
    fn sse_encoding() {
        let encoded = format_sse(&StreamEvent::MessageStop).unwrap();
        assert_eq!(
            encoded,
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }

    #[tokio::test]
    async fn stream_wrapper_translates_chunks() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{}}]}\n\ndata: {\"choi")),
            Ok(Bytes::from_static(b"ces\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let output: Vec<Bytes> = translate_stream(translator(), stream::iter(chunks))
            .map(|item| item.unwrap())
            .collect()
            .await;
        let text: String = output
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();

        let names: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(names, vec!["message_start", "content_block_delta", "message_stop"]);
        assert!(text.contains("\"text_delta\""));
    }

    #[tokio::test]
    async fn stream_wrapper_closes_after_backend_error() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n")),
            Err(Error::Protocol("connection reset".to_string())),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n")),
        ];
        let output: Vec<Result<Bytes>> = translate_stream(translator(), stream::iter(chunks))
            .collect()
            .await;

        let text: String = output
            .into_iter()
            .map(|item| String::from_utf8_lossy(&item.unwrap()).into_owned())
            .collect();
        assert!(text.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
        assert!(!text.contains("never"));
    }

    #[tokio::test]
    async fn dropping_output_releases_backend_stream() {
        let (guard, released) = tokio::sync::oneshot::channel::<()>();
        let upstream = stream::iter(vec![Ok::<_, Error>(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        ))])
        .chain(stream::pending())
        .map(move |item| {
            let _held = &guard;
            item
        });

        let mut output = Box::pin(translate_stream(translator(), upstream));
        let first = output.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("message_start"));

        drop(output);
        let dropped = tokio::time::timeout(std::time::Duration::from_secs(1), released)
            .await
            .expect("backend stream was not released");
        assert!(dropped.is_err());
    }
}
