//! 流重组器
//!
//! 逐行消费传输层给出的 SSE 行：空行 / 注释行忽略，`data: [DONE]` 结束，`data: {json}` 解析为一个 chunk。
//! chunk 被拆成少量语义事件（思考增量、正文增量、工具分片、结束原因）。单行 JSON 解析失败只记日志并跳过，
//! 不中断整条流；finish_reason 非 stop 且非工具调用则转为错误。

use serde::Deserialize;
use serde_json::Value;

use crate::core::ChatError;
use crate::llm::merge::ToolCallFragment;

const DONE_SENTINEL: &str = "[DONE]";

/// 单行解析出的事件
#[derive(Debug)]
pub enum ChunkEvent {
    Thinking(String),
    Content(String),
    /// 转交给 ToolCallMerger，不直接对外发出
    ToolFragments(Vec<ToolCallFragment>),
    /// finish_reason = stop
    Stop,
    /// finish_reason = tool_calls / function_call
    ToolCallsRequested,
    /// [DONE]
    Done,
    /// 协议错误或非 stop 的结束原因
    Failed(ChatError),
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    content_filter_results: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    /// 部分兼容服务用 reasoning 字段
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
    #[serde(default)]
    refusal: Option<String>,
}

/// 有状态的逐行重组器；收到结束信号后忽略后续所有行
#[derive(Debug, Default)]
pub struct StreamReassembler {
    finished: bool,
    skipped_lines: usize,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 因无法解析而跳过的行数
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn feed_line(&mut self, raw: &str) -> Vec<ChunkEvent> {
        if self.finished {
            return Vec::new();
        }
        let line = raw.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return Vec::new();
        }

        let Some(payload) = trimmed.strip_prefix("data:") else {
            return self.out_of_band(trimmed);
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.finished = true;
            return vec![ChunkEvent::Done];
        }

        let chunk: Chunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => {
                self.skipped_lines += 1;
                tracing::warn!(error = %e, line = %preview(payload), "skipping unparsable stream line");
                return Vec::new();
            }
        };

        if let Some(err) = chunk.error {
            self.finished = true;
            return vec![ChunkEvent::Failed(ChatError::Protocol(error_message(&err)))];
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Vec::new();
        };
        self.classify(choice)
    }

    fn classify(&mut self, choice: Choice) -> Vec<ChunkEvent> {
        let mut events = Vec::new();
        let delta = choice.delta.unwrap_or_default();

        if let Some(text) = delta
            .reasoning_content
            .as_deref()
            .or(delta.reasoning.as_deref())
            .filter(|t| !t.is_empty())
        {
            events.push(ChunkEvent::Thinking(text.to_string()));
        }
        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            events.push(ChunkEvent::Content(text.to_string()));
        }
        if let Some(fragments) = delta.tool_calls.filter(|f| !f.is_empty()) {
            events.push(ChunkEvent::ToolFragments(fragments));
        }

        match choice.finish_reason.as_deref() {
            None => {}
            Some("stop") => {
                self.finished = true;
                events.push(ChunkEvent::Stop);
            }
            Some("tool_calls") | Some("function_call") => {
                self.finished = true;
                events.push(ChunkEvent::ToolCallsRequested);
            }
            Some(reason) => {
                self.finished = true;
                let detail = match (&delta.refusal, &choice.content_filter_results) {
                    (Some(refusal), _) if !refusal.is_empty() => format!(": {}", refusal),
                    (_, Some(cfr)) if !cfr.is_null() => format!(": {}", cfr),
                    _ => String::new(),
                };
                events.push(ChunkEvent::Failed(ChatError::FinishReason {
                    reason: reason.to_string(),
                    detail,
                }));
            }
        }
        events
    }

    /// 非 data: 行：SSE 字段行忽略；带 error 的 JSON 视为带外错误；其余跳过
    fn out_of_band(&mut self, line: &str) -> Vec<ChunkEvent> {
        if ["event:", "id:", "retry:"].iter().any(|p| line.starts_with(p)) {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) if obj.contains_key("error") => {
                self.finished = true;
                vec![ChunkEvent::Failed(ChatError::Protocol(error_message(&obj["error"])))]
            }
            _ => {
                self.skipped_lines += 1;
                tracing::warn!(line = %preview(line), "skipping unexpected stream line");
                Vec::new()
            }
        }
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}

fn preview(s: &str) -> String {
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_line(text: &str) -> String {
        format!(
            "data: {}",
            serde_json::json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
        )
    }

    #[test]
    fn test_content_and_thinking_deltas() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line(
            r#"data: {"choices":[{"delta":{"reasoning_content":"hmm","content":"Hi"}}]}"#,
        );
        assert!(matches!(&events[0], ChunkEvent::Thinking(t) if t == "hmm"));
        assert!(matches!(&events[1], ChunkEvent::Content(t) if t == "Hi"));

        let events = r.feed_line(&content_line(" there"));
        assert!(matches!(&events[0], ChunkEvent::Content(t) if t == " there"));
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let mut r = StreamReassembler::new();
        assert!(r.feed_line("").is_empty());
        assert!(r.feed_line("   \r").is_empty());
        assert!(r.feed_line(": keep-alive").is_empty());
        assert!(r.feed_line("event: message").is_empty());
        assert_eq!(r.skipped_lines(), 0);
    }

    #[test]
    fn test_done_sentinel_ends_stream() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line("data: [DONE]");
        assert!(matches!(events[0], ChunkEvent::Done));
        assert!(r.is_finished());
        assert!(r.feed_line(&content_line("late")).is_empty());
    }

    #[test]
    fn test_empty_choices_ignored() {
        let mut r = StreamReassembler::new();
        assert!(r.feed_line(r#"data: {"choices":[],"usage":{"total_tokens":3}}"#).is_empty());
        assert!(!r.is_finished());
    }

    #[test]
    fn test_malformed_json_skipped_and_stream_continues() {
        let mut r = StreamReassembler::new();
        assert!(r.feed_line("data: {not json").is_empty());
        assert_eq!(r.skipped_lines(), 1);
        let events = r.feed_line(&content_line("ok"));
        assert!(matches!(&events[0], ChunkEvent::Content(t) if t == "ok"));
    }

    #[test]
    fn test_stop_keeps_final_delta() {
        let mut r = StreamReassembler::new();
        let events =
            r.feed_line(r#"data: {"choices":[{"delta":{"content":"!"},"finish_reason":"stop"}]}"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChunkEvent::Content(t) if t == "!"));
        assert!(matches!(events[1], ChunkEvent::Stop));
        assert!(r.is_finished());
    }

    #[test]
    fn test_length_finish_reason_is_error() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line(r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#);
        match &events[0] {
            ChunkEvent::Failed(e) => assert_eq!(e.to_string(), "Generation stopped (length)"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_content_filter_carries_refusal_detail() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line(
            r#"data: {"choices":[{"delta":{"refusal":"not allowed"},"finish_reason":"content_filter"}]}"#,
        );
        match &events[0] {
            ChunkEvent::Failed(e) => {
                assert_eq!(e.to_string(), "Generation stopped (content_filter): not allowed")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_tool_fragments_forwarded() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f","arguments":""}}]}}]}"#,
        );
        match &events[0] {
            ChunkEvent::ToolFragments(f) => {
                assert_eq!(f[0].id.as_deref(), Some("call_1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let events = r.feed_line(r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        assert!(matches!(events[0], ChunkEvent::ToolCallsRequested));
    }

    #[test]
    fn test_out_of_band_error_line() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line(r#"{"error":{"message":"rate limited","code":429}}"#);
        match &events[0] {
            ChunkEvent::Failed(e) => assert!(e.to_string().contains("rate limited")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_data_error_payload() {
        let mut r = StreamReassembler::new();
        let events = r.feed_line(r#"data: {"error":"upstream overloaded"}"#);
        assert!(matches!(&events[0], ChunkEvent::Failed(ChatError::Protocol(m)) if m == "upstream overloaded"));
    }
}
