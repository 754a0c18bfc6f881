//! Mock 传输层（用于测试，无需 API）
//!
//! 按顺序回放预先写好的流式轮次与非流式回复，并记录收到的请求，便于断言轮数与请求内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::core::ChatError;
use crate::llm::{ChatRequest, CompletionTransport, LineStream};
use crate::memory::Message;

/// 一次流式请求的脚本
#[derive(Debug, Clone)]
pub enum MockRound {
    /// 依次产出这些原始行
    Lines(Vec<String>),
    /// 请求阶段即失败（连接错误等）
    Fail(String),
    /// 先产出这些行，随后读流失败
    Broken(Vec<String>, String),
}

#[derive(Default)]
struct MockState {
    rounds: VecDeque<MockRound>,
    repeat: Option<MockRound>,
    completions: VecDeque<Result<String, String>>,
    models: Vec<String>,
    requests: Vec<ChatRequest>,
    completion_calls: Vec<(String, Vec<Message>)>,
}

/// 脚本化的 CompletionTransport
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_round(self, round: MockRound) -> Self {
        self.lock().rounds.push_back(round);
        self
    }

    /// 脚本耗尽后一直重复此轮
    pub fn repeating(self, round: MockRound) -> Self {
        self.lock().repeat = Some(round);
        self
    }

    pub fn with_completion(self, reply: Result<String, String>) -> Self {
        self.lock().completions.push_back(reply);
        self
    }

    pub fn with_models(self, models: &[&str]) -> Self {
        self.lock().models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.lock().requests.clone()
    }

    /// 非流式调用记录：(model, messages)
    pub fn completion_calls(&self) -> Vec<(String, Vec<Message>)> {
        self.lock().completion_calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 构造一条 content 增量的 data 行
pub fn content_line(text: &str) -> String {
    format!(
        "data: {}",
        serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]})
    )
}

/// 构造一条 reasoning_content 增量的 data 行
pub fn thinking_line(text: &str) -> String {
    format!(
        "data: {}",
        serde_json::json!({"choices": [{"index": 0, "delta": {"reasoning_content": text}, "finish_reason": null}]})
    )
}

/// 构造一条携带完整工具调用分片的 data 行
pub fn tool_call_line(index: usize, id: &str, name: &str, arguments: &str) -> String {
    format!(
        "data: {}",
        serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": index, "id": id, "type": "function", "function": {"name": name, "arguments": arguments}}
        ]}, "finish_reason": null}]})
    )
}

/// 构造 finish_reason 行
pub fn finish_line(reason: &str) -> String {
    format!(
        "data: {}",
        serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": reason}]})
    )
}

pub fn done_line() -> String {
    "data: [DONE]".to_string()
}

#[async_trait]
impl CompletionTransport for MockTransport {
    async fn stream_lines(&self, request: &ChatRequest) -> Result<LineStream, ChatError> {
        let round = {
            let mut state = self.lock();
            state.requests.push(request.clone());
            state.rounds.pop_front().or_else(|| state.repeat.clone())
        };
        match round {
            Some(MockRound::Lines(lines)) => Ok(Box::pin(stream::iter(lines.into_iter().map(Ok)))),
            Some(MockRound::Fail(msg)) => Err(ChatError::Transport(msg)),
            Some(MockRound::Broken(lines, msg)) => {
                let items = lines
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(ChatError::Transport(msg))));
                Ok(Box::pin(stream::iter(items)))
            }
            None => Err(ChatError::Transport("mock script exhausted".to_string())),
        }
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, ChatError> {
        let mut state = self.lock();
        state.completion_calls.push((model.to_string(), messages.to_vec()));
        match state.completions.pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(msg)) => Err(ChatError::Transport(msg)),
            None => Err(ChatError::Transport("mock completion exhausted".to_string())),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        Ok(self.lock().models.clone())
    }
}
