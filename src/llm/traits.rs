//! 补全传输层抽象
//!
//! 所有后端（HTTP / Mock）实现 CompletionTransport：stream_lines（每轮一次流式请求，产出原始协议行）、
//! complete（非流式，维护任务使用）、list_models。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;

use crate::core::ChatError;
use crate::memory::Message;

/// 原始协议行流；被 drop 时底层连接随之关闭
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// POST {base_url}/chat/completions 的请求体
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    pub fn streaming(model: &str, messages: Vec<Message>, tools: Vec<Value>) -> Self {
        let (tools, tool_choice) = if tools.is_empty() {
            (None, None)
        } else {
            (Some(tools), Some("auto".to_string()))
        };
        Self {
            model: model.to_string(),
            messages,
            stream: true,
            tools,
            tool_choice,
        }
    }

    pub fn plain(model: &str, messages: Vec<Message>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            stream: false,
            tools: None,
            tool_choice: None,
        }
    }
}

/// 传输层 trait：流式 / 非流式补全与模型列表
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// 发起一次流式请求，返回按行切分的原始响应
    async fn stream_lines(&self, request: &ChatRequest) -> Result<LineStream, ChatError>;

    /// 非流式补全，返回 choices[0].message.content
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String, ChatError>;

    /// GET {base_url}/models 的 id 列表
    async fn list_models(&self) -> Result<Vec<String>, ChatError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_request_without_tools_omits_fields() {
        let req = ChatRequest::streaming("m", vec![Message::user("hi")], vec![]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["stream"], true);
        assert!(v.get("tools").is_none());
        assert!(v.get("tool_choice").is_none());
    }

    #[test]
    fn test_streaming_request_with_tools() {
        let tools = vec![serde_json::json!({"type": "function", "function": {"name": "f"}})];
        let req = ChatRequest::streaming("m", vec![], tools);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["tool_choice"], "auto");
        assert_eq!(v["tools"][0]["function"]["name"], "f");
    }
}
