//! 错误类型
//!
//! 区分传输错误、协议错误、轮数上限、取消与存储错误；前台轮次遇到这些错误即结束本轮，
//! 后台维护任务的错误由 TaskScheduler 捕获，不会冒泡到交互循环。

use thiserror::Error;

/// 对话客户端运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum ChatError {
    /// 连接失败、超时、读流中断
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// 顶层响应格式不合法
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// finish_reason 既不是 stop 也不是工具调用（length / content_filter 等）
    #[error("Generation stopped ({reason}){detail}")]
    FinishReason { reason: String, detail: String },

    #[error("Maximum tool rounds reached ({0})")]
    RoundLimit(usize),

    /// 流结束时既无文本也无工具调用，且没有显式 stop
    #[error("Stream ended without any output")]
    EmptyTurn,

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(e: config::ConfigError) -> Self {
        ChatError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_display() {
        let e = ChatError::FinishReason {
            reason: "length".to_string(),
            detail: String::new(),
        };
        assert_eq!(e.to_string(), "Generation stopped (length)");

        let e = ChatError::FinishReason {
            reason: "content_filter".to_string(),
            detail: ": blocked".to_string(),
        };
        assert_eq!(e.to_string(), "Generation stopped (content_filter): blocked");
    }
}
